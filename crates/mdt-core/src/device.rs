//! Device identity records.
//!
//! A [`DeviceInfo`] is keyed by its UDID alone: two records with the same
//! UDID are the same device even when the name or connection kind differ.
//! The watcher's known-device set depends on this.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Family of a mobile device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Android,
    Ios,
    Unknown,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Android => write!(f, "Android"),
            DeviceKind::Ios => write!(f, "iOS"),
            DeviceKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Transport medium a device is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// USB, multiplexed by usbmuxd or adb.
    Usbmuxd,
    /// Network (Wi-Fi) pairing.
    Network,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Usbmuxd => write!(f, "usbmuxd"),
            ConnectionKind::Network => write!(f, "network"),
        }
    }
}

/// Identity record of a discovered device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    udid: String,
    name: String,
    kind: DeviceKind,
    connection: ConnectionKind,
}

impl DeviceInfo {
    pub fn new(
        udid: impl Into<String>,
        name: impl Into<String>,
        kind: DeviceKind,
        connection: ConnectionKind,
    ) -> Self {
        Self {
            udid: udid.into(),
            name: name.into(),
            kind,
            connection,
        }
    }

    /// Stable unique identifier (serial number on Android, UDID on iOS).
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Human-readable name. Empty until resolved.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn connection(&self) -> ConnectionKind {
        self.connection
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    /// Copy of this record carrying `name`.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

impl PartialEq for DeviceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.udid == other.udid
    }
}

impl Eq for DeviceInfo {}

impl Hash for DeviceInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must hash exactly like `str` so `Borrow<str>` lookups work.
        self.udid.hash(state);
    }
}

impl Borrow<str> for DeviceInfo {
    fn borrow(&self) -> &str {
        &self.udid
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.udid, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fields_round_trip() {
        let info = DeviceInfo::new("A1", "Pixel", DeviceKind::Android, ConnectionKind::Usbmuxd);
        assert_eq!(info.udid(), "A1");
        assert_eq!(info.name(), "Pixel");
        assert_eq!(info.kind(), DeviceKind::Android);
        assert_eq!(info.connection(), ConnectionKind::Usbmuxd);
        assert!(info.has_name());
    }

    #[test]
    fn test_equality_by_udid_only() {
        let a = DeviceInfo::new("X", "", DeviceKind::Ios, ConnectionKind::Usbmuxd);
        let b = DeviceInfo::new("X", "iPhone", DeviceKind::Ios, ConnectionKind::Network);
        let c = DeviceInfo::new("Y", "iPhone", DeviceKind::Ios, ConnectionKind::Network);
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_set_lookup_by_str() {
        let mut set = HashSet::new();
        set.insert(DeviceInfo::new("X", "", DeviceKind::Ios, ConnectionKind::Usbmuxd));
        assert!(!set.insert(DeviceInfo::new(
            "X",
            "renamed",
            DeviceKind::Ios,
            ConnectionKind::Usbmuxd
        )));
        assert_eq!(set.len(), 1);
        assert!(set.contains("X"));
        assert!(set.get("X").is_some_and(|d| d.name().is_empty()));
    }

    #[test]
    fn test_display() {
        let info = DeviceInfo::new("A1", "Pixel", DeviceKind::Android, ConnectionKind::Usbmuxd);
        assert_eq!(info.to_string(), "A1 (Pixel)");
        assert_eq!(DeviceKind::Ios.to_string(), "iOS");
    }
}
