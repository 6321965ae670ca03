//! Device change events and observer registration.
//!
//! Backends produce [`DeviceEvent`]s; the watcher consumes each one exactly
//! once and republishes it to the observers registered here.

use std::fmt;

use crate::device::{ConnectionKind, DeviceInfo, DeviceKind};

/// What happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    Added,
    Removed,
    Paired,
}

impl fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEventKind::Added => write!(f, "added"),
            DeviceEventKind::Removed => write!(f, "removed"),
            DeviceEventKind::Paired => write!(f, "paired"),
        }
    }
}

/// Canonical change notification produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub udid: String,
    pub device_kind: DeviceKind,
    pub kind: DeviceEventKind,
    pub connection: ConnectionKind,
}

impl DeviceEvent {
    pub fn new(
        udid: impl Into<String>,
        device_kind: DeviceKind,
        kind: DeviceEventKind,
        connection: ConnectionKind,
    ) -> Self {
        Self {
            udid: udid.into(),
            device_kind,
            kind,
            connection,
        }
    }

    /// Fresh record for a device first seen through this event. The name is
    /// left empty.
    pub fn to_device_info(&self) -> DeviceInfo {
        DeviceInfo::new(self.udid.clone(), "", self.device_kind, self.connection)
    }
}

/// Handle returned by observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&DeviceInfo) + Send>;

/// Registry of added/removed/paired callbacks, keyed by [`ObserverId`].
#[derive(Default)]
pub struct Observers {
    next_id: u64,
    entries: Vec<(ObserverId, DeviceEventKind, Callback)>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: DeviceEventKind, callback: F) -> ObserverId
    where
        F: FnMut(&DeviceInfo) + Send + 'static,
    {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push((id, kind, Box::new(callback)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke every callback registered for `kind`, in registration order.
    pub fn notify(&mut self, kind: DeviceEventKind, device: &DeviceInfo) {
        match kind {
            DeviceEventKind::Added => tracing::info!(
                udid = %device.udid(),
                name = %device.name(),
                kind = %device.kind(),
                connection = %device.connection(),
                "Device added"
            ),
            DeviceEventKind::Removed => {
                tracing::info!(udid = %device.udid(), kind = %device.kind(), "Device removed")
            }
            DeviceEventKind::Paired => {
                tracing::info!(udid = %device.udid(), kind = %device.kind(), "Device paired")
            }
        }

        for (_, entry_kind, callback) in self.entries.iter_mut() {
            if *entry_kind == kind {
                callback(device);
            }
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.entries.len())
            .finish()
    }
}
