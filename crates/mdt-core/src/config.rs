//! Configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub transport: TransportConfig,
    pub android: AdbConfig,
    pub ios: UsbmuxConfig,
}

/// Device watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Interval between two polls of the Android backend.
    pub poll_interval_ms: u64,
    pub enable_android: bool,
    pub enable_ios: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            enable_android: true,
            enable_ios: true,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Connection and handshake settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Port the device-side listener binds and the host dials.
    pub port: u16,
    pub host_handshake_timeout_ms: u64,
    pub device_handshake_timeout_ms: u64,
    /// Per-attempt receive bound for Host to iOS connections. 0 blocks.
    pub ios_receive_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7000,
            host_handshake_timeout_ms: 1500,
            device_handshake_timeout_ms: 15000,
            ios_receive_timeout_ms: 0,
        }
    }
}

impl TransportConfig {
    pub fn host_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.host_handshake_timeout_ms)
    }

    pub fn device_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.device_handshake_timeout_ms)
    }

    pub fn ios_receive_timeout(&self) -> Option<Duration> {
        (self.ios_receive_timeout_ms > 0).then(|| Duration::from_millis(self.ios_receive_timeout_ms))
    }
}

/// Android Debug Bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    pub adb_path: String,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
        }
    }
}

/// usbmuxd settings.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbmuxConfig {
    /// `UNIX:/path`, a bare path, or `host:port`. Falls back to the
    /// `USBMUXD_SOCKET_ADDRESS` variable, then the platform default.
    pub socket_address: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
