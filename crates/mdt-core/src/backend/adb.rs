//! Android discovery and tunnelling through the `adb` command-line tool.

use std::io;
use std::net::{Ipv4Addr, TcpStream};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::traits::{Backend, DiscoveryError, PollBackend};
use crate::config::AdbConfig;
use crate::device::{DeviceInfo, DeviceKind};
use crate::transport::{ByteStream, TransportError, Tunnel};

const BACKEND_NAME: &str = "adb";
const MANUFACTURER_PROPERTY: &str = "ro.product.manufacturer";
const MODEL_PROPERTY: &str = "ro.product.model";

/// Poll backend for Android devices.
#[derive(Debug, Clone)]
pub struct AdbBackend {
    adb_path: String,
}

impl AdbBackend {
    pub fn new(config: &AdbConfig) -> Self {
        Self {
            adb_path: config.adb_path.clone(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, DiscoveryError> {
        let command = format!("{} {}", self.adb_path, args.join(" "));
        debug!(%command, "Running adb");

        let output = Command::new(&self.adb_path)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DiscoveryError::BackendUnavailable {
                    backend: BACKEND_NAME,
                    reason: format!("{} not found", self.adb_path),
                },
                _ => DiscoveryError::Io(e),
            })?;

        if !output.status.success() {
            return Err(DiscoveryError::Command {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn getprop(&self, serial: &str, property: &str) -> Result<String, DiscoveryError> {
        self.run(&["-s", serial, "shell", "getprop", property])
            .map(|value| value.trim().to_string())
    }

    /// Map `tcp:<local>` on this machine to `tcp:<remote>` on the device.
    #[instrument(skip(self))]
    pub fn forward(&self, serial: &str, local: u16, remote: u16) -> Result<(), DiscoveryError> {
        let local = format!("tcp:{local}");
        let remote = format!("tcp:{remote}");
        self.run(&["-s", serial, "forward", &local, &remote])?;
        Ok(())
    }
}

impl Backend for AdbBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Android
    }

    fn resolve_name(&self, udid: &str) -> Result<String, DiscoveryError> {
        let failed = |e: DiscoveryError| DiscoveryError::NameResolutionFailed {
            udid: udid.to_string(),
            reason: e.to_string(),
        };
        let manufacturer = self.getprop(udid, MANUFACTURER_PROPERTY).map_err(failed)?;
        let model = self.getprop(udid, MODEL_PROPERTY).map_err(failed)?;

        if manufacturer.is_empty() && model.is_empty() {
            return Err(DiscoveryError::NameResolutionFailed {
                udid: udid.to_string(),
                reason: "device reported no product properties".to_string(),
            });
        }
        Ok(format_device_name(&manufacturer, &model))
    }
}

impl PollBackend for AdbBackend {
    #[instrument(skip(self))]
    fn probe(&self) -> Result<(), DiscoveryError> {
        self.run(&["start-server"])
            .map_err(|e| DiscoveryError::BackendUnavailable {
                backend: BACKEND_NAME,
                reason: e.to_string(),
            })?;
        info!("adb server running");
        Ok(())
    }

    fn list_connected(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(parse_device_list(&self.run(&["devices"])?))
    }
}

impl Tunnel for AdbBackend {
    /// Forward the device port to the same local port, then dial it.
    #[instrument(skip(self, device), fields(udid = %device.udid()))]
    fn open(&self, device: &DeviceInfo, port: u16) -> Result<Arc<dyn ByteStream>, TransportError> {
        let listed = self
            .list_connected()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if !listed.iter().any(|s| s == device.udid()) {
            return Err(TransportError::NoDevice {
                udid: device.udid().to_string(),
            });
        }

        self.forward(device.udid(), port, port)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .map_err(|e| TransportError::ConnectionFailed(format!("dial forwarded port {port}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(stream))
    }
}

/// Serials of the reachable devices in `adb devices` output, in order.
/// Devices that are offline or unauthorized are skipped.
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*') && !line.starts_with("List of devices"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Display name from the product properties, e.g. `("SAMSUNG", "SM-G991B")`
/// becomes `"Samsung SM-G991B"`.
pub fn format_device_name(manufacturer: &str, model: &str) -> String {
    let mut name: String = manufacturer
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                '_'
            }
        })
        .collect();

    if let Some(first) = name.chars().next() {
        let upper: String = first.to_uppercase().collect();
        name.replace_range(..first.len_utf8(), &upper);
    }

    if !model.is_empty() {
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(model);
    }
    name
}
