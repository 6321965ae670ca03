//! Host-side connection: dials the device through a tunnel.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use super::link::Link;
use super::traits::{Connection, Role, TransportError, Tunnel};
use crate::device::DeviceInfo;
use crate::protocol::handshake;

pub struct HostConnection {
    info: DeviceInfo,
    tunnel: Arc<dyn Tunnel>,
    link: Link,
    handshake_timeout: Duration,
}

impl HostConnection {
    pub fn new(info: DeviceInfo, tunnel: Arc<dyn Tunnel>, handshake_timeout: Duration) -> Self {
        Self {
            info,
            tunnel,
            link: Link::new(),
            handshake_timeout,
        }
    }

    /// Bound each receive attempt once connected. iOS connections use this;
    /// `None` blocks.
    pub fn with_receive_timeout(self, timeout: Option<Duration>) -> Self {
        // Only fails with a stream attached, and there is none yet.
        let _ = self.link.set_receive_timeout(timeout);
        self
    }
}

impl Connection for HostConnection {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn role(&self) -> Role {
        Role::Host
    }

    fn link(&self) -> &Link {
        &self.link
    }

    #[instrument(skip(self), fields(udid = %self.info.udid(), kind = %self.info.kind()))]
    fn connect(&self, port: u16) -> Result<(), TransportError> {
        let stream = match self.tunnel.open(&self.info, port) {
            Ok(stream) => stream,
            Err(e) => {
                self.link.dispose();
                return Err(e);
            }
        };
        self.link.attach(stream)?;
        info!(port, "Tunnel open");

        handshake(&self.link, Role::Host, self.handshake_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionKind, DeviceKind};
    use crate::transport::{ConnectionState, HandshakeFailure, MockStream, MockTunnel};

    fn android() -> DeviceInfo {
        DeviceInfo::new("A1", "", DeviceKind::Android, ConnectionKind::Usbmuxd)
    }

    #[test]
    fn test_connect_opens_tunnel_and_handshakes() {
        let stream = Arc::new(MockStream::new());
        stream.push_inbound(&1i32.to_le_bytes());
        let tunnel = Arc::new(MockTunnel::new());
        tunnel.push_stream(stream.clone());

        let conn = HostConnection::new(android(), tunnel.clone(), Duration::from_millis(100));
        conn.connect(7000).unwrap();

        assert_eq!(tunnel.opened(), vec![("A1".to_string(), 7000)]);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(stream.written(), vec![1, 0, 0, 0]);

        assert_eq!(conn.send(b"payload").unwrap(), 7);
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_missing_device() {
        let tunnel = Arc::new(MockTunnel::new());
        let conn = HostConnection::new(android(), tunnel, Duration::from_millis(100));

        assert!(matches!(
            conn.connect(7000),
            Err(TransportError::NoDevice { udid }) if udid == "A1"
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_silent_device_times_out() {
        let stream = Arc::new(MockStream::new());
        let tunnel = Arc::new(MockTunnel::new());
        tunnel.push_stream(stream.clone());

        let conn = HostConnection::new(android(), tunnel, Duration::from_millis(30));
        let err = conn.connect(7000).unwrap_err();

        assert!(matches!(
            err,
            TransportError::HandshakeFailed(HandshakeFailure::Timeout { .. })
        ));
        assert!(stream.is_shut_down());
        assert!(matches!(conn.send(&[1]), Err(TransportError::Closed)));
    }

    #[test]
    fn test_reconnect_requires_new_connection() {
        let first = Arc::new(MockStream::new());
        first.push_inbound(&1i32.to_le_bytes());
        let tunnel = Arc::new(MockTunnel::new());
        tunnel.push_stream(first);
        tunnel.push_stream(Arc::new(MockStream::new()));

        let conn = HostConnection::new(android(), tunnel, Duration::from_millis(100));
        conn.connect(7000).unwrap();
        conn.disconnect();

        assert!(matches!(
            conn.connect(7000),
            Err(TransportError::InvalidState(ConnectionState::Disconnected))
        ));
    }

    #[test]
    fn test_receive_timeout_applies_after_connect() {
        let stream = Arc::new(MockStream::new());
        stream.push_inbound(&1i32.to_le_bytes());
        let tunnel = Arc::new(MockTunnel::new());
        tunnel.push_stream(stream);

        let ios = DeviceInfo::new("U1", "", DeviceKind::Ios, ConnectionKind::Usbmuxd);
        let conn = HostConnection::new(ios, tunnel, Duration::from_millis(100))
            .with_receive_timeout(Some(Duration::from_millis(20)));
        conn.connect(7000).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.receive(&mut buf),
            Err(TransportError::Timeout { timeout_ms: 20 })
        ));
    }
}
