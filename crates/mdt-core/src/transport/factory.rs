//! Connection factory.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::device::DeviceConnection;
use super::host::HostConnection;
use super::traits::{Connection, Role, TransportError, Tunnel};
use crate::config::TransportConfig;
use crate::context::Context;
use crate::device::{DeviceInfo, DeviceKind};

/// Builds the connection matching a device's kind and this process's role.
pub struct TransportFactory {
    role: Role,
    config: TransportConfig,
    tunnels: HashMap<DeviceKind, Arc<dyn Tunnel>>,
}

impl TransportFactory {
    pub fn new(ctx: &Context, role: Role) -> Self {
        let tunnels = [DeviceKind::Android, DeviceKind::Ios]
            .into_iter()
            .filter_map(|kind| ctx.tunnel(kind).map(|tunnel| (kind, tunnel)))
            .collect();
        Self {
            role,
            config: ctx.config().transport.clone(),
            tunnels,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Port connections use unless told otherwise.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// A new, unconnected connection to `device`. No I/O happens here.
    pub fn create_connection(&self, device: &DeviceInfo) -> Result<Box<dyn Connection>, TransportError> {
        let kind = device.kind();
        if kind == DeviceKind::Unknown {
            return Err(TransportError::UnsupportedDevice(kind));
        }
        debug!(udid = %device.udid(), %kind, role = %self.role, "Creating connection");

        match self.role {
            Role::Host => {
                let tunnel = self
                    .tunnels
                    .get(&kind)
                    .cloned()
                    .ok_or(TransportError::TunnelUnavailable(kind))?;
                let conn = HostConnection::new(device.clone(), tunnel, self.config.host_handshake_timeout());
                let conn = match kind {
                    DeviceKind::Ios => conn.with_receive_timeout(self.config.ios_receive_timeout()),
                    _ => conn,
                };
                Ok(Box::new(conn))
            }
            Role::Device => Ok(Box::new(DeviceConnection::new(
                device.clone(),
                self.config.device_handshake_timeout(),
            ))),
        }
    }

    /// Create a connection and connect it on the configured port.
    #[instrument(skip(self, device), fields(udid = %device.udid()))]
    pub fn connect(&self, device: &DeviceInfo) -> Result<Box<dyn Connection>, TransportError> {
        let conn = self.create_connection(device)?;
        conn.connect(self.config.port)?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::ConnectionKind;
    use crate::transport::{ConnectionState, MockStream, MockTunnel};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn device(kind: DeviceKind) -> DeviceInfo {
        DeviceInfo::new("D1", "Test", kind, ConnectionKind::Usbmuxd)
    }

    #[test]
    fn test_unknown_kind_fails_fast() {
        let rt = runtime();
        let tunnel = Arc::new(MockTunnel::new());
        let ctx = Context::builder(Config::default(), rt.handle().clone())
            .tunnel(DeviceKind::Android, tunnel.clone())
            .build();

        for role in [Role::Host, Role::Device] {
            let factory = TransportFactory::new(&ctx, role);
            assert!(matches!(
                factory.create_connection(&device(DeviceKind::Unknown)),
                Err(TransportError::UnsupportedDevice(DeviceKind::Unknown))
            ));
        }
        assert!(tunnel.opened().is_empty());
    }

    #[test]
    fn test_host_without_tunnel() {
        let rt = runtime();
        let ctx = Context::builder(Config::default(), rt.handle().clone()).build();
        let factory = TransportFactory::new(&ctx, Role::Host);

        assert!(matches!(
            factory.create_connection(&device(DeviceKind::Ios)),
            Err(TransportError::TunnelUnavailable(DeviceKind::Ios))
        ));
    }

    #[test]
    fn test_host_connection_uses_kind_tunnel() {
        let rt = runtime();
        let stream = Arc::new(MockStream::new());
        stream.push_inbound(&1i32.to_le_bytes());
        let ios = Arc::new(MockTunnel::new());
        ios.push_stream(stream);
        let android = Arc::new(MockTunnel::new());

        let mut config = Config::default();
        config.transport.port = 7100;
        let ctx = Context::builder(config, rt.handle().clone())
            .tunnel(DeviceKind::Android, android.clone())
            .tunnel(DeviceKind::Ios, ios.clone())
            .build();

        let factory = TransportFactory::new(&ctx, Role::Host);
        let conn = factory.connect(&device(DeviceKind::Ios)).unwrap();

        assert_eq!(conn.role(), Role::Host);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(ios.opened(), vec![("D1".to_string(), 7100)]);
        assert!(android.opened().is_empty());
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    }

    fn dial(port: u16) -> TcpStream {
        for _ in 0..200 {
            if let Ok(stream) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
                return stream;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("device side never listened on {port}");
    }

    #[test]
    fn test_device_and_host_over_loopback() {
        let rt = runtime();
        let ctx = Context::builder(Config::default(), rt.handle().clone()).build();
        let factory = TransportFactory::new(&ctx, Role::Device);
        let conn = factory.create_connection(&device(DeviceKind::Android)).unwrap();
        assert_eq!(conn.role(), Role::Device);

        let port = free_port();
        let server = thread::spawn(move || {
            conn.connect(port).unwrap();
            let mut buf = vec![0u8; 10_000];
            assert_eq!(conn.receive(&mut buf).unwrap(), 10_000);
            conn.link().send_i32(10_000).unwrap();
            buf
        });

        let mut host = dial(port);
        host.write_all(&1i32.to_le_bytes()).unwrap();
        let mut ack = [0u8; 4];
        host.read_exact(&mut ack).unwrap();
        assert_eq!(i32::from_le_bytes(ack), 1);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        host.write_all(&payload).unwrap();
        host.read_exact(&mut ack).unwrap();
        assert_eq!(i32::from_le_bytes(ack), 10_000);

        assert_eq!(server.join().unwrap(), payload);
    }
}
