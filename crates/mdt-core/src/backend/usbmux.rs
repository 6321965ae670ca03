//! iOS discovery and tunnelling through usbmuxd.
//!
//! One socket stays open in listen mode while subscribed; every tunnel gets
//! a socket of its own, which usbmuxd hands over to the device port after a
//! successful CONNECT.

use std::collections::HashMap;
use std::env;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use nusb::MaybeFuture;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::traits::{Backend, DiscoveryError, EventSink, PushBackend, Subscription};
use crate::config::UsbmuxConfig;
use crate::device::{DeviceInfo, DeviceKind};
use crate::events::DeviceEventKind;
use crate::normalize::usbmux_event;
use crate::protocol::usbmux::{
    RESULT_BAD_DEVICE, RESULT_CONNECTION_REFUSED, RESULT_OK, read_reply,
};
use crate::protocol::{Reply, Request, UsbmuxError};
use crate::transport::{ByteStream, TransportError, Tunnel};

const BACKEND_NAME: &str = "usbmuxd";
pub const APPLE_VENDOR_ID: u16 = 0x05AC;
pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// How long a one-off listen waits for the attach burst usbmuxd sends
/// right after LISTEN.
const SNAPSHOT_WINDOW: Duration = Duration::from_millis(250);

/// Where usbmuxd accepts clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbmuxAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl UsbmuxAddress {
    /// Parse `UNIX:/path`, a bare absolute path, or `host:port`.
    pub fn parse(value: &str) -> Self {
        if let Some(path) = value.strip_prefix("UNIX:") {
            UsbmuxAddress::Unix(PathBuf::from(path))
        } else if value.starts_with('/') {
            UsbmuxAddress::Unix(PathBuf::from(value))
        } else {
            UsbmuxAddress::Tcp(value.to_string())
        }
    }

    /// Configured address, else the environment, else the platform default.
    pub fn resolve(config: &UsbmuxConfig) -> Self {
        if let Some(address) = config.socket_address.as_deref() {
            return Self::parse(address);
        }
        if let Ok(address) = env::var(SOCKET_ADDRESS_ENV)
            && !address.is_empty()
        {
            return Self::parse(&address);
        }
        Self::platform_default()
    }

    #[cfg(unix)]
    fn platform_default() -> Self {
        UsbmuxAddress::Unix(PathBuf::from("/var/run/usbmuxd"))
    }

    #[cfg(not(unix))]
    fn platform_default() -> Self {
        UsbmuxAddress::Tcp("127.0.0.1:27015".to_string())
    }
}

/// A client socket to usbmuxd, later possibly a device tunnel.
pub enum UsbmuxStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl UsbmuxStream {
    pub fn connect(address: &UsbmuxAddress) -> io::Result<Self> {
        match address {
            UsbmuxAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                stream.set_nodelay(true)?;
                Ok(UsbmuxStream::Tcp(stream))
            }
            #[cfg(unix)]
            UsbmuxAddress::Unix(path) => Ok(UsbmuxStream::Unix(UnixStream::connect(path)?)),
            #[cfg(not(unix))]
            UsbmuxAddress::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix socket {} not supported on this platform", path.display()),
            )),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            UsbmuxStream::Tcp(s) => Ok(UsbmuxStream::Tcp(s.try_clone()?)),
            #[cfg(unix)]
            UsbmuxStream::Unix(s) => Ok(UsbmuxStream::Unix(s.try_clone()?)),
        }
    }
}

impl Read for UsbmuxStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ByteStream::read(&*self, buf)
    }
}

impl Write for UsbmuxStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ByteStream::write(&*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for UsbmuxStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            UsbmuxStream::Tcp(s) => Read::read(&mut &*s, buf),
            #[cfg(unix)]
            UsbmuxStream::Unix(s) => Read::read(&mut &*s, buf),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            UsbmuxStream::Tcp(s) => Write::write(&mut &*s, buf),
            #[cfg(unix)]
            UsbmuxStream::Unix(s) => Write::write(&mut &*s, buf),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            UsbmuxStream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            UsbmuxStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            UsbmuxStream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            UsbmuxStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

/// Push backend for iOS devices.
pub struct UsbmuxBackend {
    address: UsbmuxAddress,
    next_tag: AtomicU32,
    /// usbmuxd device id to UDID, fed by the listen thread.
    devices: Arc<Mutex<HashMap<u32, String>>>,
}

impl UsbmuxBackend {
    pub fn new(config: &UsbmuxConfig) -> Self {
        Self::with_address(UsbmuxAddress::resolve(config))
    }

    pub fn with_address(address: UsbmuxAddress) -> Self {
        Self {
            address,
            next_tag: AtomicU32::new(1),
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn address(&self) -> &UsbmuxAddress {
        &self.address
    }

    fn open_socket(&self) -> Result<UsbmuxStream, DiscoveryError> {
        UsbmuxStream::connect(&self.address).map_err(|e| DiscoveryError::BackendUnavailable {
            backend: BACKEND_NAME,
            reason: format!("{:?}: {e}", self.address),
        })
    }

    /// Send `request` and return the result code of the matching reply.
    fn exchange(&self, stream: &mut UsbmuxStream, request: Request) -> Result<u32, DiscoveryError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        stream.write_all(&request.encode(tag))?;
        loop {
            match read_reply(stream)? {
                (reply_tag, Reply::Result(code)) if reply_tag == tag => return Ok(code),
                (_, other) => debug!(?other, "Skipping message while awaiting result"),
            }
        }
    }

    /// A socket in listen mode. usbmuxd follows the RESULT with one
    /// DEVICE_ADD per attached device.
    fn listen_socket(&self) -> Result<UsbmuxStream, DiscoveryError> {
        let mut stream = self.open_socket()?;
        let code = self.exchange(&mut stream, Request::Listen)?;
        if code != RESULT_OK {
            return Err(DiscoveryError::BackendUnavailable {
                backend: BACKEND_NAME,
                reason: format!("listen refused with result {code}"),
            });
        }
        Ok(stream)
    }

    /// Devices attached right now, via a short-lived listen socket.
    #[instrument(skip(self))]
    pub fn snapshot(&self) -> Result<Vec<String>, DiscoveryError> {
        let mut stream = self.listen_socket()?;

        ByteStream::set_read_timeout(&stream, Some(SNAPSHOT_WINDOW))?;
        let mut registry = HashMap::new();
        let mut serials = Vec::new();
        loop {
            match read_reply(&mut stream) {
                Ok((_, reply)) => {
                    let Some(event) = usbmux_event(&reply, &mut registry) else {
                        continue;
                    };
                    match event.kind {
                        DeviceEventKind::Added if !serials.contains(&event.udid) => {
                            serials.push(event.udid)
                        }
                        DeviceEventKind::Removed => serials.retain(|s| s != &event.udid),
                        _ => {}
                    }
                }
                Err(UsbmuxError::Io(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let _ = ByteStream::shutdown(&stream);

        self.devices.lock().extend(registry);
        Ok(serials)
    }

    fn device_id(&self, udid: &str) -> Option<u32> {
        self.devices
            .lock()
            .iter()
            .find_map(|(id, serial)| (serial == udid).then_some(*id))
    }
}

impl Backend for UsbmuxBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Ios
    }

    /// Product string of the attached Apple USB device whose serial is the
    /// UDID without dashes.
    fn resolve_name(&self, udid: &str) -> Result<String, DiscoveryError> {
        let failed = |reason: String| DiscoveryError::NameResolutionFailed {
            udid: udid.to_string(),
            reason,
        };
        let serial = udid.replace('-', "");

        let device = nusb::list_devices()
            .wait()
            .map_err(|e| failed(e.to_string()))?
            .filter(|d| d.vendor_id() == APPLE_VENDOR_ID)
            .find(|d| d.serial_number().is_some_and(|s| s.eq_ignore_ascii_case(&serial)))
            .ok_or_else(|| failed("no matching USB device".to_string()))?;

        device
            .product_string()
            .map(str::to_string)
            .ok_or_else(|| failed("device has no product string".to_string()))
    }
}

impl PushBackend for UsbmuxBackend {
    #[instrument(skip(self, sink), fields(address = ?self.address))]
    fn subscribe(&self, sink: EventSink) -> Result<Subscription, DiscoveryError> {
        let stream = self.listen_socket()?;

        let control = stream.try_clone()?;
        let stopped = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let handle = {
            let listener = Listener {
                sink,
                devices: self.devices.clone(),
                stopped: stopped.clone(),
                alive: alive.clone(),
            };
            thread::Builder::new()
                .name("usbmux-listen".into())
                .spawn(move || listener.run(stream))?
        };
        info!("Listening for iOS devices");

        let subscription = Subscription::new(move || {
            stopped.store(true, Ordering::SeqCst);
            let _ = ByteStream::shutdown(&control);
            if handle.join().is_err() {
                warn!("usbmux listen thread panicked");
            }
        });
        Ok(subscription.with_liveness(alive))
    }
}

/// State owned by the listen thread.
struct Listener {
    sink: EventSink,
    devices: Arc<Mutex<HashMap<u32, String>>>,
    stopped: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl Listener {
    fn run(self, mut stream: UsbmuxStream) {
        loop {
            match read_reply(&mut stream) {
                Ok((_, reply)) => {
                    let event = usbmux_event(&reply, &mut self.devices.lock());
                    if let Some(event) = event {
                        debug!(udid = %event.udid, kind = %event.kind, "usbmuxd event");
                        (self.sink)(event);
                    }
                }
                // The whole frame was consumed, so the stream is still in sync.
                Err(e @ (UsbmuxError::UnknownMessage(_) | UsbmuxError::Truncated { .. })) => {
                    debug!(error = %e, "Skipping undecodable usbmuxd message");
                }
                Err(e) => {
                    if !self.stopped.load(Ordering::SeqCst) {
                        warn!(error = %e, "usbmuxd listen connection lost, iOS discovery stopped");
                    }
                    self.alive.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
}

impl Tunnel for UsbmuxBackend {
    #[instrument(skip(self, device), fields(udid = %device.udid()))]
    fn open(&self, device: &DeviceInfo, port: u16) -> Result<Arc<dyn ByteStream>, TransportError> {
        let failed = |e: DiscoveryError| TransportError::ConnectionFailed(e.to_string());

        let device_id = match self.device_id(device.udid()) {
            Some(id) => Some(id),
            None => {
                self.snapshot().map_err(failed)?;
                self.device_id(device.udid())
            }
        }
        .ok_or_else(|| TransportError::NoDevice {
            udid: device.udid().to_string(),
        })?;

        let mut stream = self.open_socket().map_err(failed)?;
        let code = self
            .exchange(&mut stream, Request::Connect { device_id, port })
            .map_err(failed)?;

        match code {
            RESULT_OK => {
                info!(device_id, port, "usbmuxd tunnel open");
                Ok(Arc::new(stream))
            }
            RESULT_BAD_DEVICE => Err(TransportError::NoDevice {
                udid: device.udid().to_string(),
            }),
            RESULT_CONNECTION_REFUSED => Err(TransportError::ConnectionFailed(format!(
                "device refused port {port}"
            ))),
            other => Err(TransportError::ConnectionFailed(format!(
                "usbmuxd result {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionKind;
    use crate::protocol::DeviceRecord;
    use crate::protocol::usbmux::{
        HEADER_SIZE, Header, MESSAGE_CONNECT, MESSAGE_LISTEN,
    };
    use byteorder::{BigEndian, ByteOrder, LittleEndian};
    use std::net::TcpListener;

    const UDID: &str = "00008030-001A2C3E0C38802E";

    /// Read one client request, returning its header and payload.
    fn read_request(stream: &mut TcpStream) -> (Header, Vec<u8>) {
        let mut raw = [0u8; HEADER_SIZE];
        stream.read_exact(&mut raw).unwrap();
        let header = Header::from_bytes(&raw);
        let mut payload = vec![0u8; header.length as usize - HEADER_SIZE];
        stream.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    fn record(device_id: u32) -> Reply {
        Reply::DeviceAdd(DeviceRecord {
            device_id,
            product_id: 0x12a8,
            serial: UDID.to_string(),
            location: 0x1410_0000,
        })
    }

    fn fake_daemon() -> (TcpListener, UsbmuxBackend) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = UsbmuxAddress::Tcp(listener.local_addr().unwrap().to_string());
        (listener, UsbmuxBackend::with_address(address))
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            UsbmuxAddress::parse("UNIX:/tmp/usbmuxd"),
            UsbmuxAddress::Unix(PathBuf::from("/tmp/usbmuxd"))
        );
        assert_eq!(
            UsbmuxAddress::parse("/var/run/usbmuxd"),
            UsbmuxAddress::Unix(PathBuf::from("/var/run/usbmuxd"))
        );
        assert_eq!(
            UsbmuxAddress::parse("127.0.0.1:27015"),
            UsbmuxAddress::Tcp("127.0.0.1:27015".to_string())
        );

        let config = UsbmuxConfig {
            socket_address: Some("10.0.0.2:27015".to_string()),
        };
        assert_eq!(
            UsbmuxAddress::resolve(&config),
            UsbmuxAddress::Tcp("10.0.0.2:27015".to_string())
        );
    }

    #[test]
    fn test_subscribe_delivers_normalized_events() {
        let (listener, backend) = fake_daemon();
        let daemon = thread::spawn(move || {
            let (mut client, _) = listener.accept().unwrap();
            let (header, _) = read_request(&mut client);
            assert_eq!(header.message, MESSAGE_LISTEN);
            client.write_all(&Reply::Result(0).encode(header.tag)).unwrap();
            client.write_all(&record(7).encode(0)).unwrap();
            client.write_all(&Reply::DevicePaired(7).encode(0)).unwrap();
            client.write_all(&Reply::DeviceRemove(99).encode(0)).unwrap();
            client.write_all(&Reply::DeviceRemove(7).encode(0)).unwrap();
            client
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let subscription = backend
            .subscribe(Arc::new(move |event| {
                let _ = tx.send(event);
            }))
            .unwrap();

        let timeout = Duration::from_secs(5);
        let kinds: Vec<DeviceEventKind> = (0..3)
            .map(|_| rx.recv_timeout(timeout).unwrap())
            .inspect(|event| {
                assert_eq!(event.udid, UDID);
                assert_eq!(event.device_kind, DeviceKind::Ios);
                assert_eq!(event.connection, ConnectionKind::Usbmuxd);
            })
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                DeviceEventKind::Added,
                DeviceEventKind::Paired,
                DeviceEventKind::Removed
            ]
        );

        let _client = daemon.join().unwrap();
        subscription.unsubscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_listen_skips_unknown_message() {
        let (listener, backend) = fake_daemon();
        let daemon = thread::spawn(move || {
            let (mut client, _) = listener.accept().unwrap();
            let (header, _) = read_request(&mut client);
            client.write_all(&Reply::Result(0).encode(header.tag)).unwrap();

            let unknown = Header {
                length: HEADER_SIZE as u32 + 4,
                version: 0,
                message: 8,
                tag: 0,
            };
            client.write_all(&unknown.to_bytes()).unwrap();
            client.write_all(&[0xAA; 4]).unwrap();
            client.write_all(&record(7).encode(0)).unwrap();
            client
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let subscription = backend
            .subscribe(Arc::new(move |event| {
                let _ = tx.send(event);
            }))
            .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.udid, UDID);
        assert_eq!(event.kind, DeviceEventKind::Added);
        assert!(subscription.is_alive());

        let _client = daemon.join().unwrap();
    }

    #[test]
    fn test_lost_daemon_marks_subscription_dead() {
        let (listener, backend) = fake_daemon();
        let daemon = thread::spawn(move || {
            let (mut client, _) = listener.accept().unwrap();
            let (header, _) = read_request(&mut client);
            client.write_all(&Reply::Result(0).encode(header.tag)).unwrap();
            client.write_all(&record(7).encode(0)).unwrap();
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let subscription = backend
            .subscribe(Arc::new(move |event| {
                let _ = tx.send(event);
            }))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        daemon.join().unwrap();

        for _ in 0..500 {
            if !subscription.is_alive() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!subscription.is_alive());
    }

    #[test]
    fn test_listen_refused_is_unavailable() {
        let (listener, backend) = fake_daemon();
        let daemon = thread::spawn(move || {
            let (mut client, _) = listener.accept().unwrap();
            let (header, _) = read_request(&mut client);
            client.write_all(&Reply::Result(6).encode(header.tag)).unwrap();
        });

        let err = backend.subscribe(Arc::new(|_| {})).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::BackendUnavailable { backend: "usbmuxd", .. }
        ));
        daemon.join().unwrap();
    }

    #[test]
    fn test_missing_daemon_is_unavailable() {
        let backend = UsbmuxBackend::with_address(UsbmuxAddress::Tcp("127.0.0.1:1".to_string()));
        assert!(matches!(
            backend.subscribe(Arc::new(|_| {})),
            Err(DiscoveryError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn test_tunnel_connects_after_snapshot() {
        let (listener, backend) = fake_daemon();
        let daemon = thread::spawn(move || {
            // Snapshot socket.
            let (mut client, _) = listener.accept().unwrap();
            let (header, _) = read_request(&mut client);
            assert_eq!(header.message, MESSAGE_LISTEN);
            client.write_all(&Reply::Result(0).encode(header.tag)).unwrap();
            client.write_all(&record(3).encode(0)).unwrap();

            // Tunnel socket.
            let (mut tunnel, _) = listener.accept().unwrap();
            let (header, payload) = read_request(&mut tunnel);
            assert_eq!(header.message, MESSAGE_CONNECT);
            assert_eq!(LittleEndian::read_u32(&payload[0..4]), 3);
            assert_eq!(BigEndian::read_u16(&payload[4..6]), 7000);
            tunnel.write_all(&Reply::Result(0).encode(header.tag)).unwrap();

            let mut ping = [0u8; 4];
            tunnel.read_exact(&mut ping).unwrap();
            tunnel.write_all(&ping).unwrap();
            (client, tunnel)
        });

        let info = DeviceInfo::new(UDID, "", DeviceKind::Ios, ConnectionKind::Usbmuxd);
        let stream = backend.open(&info, 7000).unwrap();
        assert_eq!(stream.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += stream.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
        let _ = daemon.join().unwrap();
    }

    #[test]
    fn test_tunnel_bad_device() {
        let (listener, backend) = fake_daemon();
        backend.devices.lock().insert(5, UDID.to_string());
        let daemon = thread::spawn(move || {
            let (mut tunnel, _) = listener.accept().unwrap();
            let (header, _) = read_request(&mut tunnel);
            tunnel
                .write_all(&Reply::Result(RESULT_BAD_DEVICE).encode(header.tag))
                .unwrap();
        });

        let info = DeviceInfo::new(UDID, "", DeviceKind::Ios, ConnectionKind::Usbmuxd);
        assert!(matches!(
            backend.open(&info, 7000),
            Err(TransportError::NoDevice { .. })
        ));
        daemon.join().unwrap();
    }
}
