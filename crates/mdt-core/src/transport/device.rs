//! Device-side connection: listens on the phone's loopback interface and
//! accepts exactly one peer.
//!
//! The USB multiplexer on the host end (adb forward or usbmuxd) delivers
//! the host's connection to this listener.

use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use super::link::Link;
use super::traits::{ByteStream, Connection, ConnectionState, Role, TransportError};
use crate::device::DeviceInfo;
use crate::protocol::handshake;

/// How often a pending accept checks whether the connection was disposed.
const ACCEPT_POLL: Duration = Duration::from_millis(25);

pub struct DeviceConnection {
    info: DeviceInfo,
    link: Link,
    listener: Mutex<Option<TcpListener>>,
    handshake_timeout: Duration,
}

impl DeviceConnection {
    pub fn new(info: DeviceInfo, handshake_timeout: Duration) -> Self {
        Self {
            info,
            link: Link::new(),
            listener: Mutex::new(None),
            handshake_timeout,
        }
    }

    /// Bind the listener and return the bound port, which differs from
    /// `port` when `port` is 0. Binding again keeps the first listener.
    pub fn listen(&self, port: u16) -> Result<u16, TransportError> {
        if self.link.state() != ConnectionState::Unconnected {
            return Err(TransportError::InvalidState(self.link.state()));
        }

        let mut listener = self.listener.lock();
        if let Some(existing) = listener.as_ref() {
            return Ok(existing.local_addr()?.port());
        }

        let bound = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .map_err(|e| TransportError::ConnectionFailed(format!("bind port {port}: {e}")))?;
        let local = bound.local_addr()?.port();
        info!(port = local, "Listening");
        *listener = Some(bound);
        Ok(local)
    }

    /// Adopt a stream accepted elsewhere and run the device handshake on it.
    pub fn connect_stream(&self, stream: Arc<dyn ByteStream>) -> Result<(), TransportError> {
        self.link.attach(stream)?;
        handshake(&self.link, Role::Device, self.handshake_timeout)
    }

    fn accept(&self) -> Result<TcpStream, TransportError> {
        let listener = self
            .listener
            .lock()
            .as_ref()
            .map(TcpListener::try_clone)
            .transpose()?
            .ok_or(TransportError::NotConnected)?;
        listener.set_nonblocking(true)?;

        loop {
            if self.listener.lock().is_none() {
                return Err(TransportError::Closed);
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    info!(%peer, "Peer accepted");
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
            }
        }
    }

    fn close_listener(&self) {
        if self.listener.lock().take().is_some() {
            debug!("Listener closed");
        }
    }
}

impl Connection for DeviceConnection {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn role(&self) -> Role {
        Role::Device
    }

    fn link(&self) -> &Link {
        &self.link
    }

    /// Listen on `port` (unless [`listen`](Self::listen) already bound one),
    /// block until the host connects, then answer its handshake.
    #[instrument(skip(self), fields(udid = %self.info.udid()))]
    fn connect(&self, port: u16) -> Result<(), TransportError> {
        let accepted = self.listen(port).and_then(|_| self.accept());
        self.close_listener();

        match accepted {
            Ok(stream) => self.connect_stream(Arc::new(stream)),
            Err(e) => {
                self.link.dispose();
                Err(e)
            }
        }
    }

    fn disconnect(&self) {
        self.link.disconnect();
        self.close_listener();
    }

    fn dispose(&self) {
        self.close_listener();
        self.link.dispose();
    }
}
