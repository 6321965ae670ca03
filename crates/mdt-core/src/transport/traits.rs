//! Transport layer abstraction.
//!
//! Defines the byte-stream capability the connections run on, the
//! [`Connection`] interface shared by every role and device kind, and the
//! [`Tunnel`] seam a host connection dials through.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::link::Link;
use crate::device::{DeviceInfo, DeviceKind};

/// Why a handshake did not complete.
#[derive(Error, Debug)]
pub enum HandshakeFailure {
    #[error("no answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("expected {expected}, received {received}")]
    ProtocolMismatch { expected: i32, received: i32 },

    #[error("peer closed the connection")]
    Closed,

    #[error("{0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {udid}")]
    NoDevice { udid: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported device kind: {0}")]
    UnsupportedDevice(DeviceKind),

    #[error("No tunnel available for {0} devices")]
    TunnelUnavailable(DeviceKind),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid connection state: {0}")]
    InvalidState(ConnectionState),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the error means the connection is gone rather than that a
    /// request was malformed or interrupted.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::NotConnected)
    }
}

/// Which side of the link a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Desktop side. Dials the device.
    Host,
    /// Phone side. Listens and accepts one peer.
    Device,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Device => write!(f, "device"),
        }
    }
}

/// Connection lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconnected => write!(f, "unconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A full-duplex byte pipe.
///
/// A single `read`/`write` may move fewer bytes than asked for. `Ok(0)`
/// means the peer is gone.
pub trait ByteStream: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Bound every following `read` call. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close both directions. Blocked reads return.
    fn shutdown(&self) -> io::Result<()>;
}

impl ByteStream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Opens a byte stream to a port on a specific device through the
/// platform's USB multiplexer.
pub trait Tunnel: Send + Sync {
    fn open(&self, device: &DeviceInfo, port: u16) -> Result<Arc<dyn ByteStream>, TransportError>;
}

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// A connection to the peer process, for one role and device kind.
///
/// Implementations provide `connect`; everything else runs on the shared
/// [`Link`].
pub trait Connection: Send + Sync {
    fn device_info(&self) -> &DeviceInfo;

    fn role(&self) -> Role;

    fn link(&self) -> &Link;

    /// Establish the byte stream and run the handshake. A failed attempt
    /// leaves the connection disposed.
    fn connect(&self, port: u16) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState {
        self.link().state()
    }

    /// Graceful shutdown. Never fails, even when already disconnected.
    fn disconnect(&self) {
        self.link().disconnect();
    }

    /// Release every OS handle. Safe to call any number of times.
    fn dispose(&self) {
        self.link().dispose();
    }

    /// Send all of `buf`, looping over partial writes. A short count means
    /// the peer closed.
    fn send(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.link().send(buf)
    }

    /// Fill all of `buf`, looping over partial reads. A short count means
    /// the peer closed.
    fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.link().receive(buf)
    }

    fn send_async(&self, data: Vec<u8>, cancel: CancellationToken) -> TransportFuture<'_, usize> {
        Box::pin(self.link().send_async(data, cancel))
    }

    /// Receive up to `len` bytes; the returned buffer is truncated to what
    /// arrived.
    fn receive_async(&self, len: usize, cancel: CancellationToken) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(self.link().receive_async(len, cancel))
    }

    fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.link().set_receive_timeout(timeout)
    }
}
