//! Shared connection core.
//!
//! A [`Link`] exclusively owns one byte stream and implements the looping
//! send/receive, the async variants, the receive timeout and disposal for
//! every [`Connection`](super::Connection) implementation.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::traits::{ByteStream, ConnectionState, TransportError};

/// Longest a cancellable receive stays blocked before checking its token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

pub struct Link {
    stream: RwLock<Option<Arc<dyn ByteStream>>>,
    state: Mutex<ConnectionState>,
    receive_timeout: Mutex<Option<Duration>>,
}

impl Link {
    pub fn new() -> Self {
        Self {
            stream: RwLock::new(None),
            state: Mutex::new(ConnectionState::Unconnected),
            receive_timeout: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Take ownership of `stream` and move to `Connected`.
    pub fn attach(&self, stream: Arc<dyn ByteStream>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if *state != ConnectionState::Unconnected {
            let _ = stream.shutdown();
            return Err(TransportError::InvalidState(*state));
        }

        stream.set_read_timeout(*self.receive_timeout.lock())?;
        *self.stream.write() = Some(stream);
        *state = ConnectionState::Connected;
        debug!("Link attached");
        Ok(())
    }

    /// Current stream, cloned out of the lock so I/O never holds it.
    pub fn stream(&self) -> Result<Arc<dyn ByteStream>, TransportError> {
        if let Some(stream) = self.stream.read().as_ref() {
            return Ok(stream.clone());
        }
        match self.state() {
            ConnectionState::Unconnected => Err(TransportError::NotConnected),
            _ => Err(TransportError::Closed),
        }
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        *self.receive_timeout.lock()
    }

    /// Bound each underlying receive attempt. `None` or zero blocks
    /// indefinitely.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let timeout = timeout.filter(|t| !t.is_zero());
        *self.receive_timeout.lock() = timeout;
        if let Some(stream) = self.stream.read().as_ref() {
            stream.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        let stream = self.stream.write().take();
        if let Some(stream) = stream {
            if let Err(e) = stream.shutdown() {
                debug!(error = %e, "Shutdown on disconnect failed");
            }
            debug!("Link disconnected");
        }
        let mut state = self.state.lock();
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Disconnected;
        }
    }

    pub fn dispose(&self) {
        let stream = self.stream.write().take();
        if let Some(stream) = stream {
            let _ = stream.shutdown();
            debug!("Link disposed");
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let stream = self.stream()?;
        write_loop(stream.as_ref(), buf, None)
    }

    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let stream = self.stream()?;
        read_loop(stream.as_ref(), buf, timeout_ms(self.receive_timeout()))
    }

    /// Fill `buf` before `deadline`, bounding each attempt by the time left.
    /// The configured receive timeout is restored afterwards.
    pub fn receive_until(&self, buf: &mut [u8], deadline: Instant) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        let configured = self.receive_timeout();
        let result = read_until(stream.as_ref(), buf, deadline);
        stream.set_read_timeout(configured)?;
        result
    }

    pub async fn send_async(&self, data: Vec<u8>, cancel: CancellationToken) -> Result<usize, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let stream = self.stream()?;
        let worker = cancel.clone();
        let task = tokio::task::spawn_blocking(move || write_loop(stream.as_ref(), &data, Some(&worker)));
        join_or_cancel(task, &cancel).await
    }

    pub async fn receive_async(&self, len: usize, cancel: CancellationToken) -> Result<Vec<u8>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let stream = self.stream()?;
        let timeout = self.receive_timeout();
        let worker = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let n = read_cancellable(stream.as_ref(), &mut buf, &worker, timeout)?;
            buf.truncate(n);
            Ok(buf)
        });
        join_or_cancel(task, &cancel).await
    }

    /// Send a little-endian `i32`. Fails with `Closed` if the peer went away
    /// before all four bytes left.
    pub fn send_i32(&self, value: i32) -> Result<(), TransportError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        match self.send(&buf)? {
            4 => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    /// Receive a little-endian `i32`, or `None` if the peer closed first.
    pub fn receive_i32(&self) -> Result<Option<i32>, TransportError> {
        let mut buf = [0u8; 4];
        match self.receive(&mut buf)? {
            4 => Ok(Some(LittleEndian::read_i32(&buf))),
            _ => Ok(None),
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Wait for a blocking I/O task, giving up with `Cancelled` as soon as
/// `cancel` fires. The task notices the token on its own and exits.
async fn join_or_cancel<T>(
    task: JoinHandle<Result<T, TransportError>>,
    cancel: &CancellationToken,
) -> Result<T, TransportError> {
    tokio::select! {
        biased;
        joined = task => joined.map_err(|e| TransportError::Io(io::Error::other(e)))?,
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
    }
}

fn timeout_ms(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| t.as_millis() as u64)
}

/// Errors that mean the peer is gone; they end a loop like a zero-byte
/// transfer does.
fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub(crate) fn write_loop(
    stream: &dyn ByteStream,
    buf: &[u8],
    cancel: Option<&CancellationToken>,
) -> Result<usize, TransportError> {
    let mut total = 0;
    while total < buf.len() {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(TransportError::Cancelled);
        }
        match stream.write(&buf[total..]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                trace!(sent = n, total, len = buf.len(), "Write progress");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_peer_closed(&e) => {
                debug!(error = %e, total, "Peer closed during send");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

pub(crate) fn read_loop(stream: &dyn ByteStream, buf: &mut [u8], timeout_ms: u64) -> Result<usize, TransportError> {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                trace!(received = n, total, len = buf.len(), "Read progress");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_peer_closed(&e) => {
                debug!(error = %e, total, "Peer closed during receive");
                break;
            }
            Err(e) if is_timeout(&e) => return Err(TransportError::Timeout { timeout_ms }),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

/// Like [`read_loop`], but each attempt blocks for at most `CANCEL_POLL` so
/// the token is seen even when the peer is silent. `timeout` still bounds
/// the wait for each chunk. The stream's timeout is restored afterwards.
fn read_cancellable(
    stream: &dyn ByteStream,
    buf: &mut [u8],
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<usize, TransportError> {
    let slice = timeout.map_or(CANCEL_POLL, |t| t.min(CANCEL_POLL));
    stream.set_read_timeout(Some(slice))?;
    let result = read_sliced(stream, buf, cancel, timeout);
    let restored = stream.set_read_timeout(timeout);
    let total = result?;
    restored?;
    Ok(total)
}

fn read_sliced(
    stream: &dyn ByteStream,
    buf: &mut [u8],
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<usize, TransportError> {
    let mut total = 0;
    let mut waiting_since = Instant::now();
    while total < buf.len() {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                waiting_since = Instant::now();
                trace!(received = n, total, len = buf.len(), "Read progress");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_peer_closed(&e) => {
                debug!(error = %e, total, "Peer closed during receive");
                break;
            }
            Err(e) if is_timeout(&e) => {
                if timeout.is_some_and(|limit| waiting_since.elapsed() >= limit) {
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout_ms(timeout),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

fn read_until(stream: &dyn ByteStream, buf: &mut [u8], deadline: Instant) -> Result<usize, TransportError> {
    let mut total = 0;
    while total < buf.len() {
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            return Err(TransportError::Timeout { timeout_ms: 0 });
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_peer_closed(&e) => break,
            Err(e) if is_timeout(&e) => {
                return Err(TransportError::Timeout {
                    timeout_ms: remaining.as_millis() as u64,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}
