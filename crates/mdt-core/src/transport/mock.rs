//! Mock byte stream and tunnel for testing.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::traits::{ByteStream, Tunnel, TransportError};
use crate::device::DeviceInfo;

type WriteHook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct StreamState {
    /// Bytes the next reads will return.
    inbound: VecDeque<u8>,
    /// Captured writes.
    outbound: Vec<u8>,
    peer_closed: bool,
    shut_down: bool,
    read_timeout: Option<Duration>,
    read_calls: usize,
    write_calls: usize,
    /// Fail writes with this kind once `outbound` reaches the given length.
    write_failure: Option<(usize, io::ErrorKind)>,
}

/// In-memory stream with configurable partial transfers.
pub struct MockStream {
    state: Mutex<StreamState>,
    readable: Condvar,
    /// Most bytes a single read or write moves.
    max_chunk: usize,
    /// Total bytes accepted before writes report zero progress.
    write_budget: Option<usize>,
    write_hook: Mutex<Option<WriteHook>>,
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::default()),
            readable: Condvar::new(),
            max_chunk: usize::MAX,
            write_budget: None,
            write_hook: Mutex::new(None),
        }
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    pub fn with_write_budget(mut self, budget: usize) -> Self {
        self.write_budget = Some(budget);
        self
    }

    /// Queue bytes to be returned by subsequent reads.
    pub fn push_inbound(&self, data: &[u8]) {
        self.state.lock().inbound.extend(data.iter().copied());
        self.readable.notify_all();
    }

    /// Simulate the peer closing: reads drain what is queued, then return 0.
    pub fn close_peer(&self) {
        self.state.lock().peer_closed = true;
        self.readable.notify_all();
    }

    pub fn fail_writes_after(&self, bytes: usize, kind: io::ErrorKind) {
        self.state.lock().write_failure = Some((bytes, kind));
    }

    /// Called after every successful write with the write call count.
    pub fn on_write<F>(&self, hook: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.write_hook.lock() = Some(Box::new(hook));
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().outbound.clone()
    }

    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for MockStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.read_calls += 1;

        loop {
            if state.shut_down {
                return Ok(0);
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(self.max_chunk).min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.peer_closed {
                return Ok(0);
            }
            match state.read_timeout {
                Some(timeout) => {
                    if self.readable.wait_for(&mut state, timeout).timed_out()
                        && state.inbound.is_empty()
                        && !state.shut_down
                        && !state.peer_closed
                    {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let (call_count, n) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(io::ErrorKind::NotConnected.into());
            }
            if let Some((limit, kind)) = state.write_failure
                && state.outbound.len() >= limit
            {
                return Err(kind.into());
            }
            if state.peer_closed {
                return Ok(0);
            }

            let budget = self
                .write_budget
                .map_or(usize::MAX, |b| b.saturating_sub(state.outbound.len()));
            let n = buf.len().min(self.max_chunk).min(budget);
            if n == 0 {
                return Ok(0);
            }
            state.outbound.extend_from_slice(&buf[..n]);
            state.write_calls += 1;
            (state.write_calls, n)
        };

        if let Some(hook) = self.write_hook.lock().as_ref() {
            hook(call_count);
        }
        Ok(n)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.state.lock().read_timeout = timeout;
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.state.lock().shut_down = true;
        self.readable.notify_all();
        Ok(())
    }
}

/// Tunnel that hands out pre-built streams and records what was opened.
#[derive(Default)]
pub struct MockTunnel {
    streams: Mutex<VecDeque<Arc<dyn ByteStream>>>,
    opened: Mutex<Vec<(String, u16)>>,
}

impl MockTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stream(&self, stream: Arc<dyn ByteStream>) {
        self.streams.lock().push_back(stream);
    }

    pub fn opened(&self) -> Vec<(String, u16)> {
        self.opened.lock().clone()
    }
}

impl Tunnel for MockTunnel {
    fn open(&self, device: &DeviceInfo, port: u16) -> Result<Arc<dyn ByteStream>, TransportError> {
        self.opened.lock().push((device.udid().to_string(), port));
        self.streams
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::NoDevice {
                udid: device.udid().to_string(),
            })
    }
}
