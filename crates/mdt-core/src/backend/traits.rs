//! Discovery backend abstraction.
//!
//! A backend wraps one native device-enumeration source. Poll backends
//! answer "what is connected now"; push backends call back on change from
//! a thread they own. Both can look up a device's display name.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::device::DeviceKind;
use crate::events::DeviceEvent;
use crate::protocol::UsbmuxError;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("Name resolution failed for {udid}: {reason}")]
    NameResolutionFailed { udid: String, reason: String },

    #[error("No discovery backend available")]
    NoBackendAvailable,

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("usbmuxd protocol error: {0}")]
    Protocol(#[from] UsbmuxError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub trait Backend: Send + Sync {
    /// Short name used in logs and in the watcher's active-backend list.
    fn name(&self) -> &'static str;

    /// Device family this backend discovers.
    fn kind(&self) -> DeviceKind;

    /// Human-readable name of a connected device.
    fn resolve_name(&self, udid: &str) -> Result<String, DiscoveryError>;
}

pub trait PollBackend: Backend {
    /// Check the backend can be used at all. Called once per watcher start.
    fn probe(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    /// Serials of the devices reachable right now, in enumeration order.
    fn list_connected(&self) -> Result<Vec<String>, DiscoveryError>;
}

/// Receives normalized events from a push backend. May be called from any
/// thread; implementations must only enqueue.
pub type EventSink = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

pub trait PushBackend: Backend {
    /// Start delivering events to `sink` until the returned subscription is
    /// dropped.
    fn subscribe(&self, sink: EventSink) -> Result<Subscription, DiscoveryError>;
}

/// Live push subscription. Dropping it stops delivery.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
    alive: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Share a flag the backend clears when its event source dies on its
    /// own, so the loss shows up in [`is_alive`](Self::is_alive).
    pub fn with_liveness(mut self, alive: Arc<AtomicBool>) -> Self {
        self.alive = alive;
        self
    }

    /// Still delivering events.
    pub fn is_alive(&self) -> bool {
        self.cancel.is_some() && self.alive.load(Ordering::SeqCst)
    }

    /// Stop delivery now rather than at drop.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("alive", &self.is_alive())
            .finish()
    }
}
