//! Scripted backends for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::traits::{Backend, DiscoveryError, EventSink, PollBackend, PushBackend, Subscription};
use crate::device::{ConnectionKind, DeviceKind};
use crate::events::{DeviceEvent, DeviceEventKind};

fn lookup(names: &Mutex<HashMap<String, String>>, udid: &str) -> Result<String, DiscoveryError> {
    names
        .lock()
        .get(udid)
        .cloned()
        .ok_or_else(|| DiscoveryError::NameResolutionFailed {
            udid: udid.to_string(),
            reason: "unknown to mock".to_string(),
        })
}

/// Poll backend answering from a list the test sets.
pub struct MockPollBackend {
    kind: DeviceKind,
    connected: Mutex<Vec<String>>,
    names: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    failing_list: AtomicBool,
    list_calls: AtomicUsize,
}

impl MockPollBackend {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            connected: Mutex::new(Vec::new()),
            names: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            failing_list: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Make `probe` fail.
    pub fn unavailable(self) -> Self {
        self.unavailable.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_connected(&self, serials: &[&str]) {
        *self.connected.lock() = serials.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_name(&self, udid: &str, name: &str) {
        self.names.lock().insert(udid.to_string(), name.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.failing_list.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl Backend for MockPollBackend {
    fn name(&self) -> &'static str {
        "mock-poll"
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn resolve_name(&self, udid: &str) -> Result<String, DiscoveryError> {
        lookup(&self.names, udid)
    }
}

impl PollBackend for MockPollBackend {
    fn probe(&self) -> Result<(), DiscoveryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DiscoveryError::BackendUnavailable {
                backend: "mock-poll",
                reason: "configured unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn list_connected(&self) -> Result<Vec<String>, DiscoveryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_list.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Command {
                command: "mock list".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.connected.lock().clone())
    }
}

/// Push backend whose events the test emits by hand.
pub struct MockPushBackend {
    kind: DeviceKind,
    sink: Arc<Mutex<Option<EventSink>>>,
    names: Mutex<HashMap<String, String>>,
    alive: Arc<AtomicBool>,
    unavailable: bool,
}

impl MockPushBackend {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            sink: Arc::new(Mutex::new(None)),
            names: Mutex::new(HashMap::new()),
            alive: Arc::new(AtomicBool::new(false)),
            unavailable: false,
        }
    }

    /// Make `subscribe` fail.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn set_name(&self, udid: &str, name: &str) {
        self.names.lock().insert(udid.to_string(), name.to_string());
    }

    pub fn is_subscribed(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// The native source goes away without the subscriber asking.
    pub fn lose_connection(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.sink.lock().take();
    }

    /// Deliver an event as the native library would. Returns false when
    /// nobody is subscribed.
    pub fn emit(&self, udid: &str, kind: DeviceEventKind) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink(DeviceEvent::new(udid, self.kind, kind, ConnectionKind::Usbmuxd));
                true
            }
            None => false,
        }
    }
}

impl Backend for MockPushBackend {
    fn name(&self) -> &'static str {
        "mock-push"
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn resolve_name(&self, udid: &str) -> Result<String, DiscoveryError> {
        lookup(&self.names, udid)
    }
}

impl PushBackend for MockPushBackend {
    fn subscribe(&self, sink: EventSink) -> Result<Subscription, DiscoveryError> {
        if self.unavailable {
            return Err(DiscoveryError::BackendUnavailable {
                backend: "mock-push",
                reason: "configured unavailable".to_string(),
            });
        }
        *self.sink.lock() = Some(sink);
        self.alive.store(true, Ordering::SeqCst);

        let slot = self.sink.clone();
        let subscription = Subscription::new(move || {
            slot.lock().take();
        });
        Ok(subscription.with_liveness(self.alive.clone()))
    }
}
