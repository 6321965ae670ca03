//! Device watcher.
//!
//! Merges the events of every discovery backend into one ordered stream and
//! keeps the set of devices currently reachable.
//!
//! Backends only ever enqueue. The known-device set is touched solely by
//! [`DeviceWatcher::drain`], which the embedding application calls at a
//! regular cadence (once per frame or timer tick). Observers run inside
//! `drain`, on the caller's thread.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{DiscoveryError, EventSink, PollBackend, Subscription};
use crate::context::Context;
use crate::device::DeviceInfo;
use crate::events::{DeviceEvent, DeviceEventKind, ObserverId, Observers};
use crate::normalize::poll_events;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherState::Stopped => write!(f, "stopped"),
            WatcherState::Starting => write!(f, "starting"),
            WatcherState::Running => write!(f, "running"),
        }
    }
}

/// Everything that exists only between `start` and `stop`.
struct Session {
    cancel: CancellationToken,
    queue: Receiver<DeviceEvent>,
    subscriptions: Vec<(&'static str, Subscription)>,
    poll_tasks: Vec<JoinHandle<()>>,
    polling: Vec<&'static str>,
}

impl Session {
    /// Push backends whose source is still up, then every polled backend.
    fn active(&self) -> Vec<&'static str> {
        self.subscriptions
            .iter()
            .filter(|(_, subscription)| subscription.is_alive())
            .map(|(name, _)| *name)
            .chain(self.polling.iter().copied())
            .collect()
    }
}

pub struct DeviceWatcher {
    ctx: Arc<Context>,
    state: WatcherState,
    session: Option<Session>,
    known: HashSet<DeviceInfo>,
    observers: Observers,
}

impl DeviceWatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            state: WatcherState::Stopped,
            session: None,
            known: HashSet::new(),
            observers: Observers::new(),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Subscribe to every push backend and start polling every poll
    /// backend. Backends that fail to start are skipped; the watcher fails
    /// only when none starts. A no-op while running.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.state == WatcherState::Running {
            return Ok(());
        }
        self.state = WatcherState::Starting;

        let (tx, rx) = crossbeam_channel::unbounded();
        let cancel = CancellationToken::new();
        let mut session = Session {
            cancel: cancel.clone(),
            queue: rx,
            subscriptions: Vec::new(),
            poll_tasks: Vec::new(),
            polling: Vec::new(),
        };

        for backend in self.ctx.push_backends() {
            let sender = tx.clone();
            let sink: EventSink = Arc::new(move |event| {
                let _ = sender.send(event);
            });
            match backend.subscribe(sink) {
                Ok(subscription) => {
                    info!(backend = backend.name(), "Backend subscribed");
                    session.subscriptions.push((backend.name(), subscription));
                }
                Err(e) => warn!(backend = backend.name(), error = %e, "Backend unavailable"),
            }
        }

        let interval = self.ctx.config().watcher.poll_interval();
        for backend in self.ctx.poll_backends() {
            if let Err(e) = backend.probe() {
                warn!(backend = backend.name(), error = %e, "Backend unavailable");
                continue;
            }
            info!(backend = backend.name(), interval_ms = interval.as_millis() as u64, "Backend polling");
            let task = self.ctx.runtime().spawn(poll_loop(
                backend.clone(),
                tx.clone(),
                interval,
                cancel.clone(),
            ));
            session.poll_tasks.push(task);
            session.polling.push(backend.name());
        }

        if session.subscriptions.is_empty() && session.polling.is_empty() {
            self.state = WatcherState::Stopped;
            return Err(DiscoveryError::NoBackendAvailable);
        }

        info!(backends = ?session.active(), "Device watcher running");
        self.session = Some(session);
        self.state = WatcherState::Running;
        Ok(())
    }

    /// Cancel every source, drop pending events and forget all devices.
    /// Safe to call in any state.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            for task in &session.poll_tasks {
                task.abort();
            }
            let dropped = session.queue.len();
            drop(session);
            info!(dropped, "Device watcher stopped");
        }
        self.known.clear();
        self.state = WatcherState::Stopped;
    }

    /// `start` or `stop`.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), DiscoveryError> {
        if enabled {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    /// Apply every event enqueued before this call and notify observers.
    /// Events that arrive meanwhile wait for the next call. Returns the
    /// number of events consumed.
    pub fn drain(&mut self) -> usize {
        let pending: Vec<DeviceEvent> = match &self.session {
            Some(session) => {
                let budget = session.queue.len();
                session.queue.try_iter().take(budget).collect()
            }
            None => return 0,
        };

        let count = pending.len();
        for event in pending {
            self.apply(event);
        }
        count
    }

    fn apply(&mut self, event: DeviceEvent) {
        debug!(udid = %event.udid, kind = %event.kind, device_kind = %event.device_kind, "Applying event");
        match event.kind {
            DeviceEventKind::Added => {
                if self.known.contains(event.udid.as_str()) {
                    debug!(udid = %event.udid, "Already known");
                    return;
                }
                let device = self.resolve(&event);
                self.known.insert(device.clone());
                self.observers.notify(DeviceEventKind::Added, &device);
            }
            DeviceEventKind::Removed => match self.known.take(event.udid.as_str()) {
                Some(device) => self.observers.notify(DeviceEventKind::Removed, &device),
                None => debug!(udid = %event.udid, "Removal of unknown device ignored"),
            },
            DeviceEventKind::Paired => {
                let device = match self.known.get(event.udid.as_str()) {
                    Some(device) => device.clone(),
                    None => self.resolve(&event),
                };
                self.observers.notify(DeviceEventKind::Paired, &device);
            }
        }
    }

    /// Fresh record for `event`'s device, named if its backend can tell.
    fn resolve(&self, event: &DeviceEvent) -> DeviceInfo {
        let device = event.to_device_info();
        let Some(resolver) = self.ctx.resolver(event.device_kind) else {
            return device;
        };
        match resolver.resolve_name(&event.udid) {
            Ok(name) => device.with_name(name),
            Err(e) => {
                warn!(udid = %event.udid, error = %e, "Name resolution failed");
                device
            }
        }
    }

    pub fn on_device_added<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&DeviceInfo) + Send + 'static,
    {
        self.observers.register(DeviceEventKind::Added, callback)
    }

    pub fn on_device_removed<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&DeviceInfo) + Send + 'static,
    {
        self.observers.register(DeviceEventKind::Removed, callback)
    }

    pub fn on_device_paired<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&DeviceInfo) + Send + 'static,
    {
        self.observers.register(DeviceEventKind::Paired, callback)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Known devices, ordered by UDID.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.known.iter().cloned().collect();
        devices.sort_by(|a, b| a.udid().cmp(b.udid()));
        devices
    }

    pub fn device(&self, udid: &str) -> Option<&DeviceInfo> {
        self.known.get(udid)
    }

    /// Names of the backends currently feeding events. A push backend
    /// whose source died after `start` drops out of this list.
    pub fn active_backends(&self) -> Vec<&'static str> {
        self.session.as_ref().map_or_else(Vec::new, Session::active)
    }

    /// Running, but some configured backend failed to start or has since
    /// lost its source.
    pub fn is_degraded(&self) -> bool {
        let configured = self.ctx.poll_backends().len() + self.ctx.push_backends().len();
        self.session
            .as_ref()
            .is_some_and(|s| s.active().len() < configured)
    }

    /// Cancelled when the watcher stops. Transfers can be tied to it.
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.session.as_ref().map(|s| s.cancel.clone())
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for DeviceWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceWatcher")
            .field("state", &self.state)
            .field("active", &self.active_backends())
            .field("known", &self.known.len())
            .field("observers", &self.observers)
            .finish()
    }
}

/// Diff one poll backend's serial list against its own previous list at a
/// fixed interval until cancelled.
async fn poll_loop(
    backend: Arc<dyn PollBackend>,
    queue: Sender<DeviceEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut previous = Vec::new();
    loop {
        let lister = backend.clone();
        match tokio::task::spawn_blocking(move || lister.list_connected()).await {
            Ok(Ok(instant)) => {
                for event in poll_events(backend.kind(), &mut previous, &instant) {
                    if queue.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => warn!(backend = backend.name(), error = %e, "Poll failed"),
            Err(e) => warn!(backend = backend.name(), error = %e, "Poll task failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(backend = backend.name(), "Poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockPollBackend, MockPushBackend};
    use crate::config::Config;
    use crate::device::DeviceKind;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Instant;
    use tokio::runtime::Runtime;

    struct Harness {
        watcher: DeviceWatcher,
        poll: Arc<MockPollBackend>,
        push: Arc<MockPushBackend>,
        log: Arc<Mutex<Vec<String>>>,
        // Last, so the watcher stops before the runtime goes away.
        _rt: Runtime,
    }

    fn harness_with(poll: MockPollBackend, push: MockPushBackend) -> Harness {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let poll = Arc::new(poll);
        let push = Arc::new(push);

        let mut config = Config::default();
        config.watcher.poll_interval_ms = 10;
        let ctx = Context::builder(config, rt.handle().clone())
            .poll_backend(poll.clone())
            .push_backend(push.clone())
            .build();

        let mut watcher = DeviceWatcher::new(Arc::new(ctx));
        let log = Arc::new(Mutex::new(Vec::new()));
        for (kind, label) in [
            (DeviceEventKind::Added, "added"),
            (DeviceEventKind::Removed, "removed"),
            (DeviceEventKind::Paired, "paired"),
        ] {
            let log = log.clone();
            let record = move |device: &DeviceInfo| {
                log.lock().push(format!("{label} {} {}", device.udid(), device.name()).trim_end().to_string());
            };
            match kind {
                DeviceEventKind::Added => watcher.on_device_added(record),
                DeviceEventKind::Removed => watcher.on_device_removed(record),
                DeviceEventKind::Paired => watcher.on_device_paired(record),
            };
        }

        Harness {
            watcher,
            poll,
            push,
            log,
            _rt: rt,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockPollBackend::new(DeviceKind::Android),
            MockPushBackend::new(DeviceKind::Ios),
        )
    }

    impl Harness {
        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        /// Drain until `done` holds or two seconds pass.
        fn drain_until(&mut self, done: impl Fn(&DeviceWatcher) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !done(&self.watcher) {
                assert!(Instant::now() < deadline, "condition not reached");
                self.watcher.drain();
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn udids(watcher: &DeviceWatcher) -> Vec<String> {
        watcher
            .devices()
            .iter()
            .map(|d| d.udid().to_string())
            .collect()
    }

    #[test]
    fn test_start_is_noop_when_running() {
        let mut h = harness();
        h.watcher.start().unwrap();
        let token = h.watcher.cancellation_token().unwrap();
        h.watcher.start().unwrap();

        assert_eq!(h.watcher.state(), WatcherState::Running);
        assert_eq!(h.watcher.active_backends(), &["mock-push", "mock-poll"]);
        assert!(!h.watcher.is_degraded());
        assert!(!token.is_cancelled());
        assert!(h.push.is_subscribed());
    }

    #[test]
    fn test_duplicate_added_notifies_once() {
        let mut h = harness();
        h.push.set_name("U1", "iPhone");
        h.watcher.start().unwrap();

        h.push.emit("U1", DeviceEventKind::Added);
        h.push.emit("U1", DeviceEventKind::Added);
        assert_eq!(h.watcher.drain(), 2);

        assert_eq!(udids(&h.watcher), vec!["U1"]);
        assert_eq!(h.watcher.device("U1").unwrap().name(), "iPhone");
        assert_eq!(h.log(), vec!["added U1 iPhone"]);
    }

    #[test]
    fn test_removed_unknown_is_dropped() {
        let mut h = harness();
        h.watcher.start().unwrap();

        h.push.emit("ghost", DeviceEventKind::Removed);
        h.watcher.drain();
        assert!(h.log().is_empty());

        h.push.emit("U1", DeviceEventKind::Added);
        h.push.emit("U1", DeviceEventKind::Removed);
        h.push.emit("U1", DeviceEventKind::Removed);
        h.watcher.drain();
        assert!(h.watcher.devices().is_empty());
        assert_eq!(h.log(), vec!["added U1", "removed U1"]);
    }

    #[test]
    fn test_paired_does_not_change_membership() {
        let mut h = harness();
        h.push.set_name("U2", "iPad");
        h.watcher.start().unwrap();

        h.push.emit("U2", DeviceEventKind::Paired);
        h.watcher.drain();
        assert!(h.watcher.devices().is_empty());

        h.push.emit("U2", DeviceEventKind::Added);
        h.push.emit("U2", DeviceEventKind::Paired);
        h.watcher.drain();
        assert_eq!(udids(&h.watcher), vec!["U2"]);
        assert_eq!(
            h.log(),
            vec!["paired U2 iPad", "added U2 iPad", "paired U2 iPad"]
        );
    }

    #[test]
    fn test_known_set_is_net_positive_in_arrival_order() {
        let mut h = harness();
        h.watcher.start().unwrap();

        let script = [
            ("A", DeviceEventKind::Added),
            ("B", DeviceEventKind::Added),
            ("A", DeviceEventKind::Removed),
            ("C", DeviceEventKind::Added),
            ("B", DeviceEventKind::Added),
            ("A", DeviceEventKind::Added),
            ("C", DeviceEventKind::Removed),
            ("D", DeviceEventKind::Removed),
        ];
        for (udid, kind) in script {
            h.push.emit(udid, kind);
        }
        h.watcher.drain();

        assert_eq!(udids(&h.watcher), vec!["A", "B"]);
        assert_eq!(
            h.log(),
            vec!["added A", "added B", "removed A", "added C", "added A", "removed C"]
        );
    }

    #[test]
    fn test_poll_backend_diff_drives_events() {
        let mut h = harness();
        h.poll.set_name("D1", "Google Pixel 7");
        h.poll.set_connected(&["D1"]);
        h.watcher.start().unwrap();

        h.drain_until(|w| w.device("D1").is_some());
        assert_eq!(h.watcher.device("D1").unwrap().kind(), DeviceKind::Android);

        h.poll.set_connected(&["D1", "D2"]);
        h.drain_until(|w| w.device("D2").is_some());

        h.poll.set_connected(&[]);
        h.drain_until(|w| w.devices().is_empty());

        assert_eq!(
            h.log(),
            vec![
                "added D1 Google Pixel 7",
                "added D2",
                "removed D1 Google Pixel 7",
                "removed D2"
            ]
        );
    }

    #[test]
    fn test_poll_failures_are_absorbed() {
        let mut h = harness();
        h.poll.fail_listing(true);
        h.watcher.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.poll.list_calls() < 3 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.watcher.drain(), 0);
        assert_eq!(h.watcher.state(), WatcherState::Running);

        h.poll.fail_listing(false);
        h.poll.set_connected(&["D9"]);
        h.drain_until(|w| w.device("D9").is_some());
    }

    #[test]
    fn test_no_backend_available() {
        let mut h = harness_with(
            MockPollBackend::new(DeviceKind::Android).unavailable(),
            MockPushBackend::new(DeviceKind::Ios).unavailable(),
        );

        assert!(matches!(
            h.watcher.start(),
            Err(DiscoveryError::NoBackendAvailable)
        ));
        assert_eq!(h.watcher.state(), WatcherState::Stopped);
        assert!(h.watcher.active_backends().is_empty());
        assert_eq!(h.watcher.drain(), 0);
    }

    #[test]
    fn test_degraded_when_one_backend_fails() {
        let mut h = harness_with(
            MockPollBackend::new(DeviceKind::Android),
            MockPushBackend::new(DeviceKind::Ios).unavailable(),
        );

        h.watcher.start().unwrap();
        assert_eq!(h.watcher.state(), WatcherState::Running);
        assert_eq!(h.watcher.active_backends(), &["mock-poll"]);
        assert!(h.watcher.is_degraded());
    }

    #[test]
    fn test_lost_push_source_is_reported() {
        let mut h = harness();
        h.watcher.start().unwrap();
        assert!(!h.watcher.is_degraded());

        h.push.lose_connection();
        assert_eq!(h.watcher.state(), WatcherState::Running);
        assert_eq!(h.watcher.active_backends(), &["mock-poll"]);
        assert!(h.watcher.is_degraded());
    }

    #[test]
    fn test_stop_is_idempotent_and_clears() {
        let mut h = harness();
        h.watcher.start().unwrap();
        let token = h.watcher.cancellation_token().unwrap();

        h.push.emit("U1", DeviceEventKind::Added);
        h.watcher.drain();
        h.push.emit("U2", DeviceEventKind::Added);

        h.watcher.stop();
        h.watcher.stop();

        assert_eq!(h.watcher.state(), WatcherState::Stopped);
        assert!(h.watcher.devices().is_empty());
        assert!(token.is_cancelled());
        assert!(!h.push.is_subscribed());
        assert!(h.watcher.cancellation_token().is_none());

        // The pending U2 was dropped with the queue.
        h.watcher.start().unwrap();
        assert_eq!(h.watcher.drain(), 0);
        assert_eq!(h.log(), vec!["added U1"]);
    }

    #[test]
    fn test_set_enabled() {
        let mut h = harness();
        h.watcher.set_enabled(true).unwrap();
        assert_eq!(h.watcher.state(), WatcherState::Running);
        h.watcher.set_enabled(false).unwrap();
        assert_eq!(h.watcher.state(), WatcherState::Stopped);
    }

    #[test]
    fn test_drain_is_bounded_by_pending_events() {
        let mut h = harness();
        h.watcher.start().unwrap();

        let push = h.push.clone();
        h.watcher.on_device_added(move |device| {
            if device.udid() == "first" {
                push.emit("second", DeviceEventKind::Added);
            }
        });

        h.push.emit("first", DeviceEventKind::Added);
        assert_eq!(h.watcher.drain(), 1);
        assert_eq!(udids(&h.watcher), vec!["first"]);

        assert_eq!(h.watcher.drain(), 1);
        assert_eq!(udids(&h.watcher), vec!["first", "second"]);
    }

    #[test]
    fn test_remove_observer() {
        let mut h = harness();
        let hits = Arc::new(Mutex::new(0));
        let id = {
            let hits = hits.clone();
            h.watcher.on_device_removed(move |_| *hits.lock() += 1)
        };
        assert!(h.watcher.remove_observer(id));
        assert!(!h.watcher.remove_observer(id));

        h.watcher.start().unwrap();
        h.push.emit("U1", DeviceEventKind::Added);
        h.push.emit("U1", DeviceEventKind::Removed);
        h.watcher.drain();
        assert_eq!(*hits.lock(), 0);
    }
}
