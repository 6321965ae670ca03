//! Process-wide context.
//!
//! Built once at startup and handed to the [`DeviceWatcher`] and the
//! [`TransportFactory`]. Tests build one from mock backends.
//!
//! [`DeviceWatcher`]: crate::watcher::DeviceWatcher
//! [`TransportFactory`]: crate::transport::TransportFactory

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::backend::{AdbBackend, Backend, PollBackend, PushBackend, UsbmuxBackend};
use crate::config::Config;
use crate::device::DeviceKind;
use crate::transport::Tunnel;

pub struct Context {
    config: Config,
    runtime: Handle,
    poll_backends: Vec<Arc<dyn PollBackend>>,
    push_backends: Vec<Arc<dyn PushBackend>>,
    resolvers: HashMap<DeviceKind, Arc<dyn Backend>>,
    tunnels: HashMap<DeviceKind, Arc<dyn Tunnel>>,
}

impl Context {
    pub fn builder(config: Config, runtime: Handle) -> ContextBuilder {
        ContextBuilder {
            context: Context {
                config,
                runtime,
                poll_backends: Vec::new(),
                push_backends: Vec::new(),
                resolvers: HashMap::new(),
                tunnels: HashMap::new(),
            },
        }
    }

    /// Context with the real backends the config enables: adb for Android,
    /// usbmuxd for iOS. Each also serves as the tunnel for its device kind.
    pub fn from_config(config: Config, runtime: Handle) -> Self {
        let android = config
            .watcher
            .enable_android
            .then(|| Arc::new(AdbBackend::new(&config.android)));
        let ios = config
            .watcher
            .enable_ios
            .then(|| Arc::new(UsbmuxBackend::new(&config.ios)));

        let mut builder = Self::builder(config, runtime);
        if let Some(adb) = android {
            builder = builder
                .poll_backend(adb.clone())
                .tunnel(DeviceKind::Android, adb);
        }
        if let Some(usbmux) = ios {
            builder = builder
                .push_backend(usbmux.clone())
                .tunnel(DeviceKind::Ios, usbmux);
        }
        builder.build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn poll_backends(&self) -> &[Arc<dyn PollBackend>] {
        &self.poll_backends
    }

    pub fn push_backends(&self) -> &[Arc<dyn PushBackend>] {
        &self.push_backends
    }

    /// Backend that resolves names for `kind` devices: the first one
    /// registered for that kind.
    pub fn resolver(&self, kind: DeviceKind) -> Option<&Arc<dyn Backend>> {
        self.resolvers.get(&kind)
    }

    pub fn tunnel(&self, kind: DeviceKind) -> Option<Arc<dyn Tunnel>> {
        self.tunnels.get(&kind).cloned()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |backends: Vec<&'static str>| backends.join(", ");
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("poll_backends", &names(self.poll_backends.iter().map(|b| b.name()).collect()))
            .field("push_backends", &names(self.push_backends.iter().map(|b| b.name()).collect()))
            .field("tunnels", &self.tunnels.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct ContextBuilder {
    context: Context,
}

impl ContextBuilder {
    pub fn poll_backend<B: PollBackend + 'static>(mut self, backend: Arc<B>) -> Self {
        self.context
            .resolvers
            .entry(backend.kind())
            .or_insert_with(|| backend.clone() as Arc<dyn Backend>);
        self.context.poll_backends.push(backend);
        self
    }

    pub fn push_backend<B: PushBackend + 'static>(mut self, backend: Arc<B>) -> Self {
        self.context
            .resolvers
            .entry(backend.kind())
            .or_insert_with(|| backend.clone() as Arc<dyn Backend>);
        self.context.push_backends.push(backend);
        self
    }

    pub fn tunnel<T: Tunnel + 'static>(mut self, kind: DeviceKind, tunnel: Arc<T>) -> Self {
        self.context.tunnels.insert(kind, tunnel);
        self
    }

    pub fn build(self) -> Context {
        self.context
    }
}
