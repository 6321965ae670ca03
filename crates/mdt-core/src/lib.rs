//! MDT-Core: mobile device discovery and data transfer over USB.
//!
//! A desktop host discovers phones attached over USB (Android through adb,
//! iOS through usbmuxd) and exchanges data with a companion process running
//! on the phone, over a byte stream tunnelled through the USB multiplexer.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Backend**: native discovery sources (adb polling, usbmuxd events)
//! - **Normalize**: backend output to canonical [`DeviceEvent`]s
//! - **Watcher**: merged, deduplicated device set with observer callbacks
//! - **Protocol**: connection handshake and the usbmuxd wire codec
//! - **Transport**: host/device connections, looping I/O, connection factory
//! - **Context**: config, runtime handle, backends and tunnels in one place
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mdt_core::{Config, Connection, Context, DeviceWatcher, Role, TransportFactory};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let ctx = Arc::new(Context::from_config(Config::default(), runtime.handle().clone()));
//!
//! let mut watcher = DeviceWatcher::new(ctx.clone());
//! watcher.on_device_added(|device| println!("+ {device}"));
//! watcher.start().expect("no discovery backend");
//!
//! let factory = TransportFactory::new(&ctx, Role::Host);
//! loop {
//!     watcher.drain();
//!     if let Some(device) = watcher.devices().first() {
//!         let conn = factory.connect(device).expect("connect failed");
//!         conn.send(b"hello").unwrap();
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod events;
pub mod normalize;
pub mod protocol;
pub mod transport;
pub mod watcher;

// Re-exports for convenience
pub use backend::{
    AdbBackend, Backend, DiscoveryError, EventSink, PollBackend, PushBackend, Subscription,
    UsbmuxBackend,
};
pub use config::{Config, ConfigError};
pub use context::{Context, ContextBuilder};
pub use device::{ConnectionKind, DeviceInfo, DeviceKind};
pub use events::{DeviceEvent, DeviceEventKind, ObserverId};
pub use protocol::{HANDSHAKE_VALUE, UsbmuxError};
pub use transport::{
    ByteStream, Connection, ConnectionState, DeviceConnection, HandshakeFailure, HostConnection,
    Link, Role, TransportError, TransportFactory, Tunnel,
};
pub use watcher::{DeviceWatcher, WatcherState};
