//! Device discovery backends.

pub mod adb;
pub mod mock;
pub mod traits;
pub mod usbmux;

pub use adb::AdbBackend;
pub use mock::{MockPollBackend, MockPushBackend};
pub use traits::{Backend, DiscoveryError, EventSink, PollBackend, PushBackend, Subscription};
pub use usbmux::{UsbmuxAddress, UsbmuxBackend};
