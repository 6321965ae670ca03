//! Wire protocols: the connection handshake and the usbmuxd binary protocol.

pub mod handshake;
pub mod usbmux;

pub use handshake::{HANDSHAKE_VALUE, perform as handshake};
pub use usbmux::{DeviceRecord, Reply, Request, UsbmuxError};
