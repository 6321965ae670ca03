//! Transport layer module.

pub mod device;
pub mod factory;
pub mod host;
pub mod link;
pub mod mock;
pub mod traits;

pub use device::DeviceConnection;
pub use factory::TransportFactory;
pub use host::HostConnection;
pub use link::Link;
pub use mock::{MockStream, MockTunnel};
pub use traits::{
    ByteStream, Connection, ConnectionState, HandshakeFailure, Role, TransportError,
    TransportFuture, Tunnel,
};
