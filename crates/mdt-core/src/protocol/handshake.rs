//! Connection handshake.
//!
//! Both ends exchange the little-endian `i32` value `1` once, before any
//! other byte. The host speaks first; the device answers. This proves the
//! peer process is running and speaks the same integer convention; nothing
//! else is negotiated.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{info, instrument, warn};

use crate::transport::{HandshakeFailure, Link, Role, TransportError};

pub const HANDSHAKE_VALUE: i32 = 1;
pub const HANDSHAKE_SIZE: usize = 4;

/// Run the handshake for `role` on a connected link.
///
/// On failure the link is disposed, never left half-open.
#[instrument(level = "debug", skip(link), fields(timeout_ms = timeout.as_millis() as u64))]
pub fn perform(link: &Link, role: Role, timeout: Duration) -> Result<(), TransportError> {
    let result = match role {
        Role::Host => host(link, timeout),
        Role::Device => device(link, timeout),
    };

    match result {
        Ok(()) => {
            info!(%role, "Handshake complete");
            Ok(())
        }
        Err(failure) => {
            warn!(%role, reason = %failure, "Handshake failed");
            link.dispose();
            Err(TransportError::HandshakeFailed(failure))
        }
    }
}

fn host(link: &Link, timeout: Duration) -> Result<(), HandshakeFailure> {
    send_value(link)?;
    expect_value(link, timeout)
}

fn device(link: &Link, timeout: Duration) -> Result<(), HandshakeFailure> {
    expect_value(link, timeout)?;
    send_value(link)
}

fn send_value(link: &Link) -> Result<(), HandshakeFailure> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    LittleEndian::write_i32(&mut buf, HANDSHAKE_VALUE);
    match link.send(&buf) {
        Ok(HANDSHAKE_SIZE) => Ok(()),
        Ok(_) => Err(HandshakeFailure::Closed),
        Err(e) if e.is_closed() => Err(HandshakeFailure::Closed),
        Err(e) => Err(HandshakeFailure::Io(e.to_string())),
    }
}

fn expect_value(link: &Link, timeout: Duration) -> Result<(), HandshakeFailure> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    let deadline = Instant::now() + timeout;
    let timeout_ms = timeout.as_millis() as u64;

    match link.receive_until(&mut buf, deadline) {
        Ok(HANDSHAKE_SIZE) => {}
        Ok(_) => return Err(HandshakeFailure::Closed),
        Err(TransportError::Timeout { .. }) => return Err(HandshakeFailure::Timeout { timeout_ms }),
        Err(e) if e.is_closed() => return Err(HandshakeFailure::Closed),
        Err(e) => return Err(HandshakeFailure::Io(e.to_string())),
    }

    let received = LittleEndian::read_i32(&buf);
    if received != HANDSHAKE_VALUE {
        return Err(HandshakeFailure::ProtocolMismatch {
            expected: HANDSHAKE_VALUE,
            received,
        });
    }
    Ok(())
}
