//! usbmuxd binary protocol (version 0).
//!
//! Every message starts with a 16-byte little-endian header
//! `{length, version, message, tag}` where `length` includes the header.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 0;
pub const HEADER_SIZE: usize = 16;
pub const SERIAL_SIZE: usize = 256;
/// `{device_id u32, product_id u16, serial[256], padding u16, location u32}`
pub const DEVICE_RECORD_SIZE: usize = 4 + 2 + SERIAL_SIZE + 2 + 4;
/// Upper bound on a single message; anything larger is a framing error.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

// Message types
pub const MESSAGE_RESULT: u32 = 1;
pub const MESSAGE_CONNECT: u32 = 2;
pub const MESSAGE_LISTEN: u32 = 3;
pub const MESSAGE_DEVICE_ADD: u32 = 4;
pub const MESSAGE_DEVICE_REMOVE: u32 = 5;
pub const MESSAGE_DEVICE_PAIRED: u32 = 6;

// Result codes
pub const RESULT_OK: u32 = 0;
pub const RESULT_BAD_COMMAND: u32 = 1;
pub const RESULT_BAD_DEVICE: u32 = 2;
pub const RESULT_CONNECTION_REFUSED: u32 = 3;
pub const RESULT_BAD_VERSION: u32 = 6;

#[derive(Error, Debug)]
pub enum UsbmuxError {
    #[error("Unsupported protocol version {0}")]
    BadVersion(u32),

    #[error("Unknown message type {0}")]
    UnknownMessage(u32),

    #[error("Invalid message length {0}")]
    InvalidLength(u32),

    #[error("Payload too short: expected {expected}, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.length);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u32(&mut buf[8..12], self.message);
        LittleEndian::write_u32(&mut buf[12..16], self.tag);
        buf
    }

    pub fn from_bytes(data: &[u8; HEADER_SIZE]) -> Self {
        Self {
            length: LittleEndian::read_u32(&data[0..4]),
            version: LittleEndian::read_u32(&data[4..8]),
            message: LittleEndian::read_u32(&data[8..12]),
            tag: LittleEndian::read_u32(&data[12..16]),
        }
    }
}

/// Client to daemon messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Subscribe to attach/detach notifications on this socket.
    Listen,
    /// Turn this socket into a tunnel to `port` on the device.
    Connect { device_id: u32, port: u16 },
}

impl Request {
    pub fn encode(&self, tag: u32) -> Vec<u8> {
        let (message, payload) = match *self {
            Request::Listen => (MESSAGE_LISTEN, Vec::new()),
            Request::Connect { device_id, port } => {
                let mut payload = vec![0u8; 8];
                LittleEndian::write_u32(&mut payload[0..4], device_id);
                // Port goes out in network byte order; 2 reserved bytes follow.
                BigEndian::write_u16(&mut payload[4..6], port);
                (MESSAGE_CONNECT, payload)
            }
        };

        let header = Header {
            length: (HEADER_SIZE + payload.len()) as u32,
            version: PROTOCOL_VERSION,
            message,
            tag,
        };

        let mut buf = Vec::with_capacity(header.length as usize);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}

/// A device attached to usbmuxd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: u32,
    pub product_id: u16,
    pub serial: String,
    pub location: u32,
}

impl DeviceRecord {
    pub fn from_bytes(data: &[u8]) -> Result<Self, UsbmuxError> {
        if data.len() < DEVICE_RECORD_SIZE {
            return Err(UsbmuxError::Truncated {
                expected: DEVICE_RECORD_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let device_id = cursor.read_u32::<LittleEndian>()?;
        let product_id = cursor.read_u16::<LittleEndian>()?;
        let mut serial = [0u8; SERIAL_SIZE];
        cursor.read_exact(&mut serial)?;
        let _padding = cursor.read_u16::<LittleEndian>()?;
        let location = cursor.read_u32::<LittleEndian>()?;

        let end = serial.iter().position(|&b| b == 0).unwrap_or(SERIAL_SIZE);
        Ok(Self {
            device_id,
            product_id,
            serial: String::from_utf8_lossy(&serial[..end]).into_owned(),
            location,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DEVICE_RECORD_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.device_id);
        LittleEndian::write_u16(&mut buf[4..6], self.product_id);
        let serial = self.serial.as_bytes();
        let n = serial.len().min(SERIAL_SIZE - 1);
        buf[6..6 + n].copy_from_slice(&serial[..n]);
        let tail = 6 + SERIAL_SIZE + 2;
        LittleEndian::write_u32(&mut buf[tail..tail + 4], self.location);
        buf
    }
}

/// Daemon to client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Result(u32),
    DeviceAdd(DeviceRecord),
    DeviceRemove(u32),
    DevicePaired(u32),
}

impl Reply {
    pub fn decode(message: u32, payload: &[u8]) -> Result<Self, UsbmuxError> {
        match message {
            MESSAGE_RESULT => Ok(Reply::Result(read_u32_payload(payload)?)),
            MESSAGE_DEVICE_ADD => Ok(Reply::DeviceAdd(DeviceRecord::from_bytes(payload)?)),
            MESSAGE_DEVICE_REMOVE => Ok(Reply::DeviceRemove(read_u32_payload(payload)?)),
            MESSAGE_DEVICE_PAIRED => Ok(Reply::DevicePaired(read_u32_payload(payload)?)),
            other => Err(UsbmuxError::UnknownMessage(other)),
        }
    }

    /// Encode as the daemon would. Used by tests standing in for usbmuxd.
    pub fn encode(&self, tag: u32) -> Vec<u8> {
        let (message, payload) = match self {
            Reply::Result(code) => (MESSAGE_RESULT, code.to_le_bytes().to_vec()),
            Reply::DeviceAdd(record) => (MESSAGE_DEVICE_ADD, record.to_bytes()),
            Reply::DeviceRemove(id) => (MESSAGE_DEVICE_REMOVE, id.to_le_bytes().to_vec()),
            Reply::DevicePaired(id) => (MESSAGE_DEVICE_PAIRED, id.to_le_bytes().to_vec()),
        };
        let header = Header {
            length: (HEADER_SIZE + payload.len()) as u32,
            version: PROTOCOL_VERSION,
            message,
            tag,
        };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(&payload);
        buf
    }
}

fn read_u32_payload(payload: &[u8]) -> Result<u32, UsbmuxError> {
    if payload.len() < 4 {
        return Err(UsbmuxError::Truncated {
            expected: 4,
            actual: payload.len(),
        });
    }
    Ok(LittleEndian::read_u32(&payload[0..4]))
}

/// Read one full message from `reader`, returning its tag and decoded body.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<(u32, Reply), UsbmuxError> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw)?;
    let header = Header::from_bytes(&raw);

    if header.version != PROTOCOL_VERSION {
        return Err(UsbmuxError::BadVersion(header.version));
    }
    let length = header.length as usize;
    if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(UsbmuxError::InvalidLength(header.length));
    }

    let mut payload = vec![0u8; length - HEADER_SIZE];
    reader.read_exact(&mut payload)?;
    Ok((header.tag, Reply::decode(header.message, &payload)?))
}
