//! Binary codec for [`Message`]
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! version:u32 | type:u32 | flags:u32 | seq:u32 | data_len:u32 | path:[u8; 256] | data
//! ```
//!
//! The path field is NUL padded. Paths that do not fit are rejected, never
//! truncated.

use super::{
    HEADER_SIZE, MAX_DATA_LEN, MAX_PATH_LEN, Message, MessageType, PATH_CAPACITY,
    PROTOCOL_VERSION,
};
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Errors produced while encoding or decoding a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer of {len} bytes is shorter than the message header")]
    Truncated { len: usize },
    #[error("unsupported protocol version {0}")]
    BadVersion(u32),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("header declares {declared} payload bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {len} bytes exceeds the payload limit")]
    DataTooLarge { len: usize },
    #[error("path of {len} bytes exceeds the path limit")]
    PathTooLong { len: usize },
    #[error("path field is not NUL terminated")]
    UnterminatedPath,
    #[error("path is not valid UTF-8 or contains NUL")]
    InvalidPath,
}

/// On-wire header, stored little-endian
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct WireHeader {
    version: u32,
    kind: u32,
    flags: u32,
    seq: u32,
    data_len: u32,
    path: [u8; PATH_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<WireHeader>() == HEADER_SIZE);

/// Total encoded size of a message
pub fn encoded_len(msg: &Message) -> usize {
    HEADER_SIZE + msg.data.len()
}

/// Encode a message into a fresh buffer
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let path = msg.path.as_bytes();
    if path.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathTooLong { len: path.len() });
    }
    if path.contains(&0) {
        return Err(ProtocolError::InvalidPath);
    }
    if msg.data.len() > MAX_DATA_LEN {
        return Err(ProtocolError::DataTooLarge {
            len: msg.data.len(),
        });
    }

    let mut header = WireHeader::zeroed();
    header.version = msg.version.to_le();
    header.kind = msg.kind.num().to_le();
    header.flags = msg.flags.to_le();
    header.seq = msg.seq.to_le();
    header.data_len = (msg.data.len() as u32).to_le();
    header.path[..path.len()].copy_from_slice(path);

    let mut buf = Vec::with_capacity(encoded_len(msg));
    buf.extend_from_slice(bytemuck::bytes_of(&header));
    buf.extend_from_slice(&msg.data);
    Ok(buf)
}

/// Decode a message, validating every header field against the buffer
pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated { len: buf.len() });
    }
    let header: WireHeader = bytemuck::pod_read_unaligned(&buf[..HEADER_SIZE]);

    let version = u32::from_le(header.version);
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }

    let raw_kind = u32::from_le(header.kind);
    let kind = MessageType::from_u32(raw_kind).ok_or(ProtocolError::UnknownType(raw_kind))?;

    let declared = u32::from_le(header.data_len) as usize;
    let payload = &buf[HEADER_SIZE..];
    if declared != payload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    if declared > MAX_DATA_LEN {
        return Err(ProtocolError::DataTooLarge { len: declared });
    }

    let path = decode_path(&header.path)?;

    Ok(Message {
        version,
        kind,
        flags: u32::from_le(header.flags),
        seq: u32::from_le(header.seq),
        path,
        data: payload.to_vec(),
    })
}

fn decode_path(field: &[u8; PATH_CAPACITY]) -> Result<String, ProtocolError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnterminatedPath)?;
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidPath)
}
