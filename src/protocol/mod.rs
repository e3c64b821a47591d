//! Wire protocol
//!
//! Every call into the kernel is a single fixed-layout message: a 276-byte
//! little-endian header followed by `data_len` payload bytes. Responses use
//! the same layout and echo the request's type, sequence number and path.

pub mod codec;

pub use codec::{ProtocolError, decode, encode};

use std::fmt;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u32 = 1;

/// Bytes reserved for the path field on the wire, NUL terminator included
pub const PATH_CAPACITY: usize = 256;

/// Longest path a message can carry, in bytes of UTF-8
pub const MAX_PATH_LEN: usize = PATH_CAPACITY - 1;

/// Size of the fixed header: five u32 fields plus the path field
pub const HEADER_SIZE: usize = 5 * 4 + PATH_CAPACITY;

/// Largest payload a single message may carry
pub const MAX_DATA_LEN: usize = 1 << 20;

/// Header flag bits
///
/// Requests use the low bits for per-type options (open flags, tty side);
/// the kernel sets the high bits on responses.
pub mod flags {
    pub const RESPONSE: u32 = 1 << 31;
    pub const ERROR: u32 = 1 << 30;
    pub const FATAL: u32 = 1 << 29;
}

/// Kernel component a message type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Fs,
    Proc,
    Tty,
    Layer,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Fs => "fs",
            Component::Proc => "proc",
            Component::Tty => "tty",
            Component::Layer => "layer",
        };
        f.write_str(name)
    }
}

/// Message type numbers
///
/// Numbers are grouped by component: 1-15 filesystem, 16-31 processes,
/// 32-47 terminal, 48-63 layer management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageType {
    // Filesystem
    FsRead = 1,
    FsWrite = 2,
    FsOpen = 3,
    FsClose = 4,
    FsStat = 5,
    FsMkdir = 6,
    FsRmdir = 7,
    FsUnlink = 8,
    FsRename = 9,
    FsReaddir = 10,

    // Processes
    ProcSpawn = 16,
    ProcKill = 17,
    ProcWait = 18,
    ProcList = 19,
    ProcExit = 20,

    // Terminal
    TtyRead = 32,
    TtyWrite = 33,
    TtyIoctl = 34,

    // Layer management
    LayerLoadManifest = 48,
    LayerReload = 49,
    LayerHydrate = 50,
    LayerExport = 51,
    LayerImport = 52,
}

impl MessageType {
    /// Every message type, in numeric order
    pub const ALL: [MessageType; 23] = [
        MessageType::FsRead,
        MessageType::FsWrite,
        MessageType::FsOpen,
        MessageType::FsClose,
        MessageType::FsStat,
        MessageType::FsMkdir,
        MessageType::FsRmdir,
        MessageType::FsUnlink,
        MessageType::FsRename,
        MessageType::FsReaddir,
        MessageType::ProcSpawn,
        MessageType::ProcKill,
        MessageType::ProcWait,
        MessageType::ProcList,
        MessageType::ProcExit,
        MessageType::TtyRead,
        MessageType::TtyWrite,
        MessageType::TtyIoctl,
        MessageType::LayerLoadManifest,
        MessageType::LayerReload,
        MessageType::LayerHydrate,
        MessageType::LayerExport,
        MessageType::LayerImport,
    ];

    pub fn from_u32(n: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.num() == n)
    }

    pub fn num(self) -> u32 {
        self as u32
    }

    pub fn component(self) -> Component {
        match self.num() {
            1..=15 => Component::Fs,
            16..=31 => Component::Proc,
            32..=47 => Component::Tty,
            _ => Component::Layer,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::FsRead => "FS_READ",
            MessageType::FsWrite => "FS_WRITE",
            MessageType::FsOpen => "FS_OPEN",
            MessageType::FsClose => "FS_CLOSE",
            MessageType::FsStat => "FS_STAT",
            MessageType::FsMkdir => "FS_MKDIR",
            MessageType::FsRmdir => "FS_RMDIR",
            MessageType::FsUnlink => "FS_UNLINK",
            MessageType::FsRename => "FS_RENAME",
            MessageType::FsReaddir => "FS_READDIR",
            MessageType::ProcSpawn => "PROC_SPAWN",
            MessageType::ProcKill => "PROC_KILL",
            MessageType::ProcWait => "PROC_WAIT",
            MessageType::ProcList => "PROC_LIST",
            MessageType::ProcExit => "PROC_EXIT",
            MessageType::TtyRead => "TTY_READ",
            MessageType::TtyWrite => "TTY_WRITE",
            MessageType::TtyIoctl => "TTY_IOCTL",
            MessageType::LayerLoadManifest => "LAYER_LOAD_MANIFEST",
            MessageType::LayerReload => "LAYER_RELOAD",
            MessageType::LayerHydrate => "LAYER_HYDRATE",
            MessageType::LayerExport => "LAYER_EXPORT",
            MessageType::LayerImport => "LAYER_IMPORT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u32,
    pub kind: MessageType,
    pub flags: u32,
    pub seq: u32,
    pub path: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            flags: 0,
            seq: 0,
            path: String::new(),
            data: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Build a successful response to this request
    pub fn respond(&self, data: Vec<u8>) -> Message {
        Message {
            version: PROTOCOL_VERSION,
            kind: self.kind,
            flags: flags::RESPONSE,
            seq: self.seq,
            path: self.path.clone(),
            data,
        }
    }

    /// Build an error response carrying `code` and an optional detail string
    pub fn respond_error(&self, code: i32, detail: &str, fatal: bool) -> Message {
        let mut data = Vec::with_capacity(4 + detail.len());
        data.extend_from_slice(&code.to_le_bytes());
        data.extend_from_slice(detail.as_bytes());
        let mut bits = flags::RESPONSE | flags::ERROR;
        if fatal {
            bits |= flags::FATAL;
        }
        Message {
            version: PROTOCOL_VERSION,
            kind: self.kind,
            flags: bits,
            seq: self.seq,
            path: self.path.clone(),
            data,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & flags::RESPONSE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & flags::ERROR != 0
    }

    pub fn is_fatal(&self) -> bool {
        self.flags & flags::FATAL != 0
    }

    /// Error code and detail of an error response
    pub fn error_code(&self) -> Option<(i32, String)> {
        if !self.is_error() || self.data.len() < 4 {
            return None;
        }
        let code = i32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        let detail = String::from_utf8_lossy(&self.data[4..]).into_owned();
        Some((code, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_numbers() {
        assert_eq!(MessageType::FsRead.num(), 1);
        assert_eq!(MessageType::FsRename.num(), 9);
        assert_eq!(MessageType::ProcSpawn.num(), 16);
        assert_eq!(MessageType::TtyIoctl.num(), 34);
        assert_eq!(MessageType::from_u32(33), Some(MessageType::TtyWrite));
        assert_eq!(MessageType::from_u32(11), None);
        assert_eq!(MessageType::from_u32(0), None);
    }

    #[test]
    fn test_components() {
        assert_eq!(MessageType::FsReaddir.component(), Component::Fs);
        assert_eq!(MessageType::ProcExit.component(), Component::Proc);
        assert_eq!(MessageType::TtyRead.component(), Component::Tty);
        assert_eq!(MessageType::LayerReload.component(), Component::Layer);
    }

    #[test]
    fn test_error_response() {
        let req = Message::new(MessageType::FsStat)
            .with_path("/missing")
            .with_seq(7);
        let resp = req.respond_error(2, "", false);
        assert!(resp.is_response());
        assert!(resp.is_error());
        assert!(!resp.is_fatal());
        assert_eq!(resp.seq, 7);
        assert_eq!(resp.kind, MessageType::FsStat);
        assert_eq!(resp.error_code(), Some((2, String::new())));
    }

    #[test]
    fn test_success_response_has_no_error_code() {
        let req = Message::new(MessageType::FsClose).with_seq(3);
        let resp = req.respond(vec![1, 2, 3, 4]);
        assert!(resp.is_response());
        assert_eq!(resp.error_code(), None);
    }
}
