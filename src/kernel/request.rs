//! Typed requests and replies
//!
//! Every message type has a fixed payload schema. The bus converts a decoded
//! [`Message`] into a closed [`Request`] before any handler runs, and turns
//! the handler's [`Reply`] back into response bytes. The host side uses the
//! same types in the other direction.
//!
//! Integers are little-endian; strings inside payloads are a u32 byte length
//! followed by UTF-8.

use super::errno::{SyscallError, SyscallResult};
use super::fd::Fd;
use super::process::{ExitStatus, Pid, ProcessInfo, ProcessState};
use super::tty::TtySide;
use crate::protocol::{MAX_PATH_LEN, Message, MessageType};
use crate::vfs::{DirEntry, Metadata, NodeKind, Origin, ShadowManifest};

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Open { path: String, flags: u32, mode: u32 },
    Read { fd: Fd, count: u32 },
    Write { fd: Fd, data: Vec<u8> },
    Close { fd: Fd },
    Stat { path: String },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    Unlink { path: String },
    Rename { from: String, to: String },
    ReadDir { path: String },
    /// `parent: None` spawns under the current process
    Spawn { parent: Option<Pid>, command: String },
    Kill { pid: Pid },
    Wait { pid: Pid },
    List,
    Exit { pid: Pid, code: i32 },
    TtyRead { side: TtySide, count: u32 },
    TtyWrite { side: TtySide, data: Vec<u8> },
    Ioctl { request: u32, arg: Vec<u8> },
    LoadManifest(ShadowManifest),
    Reload,
    Hydrate { location: String, data: Vec<u8> },
    Export,
    Import(Vec<u8>),
}

impl Request {
    pub fn kind(&self) -> MessageType {
        match self {
            Request::Open { .. } => MessageType::FsOpen,
            Request::Read { .. } => MessageType::FsRead,
            Request::Write { .. } => MessageType::FsWrite,
            Request::Close { .. } => MessageType::FsClose,
            Request::Stat { .. } => MessageType::FsStat,
            Request::Mkdir { .. } => MessageType::FsMkdir,
            Request::Rmdir { .. } => MessageType::FsRmdir,
            Request::Unlink { .. } => MessageType::FsUnlink,
            Request::Rename { .. } => MessageType::FsRename,
            Request::ReadDir { .. } => MessageType::FsReaddir,
            Request::Spawn { .. } => MessageType::ProcSpawn,
            Request::Kill { .. } => MessageType::ProcKill,
            Request::Wait { .. } => MessageType::ProcWait,
            Request::List => MessageType::ProcList,
            Request::Exit { .. } => MessageType::ProcExit,
            Request::TtyRead { .. } => MessageType::TtyRead,
            Request::TtyWrite { .. } => MessageType::TtyWrite,
            Request::Ioctl { .. } => MessageType::TtyIoctl,
            Request::LoadManifest(_) => MessageType::LayerLoadManifest,
            Request::Reload => MessageType::LayerReload,
            Request::Hydrate { .. } => MessageType::LayerHydrate,
            Request::Export => MessageType::LayerExport,
            Request::Import(_) => MessageType::LayerImport,
        }
    }

    /// Validate a message payload against the schema of its type
    pub fn parse(msg: Message) -> SyscallResult<Self> {
        let Message {
            kind,
            flags,
            path,
            data,
            ..
        } = msg;
        let mut r = PayloadReader::new(&data);

        let request = match kind {
            MessageType::FsOpen => {
                let mode = optional_mode(&mut r)?;
                Request::Open {
                    path: require_path(path)?,
                    flags,
                    mode,
                }
            }
            MessageType::FsRead => {
                let fd = Fd(r.u32()?);
                let count = r.u32()?;
                r.finish()?;
                Request::Read { fd, count }
            }
            MessageType::FsWrite => {
                let fd = Fd(r.u32()?);
                Request::Write {
                    fd,
                    data: r.rest().to_vec(),
                }
            }
            MessageType::FsClose => {
                let fd = Fd(r.u32()?);
                r.finish()?;
                Request::Close { fd }
            }
            MessageType::FsStat => {
                r.finish()?;
                Request::Stat {
                    path: require_path(path)?,
                }
            }
            MessageType::FsMkdir => {
                let mode = optional_mode(&mut r)?;
                Request::Mkdir {
                    path: require_path(path)?,
                    mode,
                }
            }
            MessageType::FsRmdir => {
                r.finish()?;
                Request::Rmdir {
                    path: require_path(path)?,
                }
            }
            MessageType::FsUnlink => {
                r.finish()?;
                Request::Unlink {
                    path: require_path(path)?,
                }
            }
            MessageType::FsRename => {
                let to = utf8(r.rest())?;
                if to.len() > MAX_PATH_LEN {
                    return Err(SyscallError::NameTooLong);
                }
                Request::Rename {
                    from: require_path(path)?,
                    to: require_path(to)?,
                }
            }
            MessageType::FsReaddir => {
                r.finish()?;
                Request::ReadDir {
                    path: require_path(path)?,
                }
            }
            MessageType::ProcSpawn => {
                let parent = match r.u32()? {
                    0 => None,
                    pid => Some(Pid(pid)),
                };
                Request::Spawn {
                    parent,
                    command: utf8(r.rest())?,
                }
            }
            MessageType::ProcKill => {
                let pid = Pid(r.u32()?);
                r.finish()?;
                Request::Kill { pid }
            }
            MessageType::ProcWait => {
                let pid = Pid(r.u32()?);
                r.finish()?;
                Request::Wait { pid }
            }
            MessageType::ProcList => {
                r.finish()?;
                Request::List
            }
            MessageType::ProcExit => {
                let pid = Pid(r.u32()?);
                let code = r.i32()?;
                r.finish()?;
                Request::Exit { pid, code }
            }
            MessageType::TtyRead => {
                let side = match flags {
                    0 => TtySide::Output,
                    1 => TtySide::Input,
                    _ => return Err(SyscallError::InvalidArgument),
                };
                let count = r.u32()?;
                r.finish()?;
                Request::TtyRead { side, count }
            }
            MessageType::TtyWrite => {
                let side = match flags {
                    0 => TtySide::Input,
                    1 => TtySide::Output,
                    _ => return Err(SyscallError::InvalidArgument),
                };
                Request::TtyWrite {
                    side,
                    data: r.rest().to_vec(),
                }
            }
            MessageType::TtyIoctl => {
                let request = r.u32()?;
                Request::Ioctl {
                    request,
                    arg: r.rest().to_vec(),
                }
            }
            MessageType::LayerLoadManifest => Request::LoadManifest(ShadowManifest::from_json(&data)?),
            MessageType::LayerReload => {
                r.finish()?;
                Request::Reload
            }
            MessageType::LayerHydrate => {
                let location = r.string()?;
                if location.is_empty() {
                    return Err(SyscallError::InvalidArgument);
                }
                Request::Hydrate {
                    location,
                    data: r.rest().to_vec(),
                }
            }
            MessageType::LayerExport => {
                r.finish()?;
                Request::Export
            }
            MessageType::LayerImport => Request::Import(data),
        };
        Ok(request)
    }

    /// Build the request message (host side)
    pub fn to_message(&self) -> Message {
        let msg = Message::new(self.kind());
        let mut w = PayloadWriter::new();
        match self {
            Request::Open { path, flags, mode } => {
                w.u32(*mode);
                msg.with_path(path.clone()).with_flags(*flags).with_data(w.finish())
            }
            Request::Read { fd, count } => {
                w.u32(fd.0);
                w.u32(*count);
                msg.with_data(w.finish())
            }
            Request::Write { fd, data } => {
                w.u32(fd.0);
                w.bytes(data);
                msg.with_data(w.finish())
            }
            Request::Close { fd } => {
                w.u32(fd.0);
                msg.with_data(w.finish())
            }
            Request::Stat { path }
            | Request::Rmdir { path }
            | Request::Unlink { path }
            | Request::ReadDir { path } => msg.with_path(path.clone()),
            Request::Mkdir { path, mode } => {
                w.u32(*mode);
                msg.with_path(path.clone()).with_data(w.finish())
            }
            Request::Rename { from, to } => {
                msg.with_path(from.clone()).with_data(to.as_bytes().to_vec())
            }
            Request::Spawn { parent, command } => {
                w.u32(parent.map_or(0, |p| p.0));
                w.bytes(command.as_bytes());
                msg.with_data(w.finish())
            }
            Request::Kill { pid } | Request::Wait { pid } => {
                w.u32(pid.0);
                msg.with_data(w.finish())
            }
            Request::List | Request::Reload | Request::Export => msg,
            Request::Exit { pid, code } => {
                w.u32(pid.0);
                w.i32(*code);
                msg.with_data(w.finish())
            }
            Request::TtyRead { side, count } => {
                let side = match side {
                    TtySide::Output => 0,
                    TtySide::Input => 1,
                };
                w.u32(*count);
                msg.with_flags(side).with_data(w.finish())
            }
            Request::TtyWrite { side, data } => {
                let side = match side {
                    TtySide::Input => 0,
                    TtySide::Output => 1,
                };
                msg.with_flags(side).with_data(data.clone())
            }
            Request::Ioctl { request, arg } => {
                w.u32(*request);
                w.bytes(arg);
                msg.with_data(w.finish())
            }
            Request::LoadManifest(manifest) => {
                msg.with_data(manifest.to_json().unwrap_or_default())
            }
            Request::Hydrate { location, data } => {
                w.string(location);
                w.bytes(data);
                msg.with_data(w.finish())
            }
            Request::Import(data) => msg.with_data(data.clone()),
        }
    }
}

fn require_path(path: String) -> SyscallResult<String> {
    if path.is_empty() {
        return Err(SyscallError::InvalidArgument);
    }
    Ok(path)
}

fn optional_mode(r: &mut PayloadReader<'_>) -> SyscallResult<u32> {
    if r.remaining() == 0 {
        return Ok(0);
    }
    let mode = r.u32()?;
    r.finish()?;
    Ok(mode)
}

fn utf8(bytes: &[u8]) -> SyscallResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| SyscallError::InvalidArgument)
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Fd(Fd),
    Bytes(Vec<u8>),
    Count(u32),
    Stat(Metadata),
    Entries(Vec<DirEntry>),
    Pid(Pid),
    Status(ExitStatus),
    Processes(Vec<ProcessInfo>),
    Loaded(bool),
    Done,
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        match self {
            Reply::Fd(fd) => w.u32(fd.0),
            Reply::Bytes(bytes) => w.bytes(bytes),
            Reply::Count(n) => w.u32(*n),
            Reply::Stat(meta) => {
                w.u64(meta.size);
                w.u32(meta.kind.code());
                w.u32(meta.origin.code());
                w.f64(meta.created);
                w.f64(meta.modified);
                w.u32(meta.dirty as u32);
                w.string(&meta.id);
            }
            Reply::Entries(entries) => {
                w.u32(entries.len() as u32);
                for entry in entries {
                    w.u32(entry.kind.code());
                    w.u32(entry.origin.code());
                    w.u64(entry.size);
                    w.string(&entry.name);
                    w.string(&entry.id);
                }
            }
            Reply::Pid(pid) => w.u32(pid.0),
            Reply::Status(status) => {
                let (kind, code) = status.encode();
                w.u32(kind);
                w.i32(code);
            }
            Reply::Processes(list) => {
                w.u32(list.len() as u32);
                for info in list {
                    w.u32(info.pid.0);
                    w.u32(info.ppid);
                    let (state, kind, code) = match info.state {
                        ProcessState::Running => (0, 0, 0),
                        ProcessState::Exited(status) => {
                            let (kind, code) = status.encode();
                            (1, kind, code)
                        }
                    };
                    w.u32(state);
                    w.u32(kind);
                    w.i32(code);
                    w.u32(info.fds.len() as u32);
                    for fd in &info.fds {
                        w.u32(fd.0);
                    }
                    w.string(&info.command);
                }
            }
            Reply::Loaded(loaded) => w.u32(*loaded as u32),
            Reply::Done => {}
        }
        w.finish()
    }

    /// Decode response data for a message type (host side)
    pub fn decode(kind: MessageType, data: &[u8]) -> SyscallResult<Self> {
        let mut r = PayloadReader::new(data);
        let reply = match kind {
            MessageType::FsOpen => Reply::Fd(Fd(r.u32()?)),
            MessageType::FsRead | MessageType::TtyRead | MessageType::TtyIoctl | MessageType::LayerExport => {
                Reply::Bytes(r.rest().to_vec())
            }
            MessageType::FsWrite | MessageType::TtyWrite => Reply::Count(r.u32()?),
            MessageType::FsStat => {
                let size = r.u64()?;
                let kind = NodeKind::from_code(r.u32()?).ok_or(SyscallError::InvalidArgument)?;
                let origin = Origin::from_code(r.u32()?).ok_or(SyscallError::InvalidArgument)?;
                let created = r.f64()?;
                let modified = r.f64()?;
                let dirty = r.u32()? != 0;
                let id = r.string()?;
                Reply::Stat(Metadata {
                    id,
                    kind,
                    size,
                    created,
                    modified,
                    origin,
                    dirty,
                })
            }
            MessageType::FsReaddir => {
                let count = r.u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let kind = NodeKind::from_code(r.u32()?).ok_or(SyscallError::InvalidArgument)?;
                    let origin = Origin::from_code(r.u32()?).ok_or(SyscallError::InvalidArgument)?;
                    let size = r.u64()?;
                    let name = r.string()?;
                    let id = r.string()?;
                    entries.push(DirEntry {
                        id,
                        name,
                        kind,
                        size,
                        origin,
                    });
                }
                Reply::Entries(entries)
            }
            MessageType::ProcSpawn => Reply::Pid(Pid(r.u32()?)),
            MessageType::ProcWait => {
                let kind = r.u32()?;
                let code = r.i32()?;
                Reply::Status(ExitStatus::decode(kind, code).ok_or(SyscallError::InvalidArgument)?)
            }
            MessageType::ProcList => {
                let count = r.u32()?;
                let mut list = Vec::new();
                for _ in 0..count {
                    let pid = Pid(r.u32()?);
                    let ppid = r.u32()?;
                    let state = r.u32()?;
                    let kind = r.u32()?;
                    let code = r.i32()?;
                    let fd_count = r.u32()?;
                    let mut fds = Vec::new();
                    for _ in 0..fd_count {
                        fds.push(Fd(r.u32()?));
                    }
                    let command = r.string()?;
                    let state = match state {
                        0 => ProcessState::Running,
                        1 => ProcessState::Exited(
                            ExitStatus::decode(kind, code).ok_or(SyscallError::InvalidArgument)?,
                        ),
                        _ => return Err(SyscallError::InvalidArgument),
                    };
                    list.push(ProcessInfo {
                        pid,
                        ppid,
                        command,
                        state,
                        fds,
                    });
                }
                Reply::Processes(list)
            }
            MessageType::LayerLoadManifest => Reply::Loaded(r.u32()? != 0),
            _ => Reply::Done,
        };
        r.finish()?;
        Ok(reply)
    }
}

/// Cursor over a payload; running short is `EINVAL`
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> SyscallResult<[u8; N]> {
        let end = self.pos.checked_add(N).ok_or(SyscallError::InvalidArgument)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(SyscallError::InvalidArgument)?;
        self.pos = end;
        <[u8; N]>::try_from(bytes).map_err(|_| SyscallError::InvalidArgument)
    }

    pub fn u32(&mut self) -> SyscallResult<u32> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> SyscallResult<i32> {
        self.take().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> SyscallResult<u64> {
        self.take().map(u64::from_le_bytes)
    }

    pub fn f64(&mut self) -> SyscallResult<f64> {
        self.take().map(f64::from_le_bytes)
    }

    /// Length-prefixed UTF-8
    pub fn string(&mut self) -> SyscallResult<String> {
        let len = self.u32()? as usize;
        let end = self.pos.checked_add(len).ok_or(SyscallError::InvalidArgument)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(SyscallError::InvalidArgument)?;
        self.pos = end;
        utf8(bytes)
    }

    /// Everything not yet read
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Trailing bytes are a schema violation
    pub fn finish(&self) -> SyscallResult<()> {
        if self.remaining() != 0 {
            return Err(SyscallError::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct PayloadWriter {
    data: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
    }

    pub fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}
