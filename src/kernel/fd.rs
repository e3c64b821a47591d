//! File descriptors
//!
//! Descriptors are numbered by a per-kernel counter starting at 3, so a
//! closed number is not handed out again until the counter wraps.

use super::errno::{SyscallError, SyscallResult};
use super::process::Pid;
use crate::vfs::NodeId;
use std::collections::BTreeMap;
use std::fmt;

/// File descriptor number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(pub u32);

impl Fd {
    /// First number handed out; 0-2 are reserved for the standard streams
    pub const FIRST: Fd = Fd(3);
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Open flags, Linux numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const O_RDONLY: u32 = 0x0000;
    pub const O_WRONLY: u32 = 0x0001;
    pub const O_RDWR: u32 = 0x0002;
    pub const O_CREAT: u32 = 0x0040;
    pub const O_EXCL: u32 = 0x0080;
    pub const O_TRUNC: u32 = 0x0200;
    pub const O_APPEND: u32 = 0x0400;

    const ACCMODE: u32 = 0x0003;
    const KNOWN: u32 = Self::ACCMODE | Self::O_CREAT | Self::O_EXCL | Self::O_TRUNC | Self::O_APPEND;

    pub const READ: OpenFlags = OpenFlags(Self::O_RDONLY);
    pub const WRITE: OpenFlags = OpenFlags(Self::O_WRONLY | Self::O_CREAT | Self::O_TRUNC);
    pub const RDWR: OpenFlags = OpenFlags(Self::O_RDWR);
    pub const APPEND: OpenFlags = OpenFlags(Self::O_WRONLY | Self::O_CREAT | Self::O_APPEND);

    /// Reject access mode 3 and unknown bits
    pub fn validate(bits: u32) -> SyscallResult<Self> {
        if bits & !Self::KNOWN != 0 || bits & Self::ACCMODE == Self::ACCMODE {
            return Err(SyscallError::InvalidArgument);
        }
        Ok(OpenFlags(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn readable(self) -> bool {
        self.0 & Self::ACCMODE != Self::O_WRONLY
    }

    pub fn writable(self) -> bool {
        matches!(self.0 & Self::ACCMODE, Self::O_WRONLY | Self::O_RDWR)
    }

    pub fn create(self) -> bool {
        self.0 & Self::O_CREAT != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 & Self::O_EXCL != 0
    }

    pub fn truncate(self) -> bool {
        self.0 & Self::O_TRUNC != 0
    }

    pub fn append(self) -> bool {
        self.0 & Self::O_APPEND != 0
    }
}

/// What a descriptor refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A shadow file, by normalized path; switches to the overlay on copy-up
    Shadow(String),
    /// An overlay node; `serial` detects a freed slot being reused
    Overlay { node: NodeId, serial: u64 },
}

#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub fd: Fd,
    pub path: String,
    pub flags: OpenFlags,
    pub offset: u64,
    pub target: Target,
    pub owner: Pid,
}

impl FileDescriptor {
    pub fn origin(&self) -> crate::vfs::Origin {
        match self.target {
            Target::Shadow(_) => crate::vfs::Origin::Shadow,
            Target::Overlay { .. } => crate::vfs::Origin::Overlay,
        }
    }
}

/// Every open descriptor of a kernel
#[derive(Debug)]
pub struct FdTable {
    open: BTreeMap<Fd, FileDescriptor>,
    next: u32,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            open: BTreeMap::new(),
            next: Fd::FIRST.0,
        }
    }

    /// Allocate the next descriptor number
    fn allocate(&mut self) -> Fd {
        loop {
            let fd = Fd(self.next);
            self.next = match self.next.checked_add(1) {
                Some(n) => n,
                None => {
                    log::warn!("fd counter wrapped");
                    Fd::FIRST.0
                }
            };
            if !self.open.contains_key(&fd) {
                return fd;
            }
        }
    }

    pub fn insert(
        &mut self,
        path: String,
        flags: OpenFlags,
        target: Target,
        owner: Pid,
    ) -> Fd {
        let fd = self.allocate();
        self.open.insert(
            fd,
            FileDescriptor {
                fd,
                path,
                flags,
                offset: 0,
                target,
                owner,
            },
        );
        fd
    }

    pub fn get(&self, fd: Fd) -> SyscallResult<&FileDescriptor> {
        self.open.get(&fd).ok_or(SyscallError::BadFd)
    }

    pub fn get_mut(&mut self, fd: Fd) -> SyscallResult<&mut FileDescriptor> {
        self.open.get_mut(&fd).ok_or(SyscallError::BadFd)
    }

    pub fn remove(&mut self, fd: Fd) -> SyscallResult<FileDescriptor> {
        self.open.remove(&fd).ok_or(SyscallError::BadFd)
    }

    /// Whether any open descriptor still refers to an overlay node
    pub fn references(&self, node: NodeId, serial: u64) -> bool {
        self.open
            .values()
            .any(|d| d.target == Target::Overlay { node, serial })
    }

    /// Descriptors owned by a process
    pub fn owned_by(&self, pid: Pid) -> Vec<Fd> {
        self.open
            .values()
            .filter(|d| d.owner == pid)
            .map(|d| d.fd)
            .collect()
    }

    /// Drop every descriptor; the counter keeps going
    pub fn clear(&mut self) -> usize {
        let count = self.open.len();
        self.open.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    #[cfg(test)]
    fn set_next(&mut self, next: u32) {
        self.next = next;
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(table: &mut FdTable, path: &str) -> Fd {
        table.insert(
            path.to_string(),
            OpenFlags::READ,
            Target::Shadow(path.to_string()),
            Pid::INIT,
        )
    }

    #[test]
    fn test_flag_validation() {
        assert!(OpenFlags::validate(OpenFlags::O_RDONLY).is_ok());
        assert!(OpenFlags::validate(OpenFlags::O_RDWR | OpenFlags::O_CREAT).is_ok());
        assert_eq!(
            OpenFlags::validate(0x3),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            OpenFlags::validate(0x1000),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn test_access_modes() {
        assert!(OpenFlags::READ.readable());
        assert!(!OpenFlags::READ.writable());
        assert!(!OpenFlags::WRITE.readable());
        assert!(OpenFlags::WRITE.writable());
        assert!(OpenFlags::RDWR.readable() && OpenFlags::RDWR.writable());
        assert!(OpenFlags::APPEND.append());
    }

    #[test]
    fn test_fds_are_monotonic() {
        let mut table = FdTable::new();
        let a = open(&mut table, "/a");
        let b = open(&mut table, "/b");
        assert_eq!(a, Fd(3));
        assert_eq!(b, Fd(4));
        table.remove(a).unwrap();
        let c = open(&mut table, "/c");
        assert_eq!(c, Fd(5));
    }

    #[test]
    fn test_closed_fd_is_bad() {
        let mut table = FdTable::new();
        let fd = open(&mut table, "/a");
        table.remove(fd).unwrap();
        assert_eq!(table.get(fd).err(), Some(SyscallError::BadFd));
        assert_eq!(table.remove(fd).err(), Some(SyscallError::BadFd));
    }

    #[test]
    fn test_wrap_skips_open_fds() {
        let mut table = FdTable::new();
        let held = open(&mut table, "/held");
        table.set_next(u32::MAX);
        assert_eq!(open(&mut table, "/x"), Fd(u32::MAX));
        // 3 is still open, so the wrapped counter moves past it
        assert_eq!(open(&mut table, "/y"), Fd(4));
        assert!(table.get(held).is_ok());
    }

    #[test]
    fn test_owned_by_and_references() {
        let mut table = FdTable::new();
        let fd = table.insert(
            "/f".into(),
            OpenFlags::RDWR,
            Target::Overlay { node: 7, serial: 2 },
            Pid(4),
        );
        open(&mut table, "/g");
        assert_eq!(table.owned_by(Pid(4)), vec![fd]);
        assert!(table.references(7, 2));
        assert!(!table.references(7, 3));
        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
    }
}
