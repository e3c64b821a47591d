//! Kernel error codes
//!
//! Every failing operation reports one of these. The numeric codes follow
//! Linux errno numbering and are what travels in error responses.

use thiserror::Error;

/// Result type for kernel operations
pub type SyscallResult<T> = Result<T, SyscallError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    /// No such file or directory
    #[error("no such file or directory")]
    NotFound,
    /// No such process
    #[error("no such process")]
    NoProcess,
    /// Descriptor is not open, or not open for the requested access
    #[error("bad file descriptor")]
    BadFd,
    /// Nothing available yet; the caller should poll again
    #[error("resource temporarily unavailable")]
    WouldBlock,
    /// Allocation failed inside the module. Fatal.
    #[error("out of memory")]
    OutOfMemory,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file name too long")]
    NameTooLong,
    /// No handler is registered for the message type
    #[error("operation not supported")]
    Unsupported,
    #[error("directory not empty")]
    NotEmpty,
    /// Shadow content has not been delivered yet
    #[error("content for {location} is not loaded")]
    ContentPending { location: String },
}

impl SyscallError {
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENAMETOOLONG: i32 = 36;
    pub const ENOSYS: i32 = 38;
    pub const ENOTEMPTY: i32 = 39;
    pub const ENODATA: i32 = 61;

    /// Numeric errno carried on the wire
    pub fn code(&self) -> i32 {
        match self {
            SyscallError::NotFound => Self::ENOENT,
            SyscallError::NoProcess => Self::ESRCH,
            SyscallError::BadFd => Self::EBADF,
            SyscallError::WouldBlock => Self::EAGAIN,
            SyscallError::OutOfMemory => Self::ENOMEM,
            SyscallError::AlreadyExists => Self::EEXIST,
            SyscallError::NotADirectory => Self::ENOTDIR,
            SyscallError::IsADirectory => Self::EISDIR,
            SyscallError::InvalidArgument => Self::EINVAL,
            SyscallError::NameTooLong => Self::ENAMETOOLONG,
            SyscallError::Unsupported => Self::ENOSYS,
            SyscallError::NotEmpty => Self::ENOTEMPTY,
            SyscallError::ContentPending { .. } => Self::ENODATA,
        }
    }

    /// Rebuild an error from its code and the detail string of the response
    pub fn from_code(code: i32, detail: &str) -> Option<Self> {
        let err = match code {
            Self::ENOENT => SyscallError::NotFound,
            Self::ESRCH => SyscallError::NoProcess,
            Self::EBADF => SyscallError::BadFd,
            Self::EAGAIN => SyscallError::WouldBlock,
            Self::ENOMEM => SyscallError::OutOfMemory,
            Self::EEXIST => SyscallError::AlreadyExists,
            Self::ENOTDIR => SyscallError::NotADirectory,
            Self::EISDIR => SyscallError::IsADirectory,
            Self::EINVAL => SyscallError::InvalidArgument,
            Self::ENAMETOOLONG => SyscallError::NameTooLong,
            Self::ENOSYS => SyscallError::Unsupported,
            Self::ENOTEMPTY => SyscallError::NotEmpty,
            Self::ENODATA => SyscallError::ContentPending {
                location: detail.to_string(),
            },
            _ => return None,
        };
        Some(err)
    }

    /// Symbolic errno name, for logs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            SyscallError::NotFound => "ENOENT",
            SyscallError::NoProcess => "ESRCH",
            SyscallError::BadFd => "EBADF",
            SyscallError::WouldBlock => "EAGAIN",
            SyscallError::OutOfMemory => "ENOMEM",
            SyscallError::AlreadyExists => "EEXIST",
            SyscallError::NotADirectory => "ENOTDIR",
            SyscallError::IsADirectory => "EISDIR",
            SyscallError::InvalidArgument => "EINVAL",
            SyscallError::NameTooLong => "ENAMETOOLONG",
            SyscallError::Unsupported => "ENOSYS",
            SyscallError::NotEmpty => "ENOTEMPTY",
            SyscallError::ContentPending { .. } => "ENODATA",
        }
    }

    /// Detail string sent after the code in an error response
    pub fn detail(&self) -> &str {
        match self {
            SyscallError::ContentPending { location } => location,
            _ => "",
        }
    }

    /// Fatal errors poison the bus; the host must stop issuing calls
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyscallError::OutOfMemory)
    }
}
