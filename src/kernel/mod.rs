//! The kernel - syscalls, processes, terminal and message routing
//!
//! Small and explicit:
//! - no global instance; a [`Kernel`] is a plain value owned by its bus
//! - one message in, one message out, synchronously
//! - every failure is an errno the host can act on

pub mod bus;
pub mod errno;
pub mod events;
pub mod fd;
pub mod process;
pub mod request;
pub mod syscall;
pub mod tty;

pub use bus::{Capability, HandlerFn, MessageBus, Registry, RegistryError};
pub use errno::{SyscallError, SyscallResult};
pub use events::{EventQueue, FsEvent, FsEventKind};
pub use fd::{Fd, OpenFlags};
pub use process::{ExitStatus, Pid, ProcessInfo, ProcessState};
pub use request::{Reply, Request};
pub use syscall::Kernel;
pub use tty::{IoctlRequest, TtyMode, TtySide, Winsize};
