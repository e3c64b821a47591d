//! Host bridge
//!
//! The async surface the desktop talks to. Calls are queued on an unbounded
//! channel and executed one at a time, in submission order, by a single
//! [`Worker`] that owns the kernel module:
//!
//! ```text
//! HostBridge::open(..) ──► queue ──► Worker ──► ModuleInstance::call
//!        ▲                                          │
//!        └──────────────── oneshot reply ◄──────────┘
//! ```
//!
//! The worker marshals each request through linear memory, decodes the
//! response and, when shadow content is missing, fetches it from the host,
//! hydrates the kernel and re-issues the call. A fatal response poisons the
//! bridge: every later call fails with [`BridgeError::Poisoned`].
//!
//! Filesystem change events the kernel posts during a call are forwarded to
//! every [`HostBridge::subscribe`] stream before the call's reply is sent.

pub mod memory;
pub mod module;
pub mod tree;

pub use memory::{Allocation, LinearMemory, MemoryError, Ptr, SharedMemory};
pub use module::{ModuleError, ModuleInstance};
pub use tree::{FsItem, ItemKind};

use crate::config::KernelConfig;
use crate::kernel::{
    ExitStatus, Fd, FsEvent, IoctlRequest, OpenFlags, Pid, ProcessInfo, Reply, Request, SyscallError,
    TtySide,
};
use crate::platform::HostServices;
use crate::protocol::{self, MAX_DATA_LEN, ProtocolError};
use crate::vfs::{DeferredSource, DirEntry, FetchError, Metadata, ShadowManifest, split_path};
use futures::channel::{mpsc, oneshot};
use futures::{StreamExt, ready};
use pin_project_lite::pin_project;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;

/// Shadow locations fetched for one call before giving up
const MAX_HYDRATIONS: usize = 8;

/// Bytes requested per read when pulling a whole file
const READ_CHUNK: u32 = 64 * 1024;

/// Largest data slice per write; the fd takes the first four payload bytes
const WRITE_CHUNK: usize = MAX_DATA_LEN - 4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{} ({})", .0, .0.name())]
    Syscall(#[from] SyscallError),
    #[error("fatal kernel error: {0}")]
    Fatal(SyscallError),
    #[error("kernel poisoned by an earlier fatal error")]
    Poisoned,
    #[error("kernel worker has shut down")]
    Disconnected,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

impl BridgeError {
    /// The errno behind a syscall or fatal error
    pub fn errno(&self) -> Option<i32> {
        match self {
            BridgeError::Syscall(err) | BridgeError::Fatal(err) => Some(err.code()),
            _ => None,
        }
    }

    fn would_block(&self) -> bool {
        matches!(self, BridgeError::Syscall(SyscallError::WouldBlock))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

struct Job {
    request: Request,
    reply: oneshot::Sender<BridgeResult<Reply>>,
}

type Subscribers = Rc<RefCell<Vec<mpsc::UnboundedSender<FsEvent>>>>;

// ========== WORKER ==========

/// Executes queued calls against the module, one at a time
pub struct Worker {
    queue: mpsc::UnboundedReceiver<Job>,
    module: ModuleInstance,
    host: Rc<dyn HostServices>,
    poisoned: Rc<Cell<bool>>,
    subscribers: Subscribers,
    seq: u32,
}

impl Worker {
    /// Serve calls until every bridge handle is dropped
    pub async fn run(mut self) {
        while let Some(job) = self.queue.next().await {
            let kind = job.request.kind();
            let result = self.execute(job.request).await;
            if job.reply.send(result).is_err() {
                log::trace!("{}: caller dropped the reply", kind);
            }
        }
        log::debug!("bridge worker stopped");
    }

    async fn execute(&mut self, request: Request) -> BridgeResult<Reply> {
        if self.poisoned.get() {
            return Err(BridgeError::Poisoned);
        }
        let mut hydrated = 0;
        loop {
            match self.dispatch(&request) {
                Err(BridgeError::Syscall(SyscallError::ContentPending { location }))
                    if hydrated < MAX_HYDRATIONS =>
                {
                    hydrated += 1;
                    log::debug!("{}: fetching {}", request.kind(), location);
                    let data = self.host.fetch(&location).await?;
                    self.dispatch(&Request::Hydrate { location, data })?;
                }
                result => return result,
            }
        }
    }

    /// One round trip through linear memory
    fn dispatch(&mut self, request: &Request) -> BridgeResult<Reply> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let bytes = protocol::encode(&request.to_message().with_seq(seq))?;

        let input = self.module.load(&bytes).map_err(|e| self.memory_failure(e))?;
        let output = self.module.call(&input, self.host.now());
        self.publish_events();
        let output = match output {
            Ok(output) => output,
            Err(ModuleError::Protocol(e)) => return Err(e.into()),
            Err(ModuleError::Memory(e)) => return Err(self.memory_failure(e)),
        };
        let response = output
            .to_vec()
            .map_err(|e| self.memory_failure(e))
            .and_then(|bytes| Ok(protocol::decode(&bytes)?))?;
        drop(output);
        drop(input);

        if response.seq != seq {
            return Err(BridgeError::Malformed(format!(
                "sequence {} answered with {}",
                seq, response.seq
            )));
        }
        if let Some((code, detail)) = response.error_code() {
            let err = SyscallError::from_code(code, &detail)
                .ok_or_else(|| BridgeError::Malformed(format!("unknown errno {}", code)))?;
            if response.is_fatal() {
                self.poison(&err);
                return Err(BridgeError::Fatal(err));
            }
            return Err(BridgeError::Syscall(err));
        }
        if response.is_error() {
            return Err(BridgeError::Malformed("error response without a code".into()));
        }
        Reply::decode(request.kind(), &response.data)
            .map_err(|_| BridgeError::Malformed(format!("undecodable {} reply", request.kind())))
    }

    fn publish_events(&mut self) {
        let events = self.module.take_events();
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.borrow_mut();
        for event in events {
            log::trace!("fs event {:?} {}", event.kind, event.path);
            subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
        }
    }

    fn memory_failure(&self, err: MemoryError) -> BridgeError {
        match err {
            MemoryError::Exhausted { .. } => {
                let err = SyscallError::OutOfMemory;
                self.poison(&err);
                BridgeError::Fatal(err)
            }
            other => BridgeError::Malformed(other.to_string()),
        }
    }

    fn poison(&self, err: &SyscallError) {
        log::error!("fatal kernel error: {}; bridge poisoned", err);
        self.poisoned.set(true);
    }
}

// ========== CALL FUTURE ==========

pin_project! {
    /// Reply to a queued call
    ///
    /// The call runs whether or not this future is polled.
    #[must_use = "the call is queued either way; await it for the result"]
    pub struct Call<T> {
        #[pin]
        reply: oneshot::Receiver<BridgeResult<Reply>>,
        extract: fn(Reply) -> BridgeResult<T>,
    }
}

impl<T> Future for Call<T> {
    type Output = BridgeResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = match ready!(this.reply.poll(cx)) {
            Ok(result) => result.and_then(*this.extract),
            Err(oneshot::Canceled) => Err(BridgeError::Disconnected),
        };
        Poll::Ready(output)
    }
}

macro_rules! extract {
    ($name:ident, $variant:ident, $ty:ty) => {
        fn $name(reply: Reply) -> BridgeResult<$ty> {
            match reply {
                Reply::$variant(value) => Ok(value),
                other => Err(unexpected(other)),
            }
        }
    };
}

extract!(expect_fd, Fd, Fd);
extract!(expect_bytes, Bytes, Vec<u8>);
extract!(expect_count, Count, u32);
extract!(expect_stat, Stat, Metadata);
extract!(expect_entries, Entries, Vec<DirEntry>);
extract!(expect_pid, Pid, Pid);
extract!(expect_status, Status, ExitStatus);
extract!(expect_processes, Processes, Vec<ProcessInfo>);
extract!(expect_loaded, Loaded, bool);

fn expect_done(reply: Reply) -> BridgeResult<()> {
    match reply {
        Reply::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> BridgeError {
    BridgeError::Malformed(format!("unexpected reply {:?}", reply))
}

// ========== BRIDGE ==========

/// Handle for submitting calls; cheap to share behind an `Rc`
pub struct HostBridge {
    queue: mpsc::UnboundedSender<Job>,
    poisoned: Rc<Cell<bool>>,
    memory: SharedMemory,
    host: Rc<dyn HostServices>,
    config: KernelConfig,
    initialized: Cell<bool>,
    temp_seq: Cell<u32>,
    subscribers: Subscribers,
}

impl HostBridge {
    /// Create a bridge and the worker that must be spawned to serve it
    ///
    /// The kernel starts with a deferred content source: shadow bytes are
    /// fetched through `host` the first time a call needs them.
    pub fn new(config: KernelConfig, host: Rc<dyn HostServices>) -> (Self, Worker) {
        let module = ModuleInstance::new(&config, Box::new(DeferredSource));
        Self::with_module(config, host, module)
    }

    pub fn with_module(
        config: KernelConfig,
        host: Rc<dyn HostServices>,
        module: ModuleInstance,
    ) -> (Self, Worker) {
        let (tx, rx) = mpsc::unbounded();
        let poisoned = Rc::new(Cell::new(false));
        let subscribers = Subscribers::default();
        let bridge = Self {
            queue: tx,
            poisoned: poisoned.clone(),
            memory: module.memory().clone(),
            host: host.clone(),
            config,
            initialized: Cell::new(false),
            temp_seq: Cell::new(0),
            subscribers: subscribers.clone(),
        };
        let worker = Worker {
            queue: rx,
            module,
            host,
            poisoned,
            subscribers,
            seq: 0,
        };
        (bridge, worker)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    /// Filesystem change events from every call executed from now on
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FsEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.borrow_mut().push(tx);
        rx
    }

    /// Buffers currently allocated in the module's linear memory
    pub fn live_allocations(&self) -> usize {
        self.memory.borrow().live()
    }

    fn submit<T>(&self, request: Request, extract: fn(Reply) -> BridgeResult<T>) -> Call<T> {
        let (tx, rx) = oneshot::channel();
        if self.poisoned.get() {
            let _ = tx.send(Err(BridgeError::Poisoned));
        } else if self.queue.unbounded_send(Job { request, reply: tx }).is_err() {
            // the job and its sender are dropped, so the call resolves Disconnected
            log::debug!("submit after the worker stopped");
        }
        Call { reply: rx, extract }
    }

    // ========== FILES ==========

    pub fn open(&self, path: &str, flags: OpenFlags) -> Call<Fd> {
        self.submit(
            Request::Open {
                path: path.to_string(),
                flags: flags.bits(),
                mode: 0o644,
            },
            expect_fd,
        )
    }

    pub fn read(&self, fd: Fd, count: u32) -> Call<Vec<u8>> {
        self.submit(Request::Read { fd, count }, expect_bytes)
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> Call<u32> {
        self.submit(
            Request::Write {
                fd,
                data: data.to_vec(),
            },
            expect_count,
        )
    }

    pub fn close(&self, fd: Fd) -> Call<()> {
        self.submit(Request::Close { fd }, expect_done)
    }

    pub fn stat(&self, path: &str) -> Call<Metadata> {
        self.submit(
            Request::Stat {
                path: path.to_string(),
            },
            expect_stat,
        )
    }

    pub fn mkdir(&self, path: &str) -> Call<()> {
        self.submit(
            Request::Mkdir {
                path: path.to_string(),
                mode: 0o755,
            },
            expect_done,
        )
    }

    pub fn rmdir(&self, path: &str) -> Call<()> {
        self.submit(
            Request::Rmdir {
                path: path.to_string(),
            },
            expect_done,
        )
    }

    pub fn unlink(&self, path: &str) -> Call<()> {
        self.submit(
            Request::Unlink {
                path: path.to_string(),
            },
            expect_done,
        )
    }

    pub fn rename(&self, from: &str, to: &str) -> Call<()> {
        self.submit(
            Request::Rename {
                from: from.to_string(),
                to: to.to_string(),
            },
            expect_done,
        )
    }

    pub fn read_dir(&self, path: &str) -> Call<Vec<DirEntry>> {
        self.submit(
            Request::ReadDir {
                path: path.to_string(),
            },
            expect_entries,
        )
    }

    /// Read a whole file
    pub async fn read_file(&self, path: &str) -> BridgeResult<Vec<u8>> {
        let fd = self.open(path, OpenFlags::READ).await?;
        let mut contents = Vec::new();
        let result = loop {
            match self.read(fd, READ_CHUNK).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => contents.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        let closed = self.close(fd).await;
        result.and(closed).map(|_| contents)
    }

    /// Write all of `data` through `fd`, in payload-sized chunks
    pub async fn write_all(&self, fd: Fd, data: &[u8]) -> BridgeResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let chunk = &rest[..rest.len().min(WRITE_CHUNK)];
            let written = self.write(fd, chunk).await? as usize;
            if written == 0 {
                return Err(BridgeError::Syscall(SyscallError::WouldBlock));
            }
            rest = &rest[written.min(rest.len())..];
        }
        Ok(())
    }

    /// Crash-safe replace of a file's contents
    ///
    /// The data goes to a fresh sibling opened with `O_CREAT|O_EXCL`, which is
    /// then renamed over `path`. On failure the sibling is removed and `path`
    /// is untouched.
    pub async fn safe_write(&self, path: &str, data: &[u8]) -> BridgeResult<()> {
        let (dir, name) = split_path(path).ok_or(SyscallError::InvalidArgument)?;
        let seq = self.temp_seq.get().wrapping_add(1);
        self.temp_seq.set(seq);
        let temp = crate::vfs::join_path(dir, &format!(".{}.tmp-{}", name, seq));

        let flags = OpenFlags(OpenFlags::O_WRONLY | OpenFlags::O_CREAT | OpenFlags::O_EXCL);
        let fd = self.open(&temp, flags).await?;
        let written = self.write_all(fd, data).await;
        let closed = self.close(fd).await;
        let result = match written.and(closed) {
            Ok(()) => self.rename(&temp, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::debug!("safe write of {} failed: {}", path, e);
            if let Err(cleanup) = self.unlink(&temp).await {
                log::warn!("could not remove {}: {}", temp, cleanup);
            }
        }
        result
    }

    // ========== PROCESSES ==========

    pub fn spawn(&self, command: &str, parent: Option<Pid>) -> Call<Pid> {
        self.submit(
            Request::Spawn {
                parent,
                command: command.to_string(),
            },
            expect_pid,
        )
    }

    pub fn kill(&self, pid: Pid) -> Call<()> {
        self.submit(Request::Kill { pid }, expect_done)
    }

    /// Reap an exited process; `EAGAIN` while it runs
    pub fn wait(&self, pid: Pid) -> Call<ExitStatus> {
        self.submit(Request::Wait { pid }, expect_status)
    }

    pub async fn wait_blocking(&self, pid: Pid) -> BridgeResult<ExitStatus> {
        self.poll_until(|| self.wait(pid)).await
    }

    pub fn exit(&self, pid: Pid, code: i32) -> Call<()> {
        self.submit(Request::Exit { pid, code }, expect_done)
    }

    pub fn list(&self) -> Call<Vec<ProcessInfo>> {
        self.submit(Request::List, expect_processes)
    }

    // ========== TTY ==========

    /// Drain up to `count` bytes; `EAGAIN` when nothing is queued
    pub fn tty_read(&self, side: TtySide, count: u32) -> Call<Vec<u8>> {
        self.submit(Request::TtyRead { side, count }, expect_bytes)
    }

    pub async fn tty_read_blocking(&self, side: TtySide, count: u32) -> BridgeResult<Vec<u8>> {
        self.poll_until(|| self.tty_read(side, count)).await
    }

    pub fn tty_write(&self, side: TtySide, data: &[u8]) -> Call<u32> {
        self.submit(
            Request::TtyWrite {
                side,
                data: data.to_vec(),
            },
            expect_count,
        )
    }

    pub fn ioctl(&self, request: IoctlRequest, arg: &[u8]) -> Call<Vec<u8>> {
        self.submit(
            Request::Ioctl {
                request: request.num(),
                arg: arg.to_vec(),
            },
            expect_bytes,
        )
    }

    /// Re-issue a call while it reports `EAGAIN`, sleeping between polls
    async fn poll_until<T>(&self, mut call: impl FnMut() -> Call<T>) -> BridgeResult<T> {
        let mut polls = 0;
        loop {
            match call().await {
                Err(e) if e.would_block() => {
                    polls += 1;
                    if self.config.poll_attempts != 0 && polls >= self.config.poll_attempts {
                        return Err(e);
                    }
                    self.host.sleep(self.config.poll_interval_ms).await;
                }
                other => return other,
            }
        }
    }

    // ========== LAYERS ==========

    /// Fetch the shadow manifest and load it; `false` if already loaded
    pub async fn initialize_once(&self) -> BridgeResult<bool> {
        if self.initialized.get() {
            return Ok(false);
        }
        let bytes = self.host.fetch(&self.config.manifest_url).await?;
        let manifest = ShadowManifest::from_json(&bytes)?;
        let loaded = self
            .submit(Request::LoadManifest(manifest), expect_loaded)
            .await?;
        self.initialized.set(true);
        if loaded {
            log::info!("shadow layer loaded from {}", self.config.manifest_url);
        }
        Ok(loaded)
    }

    /// Discard every overlay change and open descriptor
    pub fn force_reload_from_shadow(&self) -> Call<()> {
        log::warn!("force reload requested; overlay changes will be lost");
        self.submit(Request::Reload, expect_done)
    }

    pub fn export_overlay(&self) -> Call<Vec<u8>> {
        self.submit(Request::Export, expect_bytes)
    }

    pub fn import_overlay(&self, snapshot: &[u8]) -> Call<()> {
        self.submit(Request::Import(snapshot.to_vec()), expect_done)
    }
}
