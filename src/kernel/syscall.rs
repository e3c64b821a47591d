//! System call interface
//!
//! The [`Kernel`] owns all state of one kernel instance: layered storage,
//! the descriptor table, the process table and the pty. Every operation the
//! bus dispatches lands on one of the `sys_*` methods here.
//!
//! A failing syscall never leaves partial changes behind, so the host may
//! safely retry after delivering missing shadow content. Successful
//! filesystem mutations queue change events for the host to drain.

use super::errno::{SyscallError, SyscallResult};
use super::events::{EventQueue, FsEvent};
use super::fd::{Fd, FdTable, OpenFlags, Target};
use super::process::{ExitStatus, Pid, ProcessInfo, ProcessTable};
use super::tty::{Pty, TtySide};
use crate::config::KernelConfig;
use crate::protocol::MAX_DATA_LEN;
use crate::vfs::{
    ContentSource, DirEntry, LayeredStorage, Metadata, NodeId, NodeKind, Resolved, ShadowManifest,
    normalize_path,
};

pub struct Kernel {
    storage: LayeredStorage,
    fds: FdTable,
    processes: ProcessTable,
    tty: Pty,
    events: EventQueue,
    /// Process that owns newly opened descriptors
    current: Pid,
    now: f64,
}

impl Kernel {
    pub fn new(config: &KernelConfig, source: Box<dyn ContentSource>) -> Self {
        Self {
            storage: LayeredStorage::new(source).with_quota(config.overlay_quota),
            fds: FdTable::new(),
            processes: ProcessTable::new(config.max_processes),
            tty: Pty::new(config.tty_buffer_size),
            events: EventQueue::new(),
            current: Pid::INIT,
            now: 0.0,
        }
    }

    /// Advance the kernel clock (milliseconds since epoch)
    pub fn set_clock(&mut self, now: f64) {
        self.now = now;
        self.storage.set_clock(now);
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn storage(&self) -> &LayeredStorage {
        &self.storage
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    /// Filesystem changes since the last call
    pub fn take_events(&mut self) -> Vec<FsEvent> {
        self.events.drain()
    }

    /// Make `pid` own descriptors opened from now on
    pub fn set_current(&mut self, pid: Pid) -> SyscallResult<()> {
        if !self.processes.is_running(pid) {
            return Err(SyscallError::NoProcess);
        }
        self.current = pid;
        Ok(())
    }

    // ========== FILE I/O ==========

    pub fn sys_open(&mut self, path: &str, flags: u32, _mode: u32) -> SyscallResult<Fd> {
        let flags = OpenFlags::validate(flags)?;
        let path = normalize_path(path)?;

        let existing = match self.storage.resolve(&path) {
            Ok(resolved) => {
                if flags.create() && flags.exclusive() {
                    return Err(SyscallError::AlreadyExists);
                }
                Some(resolved)
            }
            Err(SyscallError::NotFound) if flags.create() => None,
            Err(e) => return Err(e),
        };

        let target = match existing {
            Some(resolved) => {
                if self.storage.kind(&resolved) == NodeKind::Directory {
                    return Err(SyscallError::IsADirectory);
                }
                if flags.truncate() && flags.writable() {
                    let id = self.storage.copy_up(&path)?;
                    self.storage.truncate(id)?;
                    self.events.write(&path);
                    self.overlay_target(id)?
                } else {
                    match resolved {
                        Resolved::Overlay(id) => self.overlay_target(id)?,
                        Resolved::Shadow(p) => Target::Shadow(p),
                    }
                }
            }
            None => {
                let id = self.storage.create_file(&path)?;
                self.events.changed(&path);
                self.overlay_target(id)?
            }
        };

        let fd = self.fds.insert(path.clone(), flags, target, self.current);
        self.processes.attach_fd(self.current, fd);
        log::trace!("open {} -> {}", path, fd);
        Ok(fd)
    }

    pub fn sys_read(&mut self, fd: Fd, count: u32) -> SyscallResult<Vec<u8>> {
        let count = (count as usize).min(MAX_DATA_LEN);
        let desc = self.fds.get(fd)?;
        if !desc.flags.readable() {
            return Err(SyscallError::BadFd);
        }
        let offset = desc.offset;
        let resolved = self.refresh_target(fd)?;
        let data = self.storage.read_at(&resolved, offset, count)?;
        self.fds.get_mut(fd)?.offset = offset + data.len() as u64;
        Ok(data)
    }

    pub fn sys_write(&mut self, fd: Fd, data: &[u8]) -> SyscallResult<usize> {
        let desc = self.fds.get(fd)?;
        if !desc.flags.writable() {
            return Err(SyscallError::BadFd);
        }
        let append = desc.flags.append();
        let mut offset = desc.offset;
        if data.is_empty() {
            return Ok(0);
        }

        let id = match self.refresh_target(fd)? {
            Resolved::Overlay(id) => id,
            Resolved::Shadow(path) => {
                let id = match self.storage.resolve(&path) {
                    Ok(Resolved::Shadow(_)) => self.storage.copy_up(&path)?,
                    _ => self.storage.detached_copy(&path)?,
                };
                let target = self.overlay_target(id)?;
                self.fds.get_mut(fd)?.target = target;
                id
            }
        };

        if append {
            offset = self.storage.file_len(&Resolved::Overlay(id))?;
        }
        let written = self.storage.write_at(id, offset, data)?;
        self.fds.get_mut(fd)?.offset = offset + written as u64;
        // unlinked files have no path to report
        if let Some(path) = self.storage.path_of(id) {
            self.events.write(&path);
        }
        Ok(written)
    }

    pub fn sys_close(&mut self, fd: Fd) -> SyscallResult<()> {
        let desc = self.fds.remove(fd)?;
        self.processes.detach_fd(desc.owner, fd);
        self.reap(&desc.target);
        log::trace!("close {}", fd);
        Ok(())
    }

    /// Current target of a descriptor
    ///
    /// A descriptor opened on a shadow file follows a copy-up of that same
    /// file made through another descriptor or by a rename, wherever the
    /// copy now lives.
    fn refresh_target(&mut self, fd: Fd) -> SyscallResult<Resolved> {
        let desc = self.fds.get(fd)?;
        let path = match &desc.target {
            Target::Overlay { node, serial } => {
                return if self.storage.is_live(*node, *serial) {
                    Ok(Resolved::Overlay(*node))
                } else {
                    Err(SyscallError::BadFd)
                };
            }
            Target::Shadow(path) => path.clone(),
        };

        if let Ok(Resolved::Shadow(_)) = self.storage.resolve(&path) {
            return Ok(Resolved::Shadow(path));
        }
        match self.storage.follow_shadow(&path) {
            Some(id) => {
                let target = self.overlay_target(id)?;
                self.fds.get_mut(fd)?.target = target;
                Ok(Resolved::Overlay(id))
            }
            None => Ok(Resolved::Shadow(path)),
        }
    }

    fn overlay_target(&self, node: NodeId) -> SyscallResult<Target> {
        let serial = self.storage.serial(node).ok_or(SyscallError::NotFound)?;
        Ok(Target::Overlay { node, serial })
    }

    /// Free an unlinked overlay node once nothing refers to it
    fn reap(&mut self, target: &Target) {
        if let Target::Overlay { node, serial } = *target {
            if self.storage.is_live(node, serial) {
                self.reap_node(node);
            }
        }
    }

    fn reap_node(&mut self, node: NodeId) {
        let Some(serial) = self.storage.serial(node) else {
            return;
        };
        if self.storage.is_detached(node) && !self.fds.references(node, serial) {
            self.storage.release(node);
        }
    }

    // ========== FILESYSTEM ==========

    pub fn sys_mkdir(&mut self, path: &str, _mode: u32) -> SyscallResult<()> {
        let path = normalize_path(path)?;
        self.storage.create_dir(&path)?;
        self.events.changed(&path);
        Ok(())
    }

    pub fn sys_rmdir(&mut self, path: &str) -> SyscallResult<()> {
        let path = normalize_path(path)?;
        self.storage.remove_dir(&path)?;
        self.events.deleted(&path);
        Ok(())
    }

    pub fn sys_unlink(&mut self, path: &str) -> SyscallResult<()> {
        let path = normalize_path(path)?;
        if let Some(node) = self.storage.remove_file(&path)? {
            self.reap_node(node);
        }
        self.events.deleted(&path);
        Ok(())
    }

    pub fn sys_rename(&mut self, from: &str, to: &str) -> SyscallResult<()> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        if let Some(node) = self.storage.rename(&from, &to)? {
            self.reap_node(node);
        }
        if from != to {
            self.events.renamed(&from, &to);
        }
        Ok(())
    }

    pub fn sys_stat(&mut self, path: &str) -> SyscallResult<Metadata> {
        self.storage.stat(path)
    }

    pub fn sys_readdir(&mut self, path: &str) -> SyscallResult<Vec<DirEntry>> {
        self.storage.read_dir(path)
    }

    // ========== PROCESSES ==========

    /// Spawn under `parent`, or under the current process
    pub fn sys_spawn(&mut self, command: &str, parent: Option<Pid>) -> SyscallResult<Pid> {
        let parent = parent.unwrap_or(self.current);
        self.processes.spawn(command, parent)
    }

    pub fn sys_kill(&mut self, pid: Pid) -> SyscallResult<()> {
        let fds = self.processes.kill(pid)?;
        self.finish_process(pid, fds);
        Ok(())
    }

    pub fn sys_exit(&mut self, pid: Pid, code: i32) -> SyscallResult<()> {
        let fds = self.processes.exit(pid, code)?;
        self.finish_process(pid, fds);
        Ok(())
    }

    fn finish_process(&mut self, pid: Pid, fds: Vec<Fd>) {
        for fd in fds {
            if let Ok(desc) = self.fds.remove(fd) {
                self.reap(&desc.target);
            }
        }
        if self.current == pid {
            self.current = Pid::INIT;
        }
    }

    pub fn sys_wait(&mut self, pid: Pid) -> SyscallResult<ExitStatus> {
        self.processes.wait(pid)
    }

    pub fn sys_list(&self) -> Vec<ProcessInfo> {
        self.processes.list()
    }

    // ========== TTY ==========

    pub fn sys_tty_read(&mut self, side: TtySide, count: u32) -> SyscallResult<Vec<u8>> {
        let count = (count as usize).min(MAX_DATA_LEN);
        self.tty.read(side, count)
    }

    pub fn sys_tty_write(&mut self, side: TtySide, data: &[u8]) -> SyscallResult<usize> {
        self.tty.write(side, data)
    }

    pub fn sys_ioctl(&mut self, request: u32, arg: &[u8]) -> SyscallResult<Vec<u8>> {
        self.tty.ioctl(request, arg)
    }

    // ========== LAYERS ==========

    /// Load the shadow manifest; `false` if one was already loaded
    pub fn load_manifest(&mut self, manifest: &ShadowManifest) -> SyscallResult<bool> {
        self.storage.load_manifest(manifest)
    }

    /// Discard the overlay and every open descriptor
    pub fn force_reload(&mut self) {
        let closed = self.fds.clear();
        self.processes.clear_fds();
        if closed > 0 {
            log::warn!("force reload closed {} descriptors", closed);
        }
        self.storage.force_reload();
        self.events.changed("/");
    }

    pub fn hydrate(&mut self, location: &str, data: Vec<u8>) {
        self.storage.hydrate(location, data);
    }

    pub fn export_overlay(&self) -> SyscallResult<Vec<u8>> {
        self.storage.export_overlay()
    }

    /// Replace the overlay with a snapshot; open descriptors are closed
    pub fn import_overlay(&mut self, snapshot: &[u8]) -> SyscallResult<()> {
        self.storage.import_overlay(snapshot)?;
        self.fds.clear();
        self.processes.clear_fds();
        self.events.changed("/");
        Ok(())
    }
}
