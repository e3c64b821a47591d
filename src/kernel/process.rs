//! Process table
//!
//! Processes here are bookkeeping only: a pid, a command line, a parent and
//! the descriptors opened on the process's behalf. Nothing runs.
//!
//! Modeled on the Linux lifecycle:
//! - pid 1 is `init`, created with the table and never killed
//! - an exited process stays in the table until its status is reaped by `wait`
//! - children of an exited process are reparented to `init`; `init` reaps
//!   such orphans as soon as they exit, and drops children that had already
//!   exited

use super::errno::{SyscallError, SyscallResult};
use super::fd::Fd;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl Pid {
    pub const INIT: Pid = Pid(1);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Killed,
}

impl ExitStatus {
    /// Wire form: `(kind, code)`, kind 0 for an exit code, 1 for killed
    pub fn encode(self) -> (u32, i32) {
        match self {
            ExitStatus::Code(code) => (0, code),
            ExitStatus::Killed => (1, 0),
        }
    }

    pub fn decode(kind: u32, code: i32) -> Option<Self> {
        match kind {
            0 => Some(ExitStatus::Code(code)),
            1 => Some(ExitStatus::Killed),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit {}", code),
            ExitStatus::Killed => f.write_str("killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited but not yet reaped
    Exited(ExitStatus),
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    /// `None` for init
    pub parent: Option<Pid>,
    pub command: String,
    pub state: ProcessState,
    /// Descriptors opened while this process was current
    pub fds: BTreeSet<Fd>,
    /// Reparented to `init` after its parent ended
    pub orphan: bool,
}

impl Process {
    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }
}

/// Snapshot of a process for `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// 0 for init
    pub ppid: u32,
    pub command: String,
    pub state: ProcessState,
    /// Open descriptors, ascending
    pub fds: Vec<Fd>,
}

pub struct ProcessTable {
    processes: BTreeMap<Pid, Process>,
    next_pid: u32,
    max_processes: usize,
}

impl ProcessTable {
    /// Create a table holding only `init`
    pub fn new(max_processes: usize) -> Self {
        let mut processes = BTreeMap::new();
        processes.insert(
            Pid::INIT,
            Process {
                pid: Pid::INIT,
                parent: None,
                command: "init".to_string(),
                state: ProcessState::Running,
                fds: BTreeSet::new(),
                orphan: false,
            },
        );
        Self {
            processes,
            next_pid: Pid::INIT.0 + 1,
            max_processes: max_processes.max(1),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.processes.get(&pid).is_some_and(Process::is_running)
    }

    pub fn spawn(&mut self, command: &str, parent: Pid) -> SyscallResult<Pid> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SyscallError::InvalidArgument);
        }
        if !self.is_running(parent) {
            return Err(SyscallError::NoProcess);
        }
        if self.processes.len() >= self.max_processes {
            log::debug!("process table full ({} entries)", self.processes.len());
            return Err(SyscallError::WouldBlock);
        }

        let pid = Pid(self.next_pid);
        self.next_pid = self
            .next_pid
            .checked_add(1)
            .ok_or(SyscallError::WouldBlock)?;
        self.processes.insert(
            pid,
            Process {
                pid,
                parent: Some(parent),
                command: command.to_string(),
                state: ProcessState::Running,
                fds: BTreeSet::new(),
                orphan: false,
            },
        );
        log::debug!("spawned {} ({}) parent {}", pid, command, parent);
        Ok(pid)
    }

    /// Mark a process killed; returns the descriptors it held
    pub fn kill(&mut self, pid: Pid) -> SyscallResult<Vec<Fd>> {
        self.terminate(pid, ExitStatus::Killed)
    }

    /// Mark a process exited with `code`; returns the descriptors it held
    pub fn exit(&mut self, pid: Pid, code: i32) -> SyscallResult<Vec<Fd>> {
        self.terminate(pid, ExitStatus::Code(code))
    }

    fn terminate(&mut self, pid: Pid, status: ExitStatus) -> SyscallResult<Vec<Fd>> {
        if pid == Pid::INIT {
            return Err(SyscallError::InvalidArgument);
        }
        let process = self.processes.get_mut(&pid).ok_or(SyscallError::NoProcess)?;
        if !process.is_running() {
            return Ok(Vec::new());
        }
        process.state = ProcessState::Exited(status);
        let orphan = process.orphan;
        let fds: Vec<Fd> = std::mem::take(&mut process.fds).into_iter().collect();

        let mut zombies = Vec::new();
        for child in self.processes.values_mut() {
            if child.parent != Some(pid) {
                continue;
            }
            if child.is_running() {
                child.parent = Some(Pid::INIT);
                child.orphan = true;
            } else {
                zombies.push(child.pid);
            }
        }
        for zombie in zombies {
            self.processes.remove(&zombie);
            log::trace!("init reaped {}", zombie);
        }
        if orphan {
            self.processes.remove(&pid);
            log::debug!("{} {}, reaped by init", pid, status);
        } else {
            log::debug!("{} {}", pid, status);
        }
        Ok(fds)
    }

    /// Reap an exited process
    ///
    /// `WouldBlock` while it is still running.
    pub fn wait(&mut self, pid: Pid) -> SyscallResult<ExitStatus> {
        let process = self.processes.get(&pid).ok_or(SyscallError::NoProcess)?;
        match process.state {
            ProcessState::Running => Err(SyscallError::WouldBlock),
            ProcessState::Exited(status) => {
                self.processes.remove(&pid);
                Ok(status)
            }
        }
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes
            .values()
            .map(|p| ProcessInfo {
                pid: p.pid,
                ppid: p.parent.map_or(0, |pid| pid.0),
                command: p.command.clone(),
                state: p.state,
                fds: p.fds.iter().copied().collect(),
            })
            .collect()
    }

    /// Record a descriptor as owned by `pid`
    pub fn attach_fd(&mut self, pid: Pid, fd: Fd) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.fds.insert(fd);
        }
    }

    pub fn detach_fd(&mut self, pid: Pid, fd: Fd) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.fds.remove(&fd);
        }
    }

    /// Forget every descriptor of every process
    pub fn clear_fds(&mut self) {
        for process in self.processes.values_mut() {
            process.fds.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ProcessTable {
        ProcessTable::new(8)
    }

    #[test]
    fn test_init_exists() {
        let table = setup();
        let init = table.get(Pid::INIT).unwrap();
        assert_eq!(init.command, "init");
        assert!(init.is_running());
        assert_eq!(init.parent, None);
    }

    #[test]
    fn test_spawn_assigns_monotonic_pids() {
        let mut table = setup();
        let a = table.spawn("editor", Pid::INIT).unwrap();
        let b = table.spawn("terminal", a).unwrap();
        assert_eq!(a, Pid(2));
        assert_eq!(b, Pid(3));
        assert_eq!(table.get(b).unwrap().parent, Some(a));
    }

    #[test]
    fn test_spawn_errors() {
        let mut table = setup();
        assert_eq!(table.spawn("  ", Pid::INIT), Err(SyscallError::InvalidArgument));
        assert_eq!(table.spawn("x", Pid(99)), Err(SyscallError::NoProcess));

        let a = table.spawn("a", Pid::INIT).unwrap();
        table.kill(a).unwrap();
        assert_eq!(table.spawn("x", a), Err(SyscallError::NoProcess));
    }

    #[test]
    fn test_table_is_bounded() {
        let mut table = ProcessTable::new(3);
        table.spawn("a", Pid::INIT).unwrap();
        let b = table.spawn("b", Pid::INIT).unwrap();
        assert_eq!(table.spawn("c", Pid::INIT), Err(SyscallError::WouldBlock));

        // reaping frees a slot
        table.kill(b).unwrap();
        table.wait(b).unwrap();
        assert_eq!(table.spawn("c", Pid::INIT), Ok(Pid(4)));
    }

    #[test]
    fn test_kill_and_wait() {
        let mut table = setup();
        let pid = table.spawn("worker", Pid::INIT).unwrap();
        assert_eq!(table.wait(pid), Err(SyscallError::WouldBlock));

        table.kill(pid).unwrap();
        assert_eq!(table.wait(pid), Ok(ExitStatus::Killed));
        assert_eq!(table.wait(pid), Err(SyscallError::NoProcess));
    }

    #[test]
    fn test_exit_code() {
        let mut table = setup();
        let pid = table.spawn("job", Pid::INIT).unwrap();
        table.exit(pid, 3).unwrap();
        assert_eq!(table.wait(pid), Ok(ExitStatus::Code(3)));
    }

    #[test]
    fn test_kill_rules() {
        let mut table = setup();
        assert_eq!(table.kill(Pid::INIT), Err(SyscallError::InvalidArgument));
        assert_eq!(table.kill(Pid(42)), Err(SyscallError::NoProcess));

        let pid = table.spawn("x", Pid::INIT).unwrap();
        table.exit(pid, 1).unwrap();
        // already exited: status is kept
        assert_eq!(table.kill(pid), Ok(Vec::new()));
        assert_eq!(table.wait(pid), Ok(ExitStatus::Code(1)));
    }

    #[test]
    fn test_children_reparented_to_init() {
        let mut table = setup();
        let parent = table.spawn("shell", Pid::INIT).unwrap();
        let child = table.spawn("ls", parent).unwrap();
        table.kill(parent).unwrap();
        assert_eq!(table.get(child).unwrap().parent, Some(Pid::INIT));
        assert!(table.get(child).unwrap().orphan);
    }

    #[test]
    fn test_init_reaps_orphans() {
        let mut table = ProcessTable::new(4);
        let shell = table.spawn("shell", Pid::INIT).unwrap();
        let done = table.spawn("ls", shell).unwrap();
        let running = table.spawn("top", shell).unwrap();
        table.exit(done, 0).unwrap();
        assert_eq!(table.spawn("x", Pid::INIT), Err(SyscallError::WouldBlock));

        // the exited child goes with its parent
        table.kill(shell).unwrap();
        assert!(table.get(done).is_none());
        assert_eq!(table.len(), 3);

        // the running one is reaped when it ends
        table.exit(running, 0).unwrap();
        assert!(table.get(running).is_none());
        assert_eq!(table.wait(running), Err(SyscallError::NoProcess));

        // only the shell's own status is left for its spawner
        assert_eq!(table.wait(shell), Ok(ExitStatus::Killed));
        assert_eq!(table.len(), 1);
        table.spawn("a", Pid::INIT).unwrap();
        table.spawn("b", Pid::INIT).unwrap();
        table.spawn("c", Pid::INIT).unwrap();
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_list_reports_fds() {
        let mut table = setup();
        let pid = table.spawn("x", Pid::INIT).unwrap();
        table.attach_fd(pid, Fd(7));
        table.attach_fd(pid, Fd(3));
        let list = table.list();
        assert_eq!(list[1].fds, vec![Fd(3), Fd(7)]);
        assert!(list[0].fds.is_empty());
    }

    #[test]
    fn test_kill_returns_fds() {
        let mut table = setup();
        let pid = table.spawn("x", Pid::INIT).unwrap();
        table.attach_fd(pid, Fd(3));
        table.attach_fd(pid, Fd(5));
        table.detach_fd(pid, Fd(5));
        assert_eq!(table.kill(pid), Ok(vec![Fd(3)]));
    }

    #[test]
    fn test_list_ordered_by_pid() {
        let mut table = setup();
        let a = table.spawn("a", Pid::INIT).unwrap();
        table.spawn("b", a).unwrap();
        table.exit(a, 0).unwrap();

        let list = table.list();
        let pids: Vec<u32> = list.iter().map(|p| p.pid.0).collect();
        assert_eq!(pids, vec![1, 2, 3]);
        assert_eq!(list[0].ppid, 0);
        assert_eq!(list[1].state, ProcessState::Exited(ExitStatus::Code(0)));
        assert_eq!(list[2].ppid, 1);
    }

    #[test]
    fn test_exit_status_wire_form() {
        assert_eq!(ExitStatus::Code(-2).encode(), (0, -2));
        assert_eq!(ExitStatus::decode(1, 0), Some(ExitStatus::Killed));
        assert_eq!(ExitStatus::decode(9, 0), None);
    }
}
