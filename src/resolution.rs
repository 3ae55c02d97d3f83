//! Resolution state: working directories and file descriptor tables
//!
//! The store mirrors, for every traced process, just enough kernel state to
//! turn the relative path or file descriptor arguments of a syscall into an
//! absolute path. State is keyed by pid and by `(pid, tid)`; nothing holds a
//! reference to anything else, so fork is a plain value copy.
//!
//! Paths are never normalized. A relative argument is appended to its base
//! verbatim, so `dir/../input` stays `/cwd/dir/../input`.

use crate::record::{Pid, Tid};
use fnv::FnvHashMap;
use tracing::debug;

/// File descriptor number as the traced program sees it
pub type Fd = i32;

/// Which working directory a chdir changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdScope {
    /// `chdir`/`fchdir`: every thread of the process
    Process,
    /// `pthread_chdir`/`pthread_fchdir`: only the calling thread
    Thread,
}

/// One slot of a process's descriptor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEntry {
    /// Absolute path the descriptor was opened against, `None` for sockets,
    /// pipes and descriptors whose origin was never observed
    pub path: Option<String>,
    pub cloexec: bool,
}

/// Mirrored state of one traced process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessState {
    /// Process-wide working directory, `None` while unknown
    pub cwd: Option<String>,
    pub fds: FnvHashMap<Fd, FdEntry>,
    pub parent: Option<Pid>,
}

#[derive(Debug, Default)]
pub struct ResolutionStore {
    processes: FnvHashMap<Pid, ProcessState>,
    /// Thread-local working directories. `None` means the thread switched to
    /// a directory whose path is unknown.
    thread_overrides: FnvHashMap<(Pid, Tid), Option<String>>,
}

/// Append `raw` to `base` with exactly one separator. An empty `raw` names
/// the base itself.
fn join(base: &str, raw: &str) -> String {
    if raw.is_empty() {
        return base.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, raw)
    } else {
        format!("{}/{}", base, raw)
    }
}

impl ResolutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the root process of a trace
    pub fn launch(&mut self, pid: Pid, cwd: Option<String>) {
        self.processes.insert(
            pid,
            ProcessState {
                cwd,
                ..ProcessState::default()
            },
        );
    }

    /// State of `pid`, created with an unknown working directory when the
    /// process was never announced
    pub fn observe(&mut self, pid: Pid) -> &mut ProcessState {
        self.processes.entry(pid).or_insert_with(|| {
            debug!(pid, "first record from unannounced process");
            ProcessState::default()
        })
    }

    pub fn process(&self, pid: Pid) -> Option<&ProcessState> {
        self.processes.get(&pid)
    }

    pub fn is_known(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Effective working directory of a thread
    pub fn working_directory(&self, pid: Pid, tid: Tid) -> Option<&str> {
        match self.thread_overrides.get(&(pid, tid)) {
            Some(dir) => dir.as_deref(),
            None => self.processes.get(&pid)?.cwd.as_deref(),
        }
    }

    pub fn fd_path(&self, pid: Pid, fd: Fd) -> Option<&str> {
        self.processes.get(&pid)?.fds.get(&fd)?.path.as_deref()
    }

    /// Base directory for a relative lookup: the descriptor's path for a
    /// real dirfd, the thread or process working directory otherwise
    fn base(&self, pid: Pid, tid: Tid, dirfd: Option<Fd>) -> Option<&str> {
        match dirfd {
            Some(fd) => self.fd_path(pid, fd),
            None => self.working_directory(pid, tid),
        }
    }

    /// Make `raw` absolute. When the base is unknown the raw path comes back
    /// unchanged.
    pub fn resolve(&self, pid: Pid, tid: Tid, dirfd: Option<Fd>, raw: &str) -> String {
        if raw.starts_with('/') {
            return raw.to_string();
        }
        match self.base(pid, tid, dirfd) {
            Some(base) => join(base, raw),
            None => {
                debug!(pid, tid, ?dirfd, raw, "unresolvable relative path");
                raw.to_string()
            }
        }
    }

    /// Apply a successful chdir. `dir` is already resolved; `None` records
    /// that the new directory is unknown.
    pub fn update_working_directory(
        &mut self,
        pid: Pid,
        tid: Tid,
        dir: Option<String>,
        scope: CwdScope,
    ) {
        match scope {
            CwdScope::Process => self.observe(pid).cwd = dir,
            CwdScope::Thread => {
                self.observe(pid);
                self.thread_overrides.insert((pid, tid), dir);
            }
        }
    }

    pub fn open_fd(&mut self, pid: Pid, fd: Fd, path: Option<String>, cloexec: bool) {
        self.observe(pid)
            .fds
            .insert(fd, FdEntry { path, cloexec });
    }

    pub fn close_fd(&mut self, pid: Pid, fd: Fd) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.fds.remove(&fd);
        }
    }

    /// Make `new` refer to what `old` refers to. Duplicates never inherit
    /// close-on-exec; the flag comes from the dup flavor. An unknown `old`
    /// still occupies `new` so a stale entry cannot survive.
    pub fn dup_fd(&mut self, pid: Pid, old: Fd, new: Fd, cloexec: bool) {
        let process = self.observe(pid);
        let path = process.fds.get(&old).and_then(|e| e.path.clone());
        process.fds.insert(new, FdEntry { path, cloexec });
    }

    pub fn set_cloexec(&mut self, pid: Pid, fd: Fd, cloexec: bool) {
        if let Some(entry) = self
            .processes
            .get_mut(&pid)
            .and_then(|p| p.fds.get_mut(&fd))
        {
            entry.cloexec = cloexec;
        }
    }

    /// Give `child` a copy of the parent's working directory and descriptor
    /// table. A child that is already known keeps its state, so a fork seen
    /// both as a lifecycle notification and as a syscall record is applied
    /// once.
    pub fn fork_process(&mut self, parent: Pid, child: Pid) {
        if self.processes.contains_key(&child) {
            return;
        }
        let mut state = self.processes.get(&parent).cloned().unwrap_or_default();
        state.parent = Some(parent);
        self.processes.insert(child, state);
    }

    /// A new thread starts with its creator's thread-local directory, if any
    pub fn thread_started(&mut self, pid: Pid, tid: Tid, parent_pid: Pid, parent_tid: Tid) {
        self.observe(pid);
        if let Some(dir) = self.thread_overrides.get(&(parent_pid, parent_tid)).cloned() {
            self.thread_overrides.insert((pid, tid), dir);
        }
    }

    pub fn thread_exited(&mut self, pid: Pid, tid: Tid) {
        self.thread_overrides.remove(&(pid, tid));
    }

    /// Successful exec by `tid`: close-on-exec descriptors go away and only
    /// the calling thread survives
    pub fn exec(&mut self, pid: Pid, tid: Tid) {
        self.observe(pid).fds.retain(|_, entry| !entry.cloexec);
        self.thread_overrides
            .retain(|&(p, t), _| p != pid || t == tid);
    }

    /// Forget an exited process and its threads
    pub fn reap_process(&mut self, pid: Pid) {
        self.processes.remove(&pid);
        self.thread_overrides.retain(|&(p, _), _| p != pid);
    }
}
