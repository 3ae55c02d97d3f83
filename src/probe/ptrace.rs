//! Live probe using ptrace (Linux x86_64)
//!
//! One dedicated thread forks the command under `PTRACE_TRACEME`, follows
//! every fork, vfork, clone and exec, and turns syscall-exit stops into
//! [`ProbeRecord`]s. Path arguments are read out of tracee memory at syscall
//! entry, because the buffers may be gone by the time the call returns.
//!
//! The command runs in its own process group so cancellation can kill the
//! whole tree with one signal.

use super::{ProbeError, ProbeMessage};
use crate::record::Pid;
use crossbeam::channel::Sender;
use nix::sys::signal::{killpg, Signal};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Kills the traced tree from any thread
#[derive(Debug, Clone)]
pub struct Killer {
    pgid: Pid,
    cancelled: Arc<AtomicBool>,
}

impl Killer {
    /// SIGKILL the traced process group. Syscalls that were entered but
    /// never returned are dropped by the probe.
    pub fn kill(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let pgid = nix::unistd::Pid::from_raw(self.pgid as i32);
        if let Err(err) = killpg(pgid, Signal::SIGKILL) {
            debug!(pgid = self.pgid, %err, "killpg failed, tree already gone");
        }
    }
}

/// Handle to a running ptrace probe
#[derive(Debug)]
pub struct PtraceProbe {
    root: Pid,
    killer: Killer,
    thread: Option<JoinHandle<()>>,
}

impl PtraceProbe {
    /// Launch `/bin/sh -c command` under ptrace. Records and the final
    /// [`ProbeMessage::Exited`] go to `tx`.
    pub fn spawn(command: &str, tx: Sender<ProbeMessage>) -> Result<Self, ProbeError> {
        imp::spawn(command, tx)
    }

    pub fn root_pid(&self) -> Pid {
        self.root
    }

    pub fn killer(&self) -> Killer {
        self.killer.clone()
    }

    /// Wait for the probe thread to finish
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("ptrace probe thread panicked");
            }
        }
    }
}

/// How far a failed lookup of `raw` got when resolved against `base`
///
/// Returns the prefix of `raw` up to and including its first missing
/// component, and whether the whole path exists. The prefix keeps the raw
/// form (relative stays relative) so it resolves like the original argument.
pub fn consulted_prefix(base: &Path, raw: &str, exists: impl Fn(&Path) -> bool) -> (String, bool) {
    let mut full = PathBuf::from(base);
    let mut prefix = String::new();
    for component in raw.split('/').filter(|c| !c.is_empty()) {
        full.push(component);
        if prefix.is_empty() {
            if raw.starts_with('/') {
                prefix.push('/');
            }
        } else {
            prefix.push('/');
        }
        prefix.push_str(component);
        if !exists(&full) {
            return (prefix, false);
        }
    }
    (raw.to_string(), true)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod imp {
    use super::*;

    pub(super) fn spawn(_command: &str, _tx: Sender<ProbeMessage>) -> Result<PtraceProbe, ProbeError> {
        Err(ProbeError::Unsupported(
            "live tracing needs Linux on x86_64; use --replay",
        ))
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use super::*;
    use crate::classifier::path_arguments;
    use crate::clock::SequenceClock;
    use crate::record::{Outcome, ProbeRecord, RecordKind, Tid};
    use crate::syscalls::{Abi, Syscall};
    use anyhow::{Context, Result};
    use fnv::{FnvHashMap, FnvHashSet};
    use nix::errno::Errno;
    use nix::sys::ptrace;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{execv, fork, setpgid, ForkResult, Pid as NixPid};
    use std::ffi::CString;
    use std::thread;
    use tracing::{trace, warn};

    const ABI: Abi = Abi::LinuxX86_64;
    const PATH_MAX: usize = 4096;

    pub(super) fn spawn(command: &str, tx: Sender<ProbeMessage>) -> Result<PtraceProbe, ProbeError> {
        let argv = [
            CString::new("/bin/sh"),
            CString::new("-c"),
            CString::new(command),
        ]
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ProbeError::Launch("command contains a NUL byte".to_string()))?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
        let thread_cancelled = Arc::clone(&cancelled);

        // ptrace requests must come from the thread that forked the tracee
        let thread = thread::Builder::new()
            .name("shk-ptrace".to_string())
            .spawn(move || {
                let root = match launch(&argv) {
                    Ok(root) => root,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(root));
                let mut tracer = Tracer::new(root, tx, thread_cancelled);
                tracer.start();
                let code = match tracer.run() {
                    Ok(code) => code,
                    Err(err) => {
                        warn!(error = ?err, "ptrace loop aborted, killing traced tree");
                        let _ = killpg(root, Signal::SIGKILL);
                        128 + Signal::SIGKILL as i32
                    }
                };
                let _ = tracer.tx.send(ProbeMessage::Exited { code });
            })?;

        let root = match ready_rx.recv() {
            Ok(Ok(root)) => root,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                return Err(ProbeError::Launch(
                    "probe thread exited before launching the command".to_string(),
                ))
            }
        };

        let root = root.as_raw() as Pid;
        Ok(PtraceProbe {
            root,
            killer: Killer {
                pgid: root,
                cancelled,
            },
            thread: Some(thread),
        })
    }

    /// Fork and exec the command, returning once the child is stopped with
    /// tracing options set
    fn launch(argv: &[CString]) -> Result<NixPid, ProbeError> {
        // SAFETY: the child only calls async-signal-safe functions before exec
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {}
                    status => {
                        return Err(ProbeError::Launch(format!(
                            "traced command did not stop at exec: {:?}",
                            status
                        )))
                    }
                }
                let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
                    | ptrace::Options::PTRACE_O_EXITKILL
                    | ptrace::Options::PTRACE_O_TRACEFORK
                    | ptrace::Options::PTRACE_O_TRACEVFORK
                    | ptrace::Options::PTRACE_O_TRACECLONE
                    | ptrace::Options::PTRACE_O_TRACEEXEC;
                ptrace::setoptions(child, options)?;
                Ok(child)
            }
            ForkResult::Child => {
                let _ = setpgid(NixPid::from_raw(0), NixPid::from_raw(0));
                if ptrace::traceme().is_ok() {
                    let _ = execv(&argv[0], argv);
                }
                // SAFETY: _exit is async-signal-safe and skips atexit handlers
                // that belong to the parent
                unsafe { libc::_exit(127) }
            }
        }
    }

    /// A syscall seen at entry whose exit is still pending
    struct Entry {
        number: u32,
        syscall: Syscall,
        args: [u64; 6],
        paths: Vec<String>,
    }

    struct ThreadState {
        tgid: Pid,
        in_syscall: bool,
        entry: Option<Entry>,
    }

    impl ThreadState {
        fn new(tgid: Pid) -> Self {
            Self {
                tgid,
                in_syscall: false,
                entry: None,
            }
        }
    }

    struct Tracer {
        root: NixPid,
        tx: Sender<ProbeMessage>,
        cancelled: Arc<AtomicBool>,
        clock: SequenceClock,
        threads: FnvHashMap<i32, ThreadState>,
        /// New tracees that stopped before their creation event arrived
        held: FnvHashSet<i32>,
        /// Announced tracees whose initial SIGSTOP is still to come
        awaiting_stop: FnvHashSet<i32>,
        root_code: Option<i32>,
    }

    impl Tracer {
        fn new(root: NixPid, tx: Sender<ProbeMessage>, cancelled: Arc<AtomicBool>) -> Self {
            let mut threads = FnvHashMap::default();
            threads.insert(root.as_raw(), ThreadState::new(root.as_raw() as Pid));
            Self {
                root,
                tx,
                cancelled,
                clock: SequenceClock::new(),
                threads,
                held: FnvHashSet::default(),
                awaiting_stop: FnvHashSet::default(),
                root_code: None,
            }
        }

        fn emit(&self, pid: Pid, tid: Tid, kind: RecordKind) {
            let record = ProbeRecord::new(self.clock.tick(), pid, tid, kind);
            // A closed channel means the session is gone; keep reaping anyway
            let _ = self.tx.send(ProbeMessage::Record(record));
        }

        /// Announce the root process and let it run
        fn start(&mut self) {
            let cwd = std::env::current_dir()
                .ok()
                .map(|dir| dir.to_string_lossy().into_owned());
            let pid = self.root.as_raw() as Pid;
            self.emit(pid, pid as Tid, RecordKind::ProcessStart { parent: None, cwd });
            self.resume(self.root, None);
        }

        fn resume(&self, tid: NixPid, signal: Option<Signal>) {
            if let Err(err) = ptrace::syscall(tid, signal) {
                trace!(tid = tid.as_raw(), %err, "resume failed");
            }
        }

        fn tgid(&self, tid: i32) -> Pid {
            self.threads
                .get(&tid)
                .map(|t| t.tgid)
                .unwrap_or(tid as Pid)
        }

        fn run(&mut self) -> Result<i32> {
            loop {
                let status = match waitpid(None::<NixPid>, Some(WaitPidFlag::__WALL)) {
                    Ok(status) => status,
                    Err(Errno::ECHILD) => break,
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err).context("Failed to waitpid"),
                };

                match status {
                    WaitStatus::PtraceSyscall(tid) => {
                        self.on_syscall_stop(tid);
                        self.resume(tid, None);
                    }
                    WaitStatus::PtraceEvent(tid, _, event) => {
                        self.on_event(tid, event)?;
                        self.resume(tid, None);
                    }
                    WaitStatus::Stopped(tid, signal) => self.on_signal_stop(tid, signal),
                    WaitStatus::Exited(tid, code) => self.on_exit(tid, code),
                    WaitStatus::Signaled(tid, signal, _) => self.on_exit(tid, 128 + signal as i32),
                    _ => {}
                }
            }
            Ok(self.root_code.unwrap_or(128 + Signal::SIGKILL as i32))
        }

        fn on_event(&mut self, tid: NixPid, event: i32) -> Result<()> {
            match event {
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                    let child = ptrace::getevent(tid).context("Failed to read new tracee id")? as i32;
                    let parent_tgid = self.tgid(tid.as_raw());
                    let child_tgid = if event == libc::PTRACE_EVENT_CLONE {
                        read_tgid(child).unwrap_or(child as Pid)
                    } else {
                        child as Pid
                    };
                    self.threads.insert(child, ThreadState::new(child_tgid));

                    if child_tgid == parent_tgid {
                        self.emit(
                            child_tgid,
                            child as Tid,
                            RecordKind::ThreadStart {
                                parent_pid: parent_tgid,
                                parent_tid: tid.as_raw() as Tid,
                            },
                        );
                    } else {
                        self.emit(
                            child_tgid,
                            child as Tid,
                            RecordKind::ProcessStart {
                                parent: Some(parent_tgid),
                                cwd: None,
                            },
                        );
                    }

                    if self.held.remove(&child) {
                        self.resume(NixPid::from_raw(child), None);
                    } else {
                        self.awaiting_stop.insert(child);
                    }
                }
                libc::PTRACE_EVENT_EXEC => {
                    // A non-leader exec takes over the leader's tid
                    let former = ptrace::getevent(tid).context("Failed to read exec tracee id")? as i32;
                    if former != tid.as_raw() {
                        if let Some(state) = self.threads.remove(&former) {
                            self.threads.insert(tid.as_raw(), state);
                        }
                    }
                    let tgid = self.tgid(tid.as_raw());
                    let gone: Vec<i32> = self
                        .threads
                        .iter()
                        .filter(|(t, s)| s.tgid == tgid && **t != tid.as_raw())
                        .map(|(t, _)| *t)
                        .collect();
                    for thread in gone {
                        self.threads.remove(&thread);
                        self.emit(tgid, thread as Tid, RecordKind::ThreadExit);
                    }
                }
                _ => {}
            }
            Ok(())
        }

        fn on_signal_stop(&mut self, tid: NixPid, signal: Signal) {
            let raw = tid.as_raw();
            if !self.threads.contains_key(&raw) {
                // Child stopped before the parent's event; wait for it
                self.held.insert(raw);
                return;
            }
            if signal == Signal::SIGSTOP && self.awaiting_stop.remove(&raw) {
                self.resume(tid, None);
                return;
            }
            self.resume(tid, Some(signal));
        }

        fn on_exit(&mut self, tid: NixPid, code: i32) {
            let raw = tid.as_raw();
            if tid == self.root {
                self.root_code = Some(code);
            }
            self.awaiting_stop.remove(&raw);
            let Some(state) = self.threads.remove(&raw) else {
                return;
            };
            if state.entry.is_some() {
                trace!(tid = raw, "dropping syscall that never returned");
            }
            if state.tgid == raw as Pid {
                self.emit(state.tgid, raw as Tid, RecordKind::ProcessExit { code: Some(code) });
            } else {
                self.emit(state.tgid, raw as Tid, RecordKind::ThreadExit);
            }
        }

        fn on_syscall_stop(&mut self, tid: NixPid) {
            let raw = tid.as_raw();
            let cancelled = self.cancelled.load(Ordering::SeqCst);
            let (entering, tgid) = match self.threads.get_mut(&raw) {
                Some(state) => {
                    state.in_syscall = !state.in_syscall;
                    (state.in_syscall, state.tgid)
                }
                None => return,
            };

            if entering {
                let entry = if cancelled { None } else { read_entry(tid) };
                if let Some(state) = self.threads.get_mut(&raw) {
                    state.entry = entry;
                }
                return;
            }

            let entry = self.threads.get_mut(&raw).and_then(|s| s.entry.take());
            let Some(entry) = entry else {
                return;
            };
            if cancelled {
                return;
            }
            let ret = match ptrace::getregs(tid) {
                Ok(regs) => regs.rax as i64,
                Err(err) => {
                    debug!(tid = raw, %err, "lost syscall exit registers");
                    return;
                }
            };
            let outcome = Outcome::from_raw(ret);
            let paths = if outcome.errno() == Some(libc::ENOENT) {
                consulted_paths(raw, &entry)
            } else {
                entry.paths
            };
            self.emit(
                tgid,
                raw as Tid,
                RecordKind::Syscall {
                    number: entry.number,
                    args: entry.args.to_vec(),
                    paths,
                    outcome,
                },
            );
        }
    }

    /// Capture number, arguments and path strings at syscall entry. Syscalls
    /// the classifier does not know are not recorded at all.
    fn read_entry(tid: NixPid) -> Option<Entry> {
        let regs = match ptrace::getregs(tid) {
            Ok(regs) => regs,
            Err(err) => {
                debug!(tid = tid.as_raw(), %err, "lost syscall entry registers");
                return None;
            }
        };
        let number = regs.orig_rax as u32;
        let syscall = ABI.syscall(number)?;
        let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];

        let mut paths = Vec::new();
        for arg in path_arguments(syscall) {
            let addr = args[arg.path];
            if addr == 0 {
                break;
            }
            match read_string(tid, addr as usize) {
                Ok(path) => paths.push(path),
                Err(err) => {
                    trace!(tid = tid.as_raw(), syscall = syscall.name(), error = ?err, "unreadable path");
                    break;
                }
            }
        }

        Some(Entry {
            number,
            syscall,
            args,
            paths,
        })
    }

    /// Read a null-terminated string from the tracee's memory
    fn read_string(tid: NixPid, addr: usize) -> Result<String> {
        use nix::sys::uio::{process_vm_readv, RemoteIoVec};
        use std::io::IoSliceMut;

        let mut buf = vec![0u8; PATH_MAX];
        let mut local_iov = [IoSliceMut::new(&mut buf)];
        let remote_iov = [RemoteIoVec {
            base: addr,
            len: PATH_MAX,
        }];

        let bytes_read = process_vm_readv(tid, &mut local_iov, &remote_iov)
            .context("Failed to read string from tracee memory")?;

        if bytes_read == 0 {
            anyhow::bail!("Read 0 bytes from tracee");
        }

        let nul = buf[..bytes_read]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes_read);
        Ok(String::from_utf8_lossy(&buf[..nul]).into_owned())
    }

    /// Paths the kernel looked up before giving up with ENOENT: the first path
    /// that does not fully exist is cut after its first missing component and
    /// every later path is dropped
    fn consulted_paths(tid: i32, entry: &Entry) -> Vec<String> {
        let at_fdcwd = ABI.constants().at_fdcwd;
        let mut out = Vec::with_capacity(entry.paths.len());
        for (arg, raw) in path_arguments(entry.syscall).iter().zip(&entry.paths) {
            let base = if raw.starts_with('/') {
                Some(PathBuf::from("/"))
            } else {
                let link = match arg.dirfd.map(|i| entry.args[i] as u32 as i32) {
                    Some(fd) if fd != at_fdcwd => format!("/proc/{}/fd/{}", tid, fd),
                    _ => format!("/proc/{}/cwd", tid),
                };
                std::fs::read_link(link).ok()
            };
            let Some(base) = base else {
                out.push(raw.clone());
                continue;
            };
            let (prefix, complete) = consulted_prefix(&base, raw, |p| p.exists());
            out.push(prefix);
            if !complete {
                break;
            }
        }
        out
    }

    fn read_tgid(tid: i32) -> Option<Pid> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", tid)).ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Tgid:"))
            .and_then(|value| value.trim().parse().ok())
    }
}
