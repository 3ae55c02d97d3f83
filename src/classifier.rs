//! Syscall classification
//!
//! Turns one probe record into the read/write/create/delete events it implies
//! and keeps the [`ResolutionStore`] in step with the kernel. Behavior is a
//! declarative table: every [`Syscall`] maps to a [`Rule`] saying where its
//! paths come from and what a success or a failure means.
//!
//! Failures matter as much as successes. A failed `chmod` still tells the
//! program whether the path exists, so it is reported as a read; a failed
//! `mkdir` reveals nothing the creation would not have and is dropped.

use crate::event::{EventKind, RawEvent};
use crate::record::{Outcome, Pid, ProbeRecord, RecordKind, Tid};
use crate::resolution::{CwdScope, Fd, ResolutionStore};
use crate::syscalls::{Abi, AbiConstants, Syscall};
use std::fmt;
use tracing::{debug, trace, warn};

const ENOENT: i32 = 2;

/// One path argument: the argument holding the path string and, for `*at`
/// syscalls, the argument holding its directory descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathArg {
    pub dirfd: Option<usize>,
    pub path: usize,
}

impl PathArg {
    const fn cwd(path: usize) -> Self {
        Self { dirfd: None, path }
    }

    const fn at(dirfd: usize, path: usize) -> Self {
        Self {
            dirfd: Some(dirfd),
            path,
        }
    }
}

/// Where the paths of a syscall come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    None,
    /// Path strings, reported by the probe in this order
    Paths(&'static [PathArg]),
    /// A file descriptor argument, resolved through the descriptor table
    Fd(usize),
    /// Like `Paths`, but a NULL path names the directory descriptor itself
    PathsOrDirfd(&'static [PathArg]),
}

/// Effect of a successful call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Success {
    /// One event per path, in path order
    Emit(&'static [EventKind]),
    /// Flag-driven open; `None` is `creat`, which implies write+create+truncate
    Open { flags: Option<usize> },
    /// delete+create, or write+write when the flags argument asks for an
    /// exchange
    Rename { flags: Option<usize> },
    Chdir(CwdScope),
    /// `dup`/`dup2`/`dup3`; the new descriptor is the return value
    Dup { flags: Option<usize> },
    Fcntl,
    Close,
    Fork,
    Exec,
    Unsupported,
}

/// Effect of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Read of every consulted path
    ReadAll,
    /// Read of the first consulted path only
    ReadFirst,
    /// Read unless the lookup failed with ENOENT
    Open,
    Nothing,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub paths: PathSource,
    pub on_success: Success,
    pub on_failure: Failure,
}

const fn rule(paths: PathSource, on_success: Success, on_failure: Failure) -> Rule {
    Rule {
        paths,
        on_success,
        on_failure,
    }
}

const PATH0: PathSource = PathSource::Paths(&[PathArg::cwd(0)]);
const PATH1: PathSource = PathSource::Paths(&[PathArg::cwd(1)]);
const AT0_1: PathSource = PathSource::Paths(&[PathArg::at(0, 1)]);
const AT0_1_OR_DIRFD: PathSource = PathSource::PathsOrDirfd(&[PathArg::at(0, 1)]);
const AT1_2: PathSource = PathSource::Paths(&[PathArg::at(1, 2)]);
const PATH0_PATH1: PathSource = PathSource::Paths(&[PathArg::cwd(0), PathArg::cwd(1)]);
const AT0_1_AT2_3: PathSource = PathSource::Paths(&[PathArg::at(0, 1), PathArg::at(2, 3)]);
const FD0: PathSource = PathSource::Fd(0);

const READ: Success = Success::Emit(&[EventKind::Read]);
const WRITE: Success = Success::Emit(&[EventKind::Write]);
const CREATE: Success = Success::Emit(&[EventKind::Create]);
const DELETE: Success = Success::Emit(&[EventKind::Delete]);
const LINK: Success = Success::Emit(&[EventKind::Read, EventKind::Create]);
const MOVE: &[EventKind] = &[EventKind::Delete, EventKind::Create];
const SWAP: &[EventKind] = &[EventKind::Write, EventKind::Write];
const EXCHANGE: Success = Success::Emit(SWAP);

const UNSUPPORTED: Rule = rule(PathSource::None, Success::Unsupported, Failure::Unsupported);

/// The classification table
pub fn rule_for(syscall: Syscall) -> Rule {
    use Failure::{ReadAll, ReadFirst};
    use PathSource::None as NoPaths;

    match syscall {
        Syscall::Access
        | Syscall::Stat
        | Syscall::Lstat
        | Syscall::Stat64
        | Syscall::Lstat64
        | Syscall::StatExtended
        | Syscall::LstatExtended
        | Syscall::Stat64Extended
        | Syscall::Lstat64Extended
        | Syscall::Getattrlist
        | Syscall::Getxattr
        | Syscall::Lgetxattr
        | Syscall::Listxattr
        | Syscall::Llistxattr
        | Syscall::Readlink
        | Syscall::Pathconf => rule(PATH0, READ, ReadAll),

        Syscall::Faccessat
        | Syscall::Faccessat2
        | Syscall::Fstatat
        | Syscall::Fstatat64
        | Syscall::Newfstatat
        | Syscall::Statx
        | Syscall::Getattrlistat
        | Syscall::Readlinkat => rule(AT0_1, READ, ReadAll),

        Syscall::Fstat
        | Syscall::Fstat64
        | Syscall::FstatExtended
        | Syscall::Fstat64Extended
        | Syscall::Fgetattrlist
        | Syscall::Fgetxattr
        | Syscall::Flistxattr
        | Syscall::Fpathconf
        | Syscall::Getdirentries
        | Syscall::Getdirentries64
        | Syscall::Getdirentriesattr
        | Syscall::Getattrlistbulk
        | Syscall::Getdents
        | Syscall::Getdents64 => rule(FD0, READ, ReadAll),

        Syscall::Chmod
        | Syscall::ChmodExtended
        | Syscall::Chown
        | Syscall::Lchown
        | Syscall::Chflags
        | Syscall::Utimes
        | Syscall::Utime
        | Syscall::Setattrlist
        | Syscall::Setxattr
        | Syscall::Lsetxattr
        | Syscall::Removexattr
        | Syscall::Lremovexattr
        | Syscall::Truncate => rule(PATH0, WRITE, ReadAll),

        Syscall::Fchmodat | Syscall::Fchownat => rule(AT0_1, WRITE, ReadAll),
        Syscall::Utimensat | Syscall::Futimesat => rule(AT0_1_OR_DIRFD, WRITE, ReadAll),

        Syscall::Fchmod
        | Syscall::FchmodExtended
        | Syscall::Fchown
        | Syscall::Fchflags
        | Syscall::Flock
        | Syscall::Fsetxattr
        | Syscall::Fremovexattr
        | Syscall::Fsetattrlist
        | Syscall::Futimes => rule(FD0, WRITE, ReadAll),

        Syscall::Open
        | Syscall::OpenNocancel
        | Syscall::OpenExtended
        | Syscall::OpenDprotectedNp => rule(PATH0, Success::Open { flags: Some(1) }, Failure::Open),
        Syscall::GuardedOpenNp | Syscall::GuardedOpenDprotectedNp => {
            rule(PATH0, Success::Open { flags: Some(3) }, Failure::Open)
        }
        Syscall::Openat | Syscall::OpenatNocancel => {
            rule(AT0_1, Success::Open { flags: Some(2) }, Failure::Open)
        }
        Syscall::Creat => rule(PATH0, Success::Open { flags: None }, Failure::Open),

        Syscall::Mkdir
        | Syscall::MkdirExtended
        | Syscall::Mkfifo
        | Syscall::MkfifoExtended
        | Syscall::Mknod => rule(PATH0, CREATE, Failure::Nothing),
        Syscall::Mkdirat | Syscall::Mknodat => rule(AT0_1, CREATE, Failure::Nothing),
        // The target string is never looked up; only the link path is
        Syscall::Symlink => rule(PATH1, CREATE, Failure::Nothing),
        Syscall::Symlinkat => rule(AT1_2, CREATE, Failure::Nothing),

        Syscall::Link => rule(PATH0_PATH1, LINK, ReadFirst),
        Syscall::Linkat => rule(AT0_1_AT2_3, LINK, ReadFirst),

        Syscall::Unlink | Syscall::Rmdir => rule(PATH0, DELETE, ReadAll),
        Syscall::Unlinkat => rule(AT0_1, DELETE, ReadAll),

        Syscall::Rename => rule(PATH0_PATH1, Success::Rename { flags: None }, ReadAll),
        Syscall::Renameat => rule(AT0_1_AT2_3, Success::Rename { flags: None }, ReadAll),
        Syscall::Renameat2 | Syscall::RenameatxNp => {
            rule(AT0_1_AT2_3, Success::Rename { flags: Some(4) }, ReadAll)
        }
        Syscall::Exchangedata => rule(PATH0_PATH1, EXCHANGE, ReadAll),

        Syscall::Chdir => rule(PATH0, Success::Chdir(CwdScope::Process), ReadAll),
        Syscall::Fchdir => rule(FD0, Success::Chdir(CwdScope::Process), ReadAll),
        Syscall::PthreadChdir => rule(PATH0, Success::Chdir(CwdScope::Thread), ReadAll),
        Syscall::PthreadFchdir => rule(FD0, Success::Chdir(CwdScope::Thread), ReadAll),

        Syscall::Dup | Syscall::Dup2 => {
            rule(NoPaths, Success::Dup { flags: None }, Failure::Nothing)
        }
        Syscall::Dup3 => rule(NoPaths, Success::Dup { flags: Some(2) }, Failure::Nothing),
        Syscall::Fcntl | Syscall::FcntlNocancel => {
            rule(NoPaths, Success::Fcntl, Failure::Nothing)
        }
        Syscall::Close | Syscall::CloseNocancel | Syscall::GuardedCloseNp => {
            rule(NoPaths, Success::Close, Failure::Nothing)
        }

        Syscall::Fork | Syscall::Vfork => rule(NoPaths, Success::Fork, Failure::Nothing),
        Syscall::Execve => rule(PATH0, Success::Exec, ReadAll),
        Syscall::Execveat => rule(AT0_1, Success::Exec, ReadAll),
        Syscall::PosixSpawn => rule(PATH1, READ, ReadAll),

        Syscall::AccessExtended
        | Syscall::Chroot
        | Syscall::Copyfile
        | Syscall::Delete
        | Syscall::Undelete
        | Syscall::Searchfs
        | Syscall::Fhopen
        | Syscall::Fsgetpath
        | Syscall::OpenbyidNp
        | Syscall::OpenByHandleAt => UNSUPPORTED,
    }
}

/// Path arguments a probe has to read out of the tracee for `syscall`
pub fn path_arguments(syscall: Syscall) -> &'static [PathArg] {
    match rule_for(syscall).paths {
        PathSource::Paths(args) | PathSource::PathsOrDirfd(args) => args,
        PathSource::None | PathSource::Fd(_) => &[],
    }
}

/// A syscall the tracer saw but cannot attribute to paths. The trace is
/// incomplete when any of these were recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub sequence: u64,
    pub pid: Pid,
    pub syscall: &'static str,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} not supported (pid {})", self.syscall, self.pid)
    }
}

/// Decoded open(2) flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenFlags {
    read: bool,
    write: bool,
    creat: bool,
    excl: bool,
    trunc: bool,
    cloexec: bool,
}

impl OpenFlags {
    fn decode(flags: u64, c: &AbiConstants) -> Self {
        let mode = flags & c.o_accmode;
        Self {
            read: mode != c.o_wronly,
            write: mode == c.o_wronly || mode == c.o_rdwr,
            creat: flags & c.o_creat != 0,
            excl: flags & c.o_excl != 0,
            trunc: flags & c.o_trunc != 0,
            cloexec: flags & c.o_cloexec != 0,
        }
    }

    /// `creat(path, mode)` is `open(path, O_CREAT | O_WRONLY | O_TRUNC)`
    fn creat() -> Self {
        Self {
            read: false,
            write: true,
            creat: true,
            excl: false,
            trunc: true,
            cloexec: false,
        }
    }

    /// Events of a successful open
    fn success_events(self) -> impl Iterator<Item = EventKind> {
        // O_EXCL reveals whether something was already there
        let read = (self.excl || (self.read && !self.trunc)).then_some(EventKind::Read);
        let modify = if self.trunc || (self.creat && self.excl) {
            Some(EventKind::Create)
        } else if self.write {
            Some(EventKind::Write)
        } else {
            None
        };
        read.into_iter().chain(modify)
    }

    /// A plain read-only open that fails with ENOENT still observed absence
    fn is_plain_read(self) -> bool {
        !self.write && !self.creat && !self.trunc
    }
}

/// Stateless apart from its diagnostics; all resolution state lives in the
/// store passed to [`Classifier::classify`].
#[derive(Debug)]
pub struct Classifier {
    abi: Abi,
    diagnostics: Vec<Diagnostic>,
}

/// Per-record view handed to the rule interpreters
struct Call<'a> {
    sequence: u64,
    pid: Pid,
    tid: Tid,
    args: &'a [u64],
    paths: &'a [String],
    outcome: Outcome,
}

impl<'a> Call<'a> {
    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Descriptor arguments are C ints; the upper half of the register is
    /// garbage
    fn fd_arg(&self, index: usize) -> Fd {
        self.arg(index) as u32 as i32
    }
}

impl Classifier {
    pub fn new(abi: Abi) -> Self {
        Self {
            abi,
            diagnostics: Vec::new(),
        }
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Classify one record, updating `store`. Never fails: unknown syscalls
    /// and processes degrade to fewer or less resolved events.
    pub fn classify(&mut self, store: &mut ResolutionStore, record: &ProbeRecord) -> Vec<RawEvent> {
        let (pid, tid) = (record.pid, record.tid);
        match &record.kind {
            RecordKind::ProcessStart { parent: None, cwd } => {
                store.launch(pid, cwd.clone());
                Vec::new()
            }
            RecordKind::ProcessStart {
                parent: Some(parent),
                ..
            } => {
                store.fork_process(*parent, pid);
                Vec::new()
            }
            RecordKind::ThreadStart {
                parent_pid,
                parent_tid,
            } => {
                store.thread_started(pid, tid, *parent_pid, *parent_tid);
                Vec::new()
            }
            RecordKind::ThreadExit => {
                store.thread_exited(pid, tid);
                Vec::new()
            }
            RecordKind::ProcessExit { .. } => {
                store.reap_process(pid);
                Vec::new()
            }
            RecordKind::Syscall {
                number,
                args,
                paths,
                outcome,
            } => {
                let Some(syscall) = self.abi.syscall(*number) else {
                    trace!(number, pid, "ignoring unclassified syscall");
                    return Vec::new();
                };
                store.observe(pid);
                let call = Call {
                    sequence: record.sequence,
                    pid,
                    tid,
                    args,
                    paths,
                    outcome: *outcome,
                };
                self.classify_syscall(store, syscall, &call)
            }
        }
    }

    fn classify_syscall(
        &mut self,
        store: &mut ResolutionStore,
        syscall: Syscall,
        call: &Call<'_>,
    ) -> Vec<RawEvent> {
        let rule = rule_for(syscall);
        let paths = self.resolve_paths(store, rule.paths, call);
        let event = |kind, path: &String| RawEvent::new(kind, path.as_str(), call.sequence);

        match call.outcome {
            Outcome::Success { retval } => match rule.on_success {
                Success::Emit(kinds) => kinds
                    .iter()
                    .zip(paths.iter())
                    .map(|(kind, path)| event(*kind, path))
                    .collect(),
                Success::Rename { flags } => {
                    let exchange = self.abi.constants().rename_exchange;
                    let kinds = if flags.is_some_and(|i| call.arg(i) & exchange != 0) {
                        SWAP
                    } else {
                        MOVE
                    };
                    kinds
                        .iter()
                        .zip(paths.iter())
                        .map(|(kind, path)| event(*kind, path))
                        .collect()
                }
                Success::Open { flags } => {
                    let flags = self.open_flags(flags, call);
                    let Some(path) = paths.first() else {
                        return Vec::new();
                    };
                    store.open_fd(call.pid, retval as Fd, Some(path.clone()), flags.cloexec);
                    flags
                        .success_events()
                        .map(|kind| event(kind, path))
                        .collect()
                }
                Success::Chdir(scope) => {
                    let dir = match rule.paths {
                        PathSource::Fd(_) => paths.into_iter().next(),
                        _ => match paths.into_iter().next() {
                            Some(dir) => Some(dir),
                            None => return Vec::new(),
                        },
                    };
                    debug!(pid = call.pid, tid = call.tid, ?dir, ?scope, "chdir");
                    store.update_working_directory(call.pid, call.tid, dir, scope);
                    Vec::new()
                }
                Success::Dup { flags } => {
                    let c = self.abi.constants();
                    let (old, new) = (call.fd_arg(0), retval as Fd);
                    // dup2 onto itself leaves the descriptor and its flags alone
                    if old != new {
                        let cloexec = flags.is_some_and(|i| call.arg(i) & c.o_cloexec != 0);
                        store.dup_fd(call.pid, old, new, cloexec);
                    }
                    Vec::new()
                }
                Success::Fcntl => {
                    self.fcntl(store, call, retval);
                    Vec::new()
                }
                Success::Close => {
                    store.close_fd(call.pid, call.fd_arg(0));
                    Vec::new()
                }
                Success::Fork => {
                    // The child's own return from fork reports 0
                    if retval > 0 {
                        store.fork_process(call.pid, retval as Pid);
                    }
                    Vec::new()
                }
                Success::Exec => {
                    store.exec(call.pid, call.tid);
                    paths
                        .first()
                        .map(|path| vec![event(EventKind::Read, path)])
                        .unwrap_or_default()
                }
                Success::Unsupported => {
                    self.unsupported(syscall, call);
                    Vec::new()
                }
            },
            Outcome::Failure { errno } => match rule.on_failure {
                Failure::ReadAll => paths.iter().map(|p| event(EventKind::Read, p)).collect(),
                Failure::ReadFirst => paths
                    .first()
                    .map(|p| vec![event(EventKind::Read, p)])
                    .unwrap_or_default(),
                Failure::Open => {
                    let flags = match rule.on_success {
                        Success::Open { flags } => self.open_flags(flags, call),
                        _ => OpenFlags::creat(),
                    };
                    if errno == ENOENT && !flags.is_plain_read() {
                        return Vec::new();
                    }
                    paths
                        .first()
                        .map(|p| vec![event(EventKind::Read, p)])
                        .unwrap_or_default()
                }
                Failure::Nothing => Vec::new(),
                Failure::Unsupported => {
                    self.unsupported(syscall, call);
                    Vec::new()
                }
            },
        }
    }

    fn open_flags(&self, flags: Option<usize>, call: &Call<'_>) -> OpenFlags {
        match flags {
            Some(index) => OpenFlags::decode(call.arg(index), self.abi.constants()),
            None => OpenFlags::creat(),
        }
    }

    fn fcntl(&self, store: &mut ResolutionStore, call: &Call<'_>, retval: i64) {
        let c = self.abi.constants();
        let fd = call.fd_arg(0);
        let cmd = call.arg(1);
        if cmd == c.f_dupfd || cmd == c.f_dupfd_cloexec {
            store.dup_fd(call.pid, fd, retval as Fd, cmd == c.f_dupfd_cloexec);
        } else if cmd == c.f_setfd {
            store.set_cloexec(call.pid, fd, call.arg(2) & c.fd_cloexec != 0);
        }
    }

    /// Absolute forms of the consulted paths, in path order. Later paths the
    /// kernel never looked up are absent from the record and so from the
    /// result. An fd source yields its descriptor's path, or nothing when the
    /// descriptor is unknown.
    fn resolve_paths(
        &self,
        store: &ResolutionStore,
        source: PathSource,
        call: &Call<'_>,
    ) -> Vec<String> {
        match source {
            PathSource::None => Vec::new(),
            PathSource::Fd(index) => store
                .fd_path(call.pid, call.fd_arg(index))
                .map(|p| vec![p.to_string()])
                .unwrap_or_default(),
            PathSource::PathsOrDirfd(args) => match args.first() {
                Some(&PathArg {
                    dirfd: Some(dirfd),
                    path,
                }) if call.paths.is_empty() && call.arg(path) == 0 => {
                    self.resolve_paths(store, PathSource::Fd(dirfd), call)
                }
                _ => self.resolve_paths(store, PathSource::Paths(args), call),
            },
            PathSource::Paths(args) => args
                .iter()
                .zip(call.paths.iter())
                .map(|(arg, raw)| {
                    let dirfd = arg.dirfd.and_then(|i| {
                        let fd = call.fd_arg(i);
                        (fd != self.abi.constants().at_fdcwd).then_some(fd)
                    });
                    store.resolve(call.pid, call.tid, dirfd, self.clean_path(raw))
                })
                .collect(),
        }
    }

    /// Darwin lookup records name the root directory with an empty string and
    /// pad a lookup that stopped at a missing directory with `>`
    fn clean_path<'p>(&self, raw: &'p str) -> &'p str {
        match self.abi {
            Abi::Darwin if raw.is_empty() => "/",
            Abi::Darwin => match raw.trim_end_matches('>') {
                "" => raw,
                trimmed => trimmed,
            },
            Abi::LinuxX86_64 => raw,
        }
    }

    fn unsupported(&mut self, syscall: Syscall, call: &Call<'_>) {
        let diagnostic = Diagnostic {
            sequence: call.sequence,
            pid: call.pid,
            syscall: syscall.name(),
        };
        warn!(%diagnostic, "trace will be incomplete");
        self.diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX: Abi = Abi::LinuxX86_64;
    const PID: Pid = 100;

    fn setup() -> (Classifier, ResolutionStore) {
        let mut store = ResolutionStore::new();
        store.launch(PID, Some("/w".to_string()));
        (Classifier::new(LINUX), store)
    }

    fn sys(syscall: Syscall, args: &[u64], paths: &[&str], ret: i64) -> ProbeRecord {
        let number = LINUX.number(syscall).unwrap();
        ProbeRecord::syscall(1, PID, PID as Tid, number, args, paths, Outcome::from_raw(ret))
    }

    fn kinds(events: &[RawEvent]) -> Vec<(EventKind, &str)> {
        events.iter().map(|e| (e.kind, e.path.as_str())).collect()
    }

    fn at_fdcwd() -> u64 {
        LINUX.constants().at_fdcwd as u32 as u64
    }

    const O_WRONLY: u64 = 0o1;
    const O_RDWR: u64 = 0o2;
    const O_CREAT: u64 = 0o100;
    const O_EXCL: u64 = 0o200;
    const O_TRUNC: u64 = 0o1000;
    const O_CLOEXEC: u64 = 0o2000000;

    #[test]
    fn test_stat_reads() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Stat, &[0], &["in"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/in")]);

        let events = c.classify(&mut s, &sys(Syscall::Stat, &[0], &["missing"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/missing")]);
    }

    #[test]
    fn test_stat_through_missing_dir_reads_consulted_prefix() {
        let (mut c, mut s) = setup();
        // The probe reports how far the lookup got
        let events = c.classify(&mut s, &sys(Syscall::Stat, &[0], &["missing_dir"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/missing_dir")]);
    }

    #[test]
    fn test_touch_writes() {
        let (mut c, mut s) = setup();
        let flags = O_WRONLY | O_CREAT;
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, flags], &["file"], 3));
        assert_eq!(kinds(&events), vec![(EventKind::Write, "/w/file")]);
        assert_eq!(s.fd_path(PID, 3), Some("/w/file"));
    }

    #[test]
    fn test_truncating_open_creates_once() {
        let (mut c, mut s) = setup();
        let flags = O_WRONLY | O_CREAT | O_TRUNC;
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, flags], &["out"], 3));
        assert_eq!(kinds(&events), vec![(EventKind::Create, "/w/out")]);
    }

    #[test]
    fn test_exclusive_create_reads_and_creates() {
        let (mut c, mut s) = setup();
        let flags = O_WRONLY | O_CREAT | O_EXCL;
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, flags], &["new"], 3));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Read, "/w/new"), (EventKind::Create, "/w/new")]
        );
    }

    #[test]
    fn test_read_write_open() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, O_RDWR], &["db"], 3));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Read, "/w/db"), (EventKind::Write, "/w/db")]
        );
    }

    #[test]
    fn test_creat_syscall() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Creat, &[0, 0o644], &["c"], 4));
        assert_eq!(kinds(&events), vec![(EventKind::Create, "/w/c")]);
    }

    #[test]
    fn test_open_failures() {
        let (mut c, mut s) = setup();
        // Read-only open of a missing file observed its absence
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, 0], &["nope"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/nope")]);

        // Creating under a missing directory reveals nothing
        let flags = O_WRONLY | O_CREAT | O_TRUNC;
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, flags], &["d"], -2));
        assert!(events.is_empty());

        // EEXIST from an exclusive create is an observation
        let flags = O_WRONLY | O_CREAT | O_EXCL;
        let events = c.classify(&mut s, &sys(Syscall::Open, &[0, flags], &["e"], -17));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/e")]);
        assert_eq!(s.fd_path(PID, -17), None);
    }

    #[test]
    fn test_openat_with_dirfd() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 5, Some("/src".to_string()), false);
        let events = c.classify(&mut s, &sys(Syscall::Openat, &[5, 0, 0], &["a.c"], 6));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/src/a.c")]);

        let events = c.classify(&mut s, &sys(Syscall::Openat, &[at_fdcwd(), 0, 0], &["b.c"], 7));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/b.c")]);
    }

    #[test]
    fn test_cloexec_open_then_exec() {
        let (mut c, mut s) = setup();
        c.classify(&mut s, &sys(Syscall::Open, &[0, O_CLOEXEC], &["x"], 3));
        c.classify(&mut s, &sys(Syscall::Open, &[0, 0], &["y"], 4));
        let events = c.classify(&mut s, &sys(Syscall::Execve, &[0], &["/bin/true"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/bin/true")]);
        assert_eq!(s.fd_path(PID, 3), None);
        assert_eq!(s.fd_path(PID, 4), Some("/w/y"));
    }

    #[test]
    fn test_failed_mutations_read() {
        let (mut c, mut s) = setup();
        for syscall in [Syscall::Chmod, Syscall::Chown, Syscall::Setxattr, Syscall::Truncate] {
            let events = c.classify(&mut s, &sys(syscall, &[0], &["f"], -1));
            assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/f")], "{:?}", syscall);
        }
        let events = c.classify(&mut s, &sys(Syscall::Chmod, &[0], &["f"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Write, "/w/f")]);
    }

    #[test]
    fn test_fd_mutation() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/w/f".to_string()), false);
        let events = c.classify(&mut s, &sys(Syscall::Fchmod, &[3], &[], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Write, "/w/f")]);
        let events = c.classify(&mut s, &sys(Syscall::Fchmod, &[3], &[], -1));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/f")]);
        // Unknown descriptor
        let events = c.classify(&mut s, &sys(Syscall::Fchmod, &[9], &[], 0));
        assert!(events.is_empty());
    }

    #[test]
    fn test_getdents_reads_directory() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/w/dir".to_string()), false);
        let events = c.classify(&mut s, &sys(Syscall::Getdents64, &[3], &[], 48));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/dir")]);
    }

    #[test]
    fn test_mkdir() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Mkdir, &[0, 0o755], &["d"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Create, "/w/d")]);
        let events = c.classify(&mut s, &sys(Syscall::Mkdir, &[0, 0o755], &["d"], -17));
        assert!(events.is_empty());
    }

    #[test]
    fn test_symlink_creates_link_path() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Symlink, &[0, 0], &["lnk"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Create, "/w/lnk")]);
    }

    #[test]
    fn test_link() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Link, &[0, 0], &["a", "b"], 0));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Read, "/w/a"), (EventKind::Create, "/w/b")]
        );
        let events = c.classify(&mut s, &sys(Syscall::Link, &[0, 0], &["a", "b"], -17));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/a")]);
    }

    #[test]
    fn test_rename() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Rename, &[0, 0], &["file1", "file2"], 0));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Delete, "/w/file1"), (EventKind::Create, "/w/file2")]
        );
    }

    #[test]
    fn test_rename_failure_reads_consulted_paths() {
        let (mut c, mut s) = setup();
        // Onto an existing directory: both looked up
        let events = c.classify(&mut s, &sys(Syscall::Rename, &[0, 0], &["input", "output"], -21));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Read, "/w/input"), (EventKind::Read, "/w/output")]
        );
        // Source missing: the destination was never looked up
        let events = c.classify(&mut s, &sys(Syscall::Rename, &[0, 0], &["gone"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/gone")]);
    }

    #[test]
    fn test_unlink() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Unlink, &[0], &["f"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Delete, "/w/f")]);
        let events = c.classify(&mut s, &sys(Syscall::Unlinkat, &[at_fdcwd(), 0, 0], &["f"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/f")]);
    }

    #[test]
    fn test_chdir_and_failed_chdir() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Chdir, &[0], &["sub"], 0));
        assert!(events.is_empty());
        assert_eq!(s.working_directory(PID, PID as Tid), Some("/w/sub"));

        let events = c.classify(&mut s, &sys(Syscall::Chdir, &[0], &["nope"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/sub/nope")]);
        assert_eq!(s.working_directory(PID, PID as Tid), Some("/w/sub"));
    }

    #[test]
    fn test_fchdir() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/opt".to_string()), false);
        c.classify(&mut s, &sys(Syscall::Fchdir, &[3], &[], 0));
        assert_eq!(s.working_directory(PID, PID as Tid), Some("/opt"));

        c.classify(&mut s, &sys(Syscall::Fchdir, &[42], &[], 0));
        assert_eq!(s.working_directory(PID, PID as Tid), None);
    }

    #[test]
    fn test_dup_family() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/w/f".to_string()), false);
        c.classify(&mut s, &sys(Syscall::Dup, &[3], &[], 4));
        c.classify(&mut s, &sys(Syscall::Dup2, &[3, 8], &[], 8));
        c.classify(&mut s, &sys(Syscall::Dup3, &[3, 9, O_CLOEXEC], &[], 9));
        assert_eq!(s.fd_path(PID, 4), Some("/w/f"));
        assert_eq!(s.fd_path(PID, 8), Some("/w/f"));
        assert!(s.process(PID).unwrap().fds[&9].cloexec);

        c.classify(&mut s, &sys(Syscall::Fcntl, &[3, 1030, 0], &[], 10));
        assert!(s.process(PID).unwrap().fds[&10].cloexec);
        c.classify(&mut s, &sys(Syscall::Fcntl, &[10, 2, 0], &[], 0));
        assert!(!s.process(PID).unwrap().fds[&10].cloexec);

        c.classify(&mut s, &sys(Syscall::Close, &[3], &[], 0));
        assert_eq!(s.fd_path(PID, 3), None);
    }

    #[test]
    fn test_fork_copies_fds() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/w/f".to_string()), false);
        c.classify(&mut s, &sys(Syscall::Fork, &[], &[], 200));
        assert_eq!(s.fd_path(200, 3), Some("/w/f"));
    }

    #[test]
    fn test_unsupported_records_diagnostic() {
        let (mut c, mut s) = setup();
        let events = c.classify(&mut s, &sys(Syscall::Chroot, &[0], &["/jail"], 0));
        assert!(events.is_empty());
        let diagnostics = c.take_diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].syscall, "chroot");
        assert!(c.diagnostics().is_empty());
    }

    #[test]
    fn test_unknown_number_ignored() {
        let (mut c, mut s) = setup();
        let record = ProbeRecord::syscall(1, PID, PID as Tid, 0, &[3], &[], Outcome::from_raw(10));
        assert!(c.classify(&mut s, &record).is_empty());
    }

    #[test]
    fn test_unknown_process_reports_raw_path() {
        let (mut c, mut s) = setup();
        let record = ProbeRecord::syscall(1, 555, 555, 4, &[0], &["rel"], Outcome::from_raw(0));
        let events = c.classify(&mut s, &record);
        assert_eq!(kinds(&events), vec![(EventKind::Read, "rel")]);
        assert!(s.is_known(555));
    }

    #[test]
    fn test_lifecycle_records() {
        let (mut c, mut s) = setup();
        c.classify(
            &mut s,
            &ProbeRecord::new(1, 300, 300, RecordKind::ProcessStart { parent: Some(PID), cwd: None }),
        );
        assert_eq!(s.working_directory(300, 300), Some("/w"));
        c.classify(&mut s, &ProbeRecord::new(2, 300, 300, RecordKind::ProcessExit { code: Some(0) }));
        assert!(!s.is_known(300));
    }

    #[test]
    fn test_darwin_path_cleanup() {
        let mut store = ResolutionStore::new();
        store.launch(1, Some("/w".to_string()));
        let mut c = Classifier::new(Abi::Darwin);
        let stat = Abi::Darwin.number(Syscall::Stat).unwrap();

        let record = ProbeRecord::syscall(1, 1, 1, stat, &[0], &["/nonexisting>>>>>>"], Outcome::from_raw(-2));
        let events = c.classify(&mut store, &record);
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/nonexisting")]);

        let record = ProbeRecord::syscall(2, 1, 1, stat, &[0], &[""], Outcome::from_raw(0));
        let events = c.classify(&mut store, &record);
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/")]);
    }

    #[test]
    fn test_darwin_open_flags() {
        let mut store = ResolutionStore::new();
        store.launch(1, Some("/w".to_string()));
        let mut c = Classifier::new(Abi::Darwin);
        let open = Abi::Darwin.number(Syscall::Open).unwrap();
        // O_WRONLY | O_CREAT | O_TRUNC on Darwin
        let record = ProbeRecord::syscall(1, 1, 1, open, &[0, 0x601], &["o"], Outcome::from_raw(3));
        let events = c.classify(&mut store, &record);
        assert_eq!(kinds(&events), vec![(EventKind::Create, "/w/o")]);
    }

    fn darwin_setup() -> (Classifier, ResolutionStore) {
        let mut store = ResolutionStore::new();
        store.launch(PID, Some("/w".to_string()));
        (Classifier::new(Abi::Darwin), store)
    }

    fn darwin(syscall: Syscall, tid: Tid, args: &[u64], paths: &[&str], ret: i64) -> ProbeRecord {
        let number = Abi::Darwin.number(syscall).unwrap();
        ProbeRecord::syscall(1, PID, tid, number, args, paths, Outcome::from_raw(ret))
    }

    #[test]
    fn test_exchangedata() {
        let (mut c, mut s) = darwin_setup();
        let tid = PID as Tid;
        let events = c.classify(&mut s, &darwin(Syscall::Exchangedata, tid, &[0, 0, 0], &["input", "output"], 0));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Write, "/w/input"), (EventKind::Write, "/w/output")]
        );

        // Fails at the first lookup: the second path was never consulted
        let events = c.classify(&mut s, &darwin(Syscall::Exchangedata, tid, &[0, 0, 0], &["input"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/w/input")]);

        // Fails at the second lookup
        let events = c.classify(&mut s, &darwin(Syscall::Exchangedata, tid, &[0, 0, 0], &["input", "output"], -2));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Read, "/w/input"), (EventKind::Read, "/w/output")]
        );
    }

    #[test]
    fn test_pthread_fchdir_and_failed_pthread_chdir() {
        let (mut c, mut s) = darwin_setup();
        let worker = PID as Tid + 1;
        s.thread_started(PID, worker, PID, PID as Tid);
        s.open_fd(PID, 3, Some("/usr".to_string()), false);

        let events = c.classify(&mut s, &darwin(Syscall::PthreadFchdir, worker, &[3], &[], 0));
        assert!(events.is_empty());
        assert_eq!(s.working_directory(PID, worker), Some("/usr"));
        assert_eq!(s.working_directory(PID, PID as Tid), Some("/w"));

        let events = c.classify(&mut s, &darwin(Syscall::PthreadChdir, worker, &[0], &["nope"], -2));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/usr/nope")]);
        assert_eq!(s.working_directory(PID, worker), Some("/usr"));
    }

    #[test]
    fn test_vfork_copies_fds() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/w/f".to_string()), false);
        c.classify(&mut s, &sys(Syscall::Vfork, &[], &[], 201));
        assert_eq!(s.fd_path(201, 3), Some("/w/f"));
        assert_eq!(s.working_directory(201, 201), Some("/w"));
    }

    #[test]
    fn test_linkat_with_dirfds() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 3, Some("/a".to_string()), false);
        s.open_fd(PID, 4, Some("/b".to_string()), false);
        let events = c.classify(&mut s, &sys(Syscall::Linkat, &[3, 0, 4, 0, 0], &["x", "y"], 0));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Read, "/a/x"), (EventKind::Create, "/b/y")]
        );
        let events = c.classify(&mut s, &sys(Syscall::Linkat, &[3, 0, 4, 0, 0], &["x", "y"], -17));
        assert_eq!(kinds(&events), vec![(EventKind::Read, "/a/x")]);
    }

    #[test]
    fn test_dup2_onto_itself_keeps_cloexec() {
        let (mut c, mut s) = setup();
        c.classify(&mut s, &sys(Syscall::Open, &[0, O_CLOEXEC], &["secret"], 3));
        c.classify(&mut s, &sys(Syscall::Dup2, &[3, 3], &[], 3));
        assert!(s.process(PID).unwrap().fds[&3].cloexec);
        c.classify(&mut s, &sys(Syscall::Execve, &[0], &["/bin/true"], 0));
        assert_eq!(s.fd_path(PID, 3), None);
    }

    #[test]
    fn test_utimensat_without_path_targets_dirfd() {
        let (mut c, mut s) = setup();
        s.open_fd(PID, 0, Some("/w/file".to_string()), false);
        let events = c.classify(&mut s, &sys(Syscall::Utimensat, &[0, 0, 0, 0], &[], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Write, "/w/file")]);

        let events = c.classify(&mut s, &sys(Syscall::Utimensat, &[at_fdcwd(), 1, 0, 0], &["g"], 0));
        assert_eq!(kinds(&events), vec![(EventKind::Write, "/w/g")]);

        // No path and no real descriptor
        let events = c.classify(&mut s, &sys(Syscall::Utimensat, &[at_fdcwd(), 0, 0, 0], &[], 0));
        assert!(events.is_empty());
    }

    #[test]
    fn test_rename_exchange_writes_both() {
        let (mut c, mut s) = setup();
        let cwd = at_fdcwd();
        let events = c.classify(&mut s, &sys(Syscall::Renameat2, &[cwd, 0, cwd, 0, 2], &["a", "b"], 0));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Write, "/w/a"), (EventKind::Write, "/w/b")]
        );
        // RENAME_NOREPLACE is still a move
        let events = c.classify(&mut s, &sys(Syscall::Renameat2, &[cwd, 0, cwd, 0, 1], &["a", "c"], 0));
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Delete, "/w/a"), (EventKind::Create, "/w/c")]
        );

        let (mut c, mut s) = darwin_setup();
        let darwin_cwd = Abi::Darwin.constants().at_fdcwd as u32 as u64;
        let record = darwin(
            Syscall::RenameatxNp,
            PID as Tid,
            &[darwin_cwd, 0, darwin_cwd, 0, 2],
            &["a", "b"],
            0,
        );
        let events = c.classify(&mut s, &record);
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Write, "/w/a"), (EventKind::Write, "/w/b")]
        );
    }

    #[test]
    fn test_every_syscall_has_a_rule_with_enough_kinds() {
        for syscall in Syscall::ALL {
            let rule = rule_for(*syscall);
            if let (PathSource::Paths(args), Success::Emit(kinds)) = (rule.paths, rule.on_success) {
                assert_eq!(args.len(), kinds.len(), "{}", syscall.name());
            }
        }
    }
}
