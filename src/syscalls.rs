//! Syscall identities and per-ABI numbering
//!
//! Probes report raw syscall numbers. Numbers only mean something together
//! with the ABI of the probe that produced them, so the classifier works on
//! [`Syscall`] identities and each [`Abi`] carries its own number table and
//! the flag constants needed to decode open/fcntl arguments.

use clap::ValueEnum;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

macro_rules! syscalls {
    ($($variant:ident => $name:literal,)*) => {
        /// Syscalls the classifier knows about
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Syscall {
            $($variant,)*
        }

        impl Syscall {
            pub const ALL: &'static [Syscall] = &[$(Syscall::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Syscall::$variant => $name,)*
                }
            }
        }
    };
}

syscalls! {
    // Pure metadata reads
    Access => "access",
    Faccessat => "faccessat",
    Faccessat2 => "faccessat2",
    Stat => "stat",
    Lstat => "lstat",
    Stat64 => "stat64",
    Lstat64 => "lstat64",
    StatExtended => "stat_extended",
    LstatExtended => "lstat_extended",
    Stat64Extended => "stat64_extended",
    Lstat64Extended => "lstat64_extended",
    Fstatat => "fstatat",
    Fstatat64 => "fstatat64",
    Newfstatat => "newfstatat",
    Statx => "statx",
    Getattrlist => "getattrlist",
    Getattrlistat => "getattrlistat",
    Getxattr => "getxattr",
    Lgetxattr => "lgetxattr",
    Listxattr => "listxattr",
    Llistxattr => "llistxattr",
    Readlink => "readlink",
    Readlinkat => "readlinkat",
    Pathconf => "pathconf",
    // Reads through a file descriptor
    Fstat => "fstat",
    Fstat64 => "fstat64",
    FstatExtended => "fstat_extended",
    Fstat64Extended => "fstat64_extended",
    Fgetattrlist => "fgetattrlist",
    Fgetxattr => "fgetxattr",
    Flistxattr => "flistxattr",
    Fpathconf => "fpathconf",
    Getdirentries => "getdirentries",
    Getdirentries64 => "getdirentries64",
    Getdirentriesattr => "getdirentriesattr",
    Getattrlistbulk => "getattrlistbulk",
    Getdents => "getdents",
    Getdents64 => "getdents64",
    // Mutating metadata
    Chmod => "chmod",
    ChmodExtended => "chmod_extended",
    Fchmodat => "fchmodat",
    Chown => "chown",
    Lchown => "lchown",
    Fchownat => "fchownat",
    Chflags => "chflags",
    Utimes => "utimes",
    Utime => "utime",
    Utimensat => "utimensat",
    Futimesat => "futimesat",
    Setattrlist => "setattrlist",
    Setxattr => "setxattr",
    Lsetxattr => "lsetxattr",
    Removexattr => "removexattr",
    Lremovexattr => "lremovexattr",
    Truncate => "truncate",
    // Mutating metadata through a file descriptor
    Fchmod => "fchmod",
    FchmodExtended => "fchmod_extended",
    Fchown => "fchown",
    Fchflags => "fchflags",
    Flock => "flock",
    Fsetxattr => "fsetxattr",
    Fremovexattr => "fremovexattr",
    Fsetattrlist => "fsetattrlist",
    Futimes => "futimes",
    // Open family
    Open => "open",
    OpenNocancel => "open_nocancel",
    OpenExtended => "open_extended",
    OpenDprotectedNp => "open_dprotected_np",
    GuardedOpenNp => "guarded_open_np",
    GuardedOpenDprotectedNp => "guarded_open_dprotected_np",
    Openat => "openat",
    OpenatNocancel => "openat_nocancel",
    Creat => "creat",
    // Creation
    Mkdir => "mkdir",
    MkdirExtended => "mkdir_extended",
    Mkdirat => "mkdirat",
    Mkfifo => "mkfifo",
    MkfifoExtended => "mkfifo_extended",
    Mknod => "mknod",
    Mknodat => "mknodat",
    Symlink => "symlink",
    Symlinkat => "symlinkat",
    // Links, deletion, renames
    Link => "link",
    Linkat => "linkat",
    Unlink => "unlink",
    Unlinkat => "unlinkat",
    Rmdir => "rmdir",
    Rename => "rename",
    Renameat => "renameat",
    Renameat2 => "renameat2",
    RenameatxNp => "renameatx_np",
    Exchangedata => "exchangedata",
    // Working directories
    Chdir => "chdir",
    Fchdir => "fchdir",
    PthreadChdir => "pthread_chdir",
    PthreadFchdir => "pthread_fchdir",
    // File descriptor table
    Dup => "dup",
    Dup2 => "dup2",
    Dup3 => "dup3",
    Fcntl => "fcntl",
    FcntlNocancel => "fcntl_nocancel",
    Close => "close",
    CloseNocancel => "close_nocancel",
    GuardedCloseNp => "guarded_close_np",
    // Processes
    Fork => "fork",
    Vfork => "vfork",
    Execve => "execve",
    Execveat => "execveat",
    PosixSpawn => "posix_spawn",
    // Path syscalls the tracer cannot attribute
    AccessExtended => "access_extended",
    Chroot => "chroot",
    Copyfile => "copyfile",
    Delete => "delete",
    Undelete => "undelete",
    Searchfs => "searchfs",
    Fhopen => "fhopen",
    Fsgetpath => "fsgetpath",
    OpenbyidNp => "openbyid_np",
    OpenByHandleAt => "open_by_handle_at",
}

/// BSD syscall numbers of the Darwin kernel
const DARWIN: &[(u32, Syscall)] = &[
    (2, Syscall::Fork),
    (5, Syscall::Open),
    (6, Syscall::Close),
    (9, Syscall::Link),
    (10, Syscall::Unlink),
    (12, Syscall::Chdir),
    (13, Syscall::Fchdir),
    (14, Syscall::Mknod),
    (15, Syscall::Chmod),
    (16, Syscall::Chown),
    (33, Syscall::Access),
    (34, Syscall::Chflags),
    (35, Syscall::Fchflags),
    (41, Syscall::Dup),
    (57, Syscall::Symlink),
    (58, Syscall::Readlink),
    (59, Syscall::Execve),
    (61, Syscall::Chroot),
    (66, Syscall::Vfork),
    (90, Syscall::Dup2),
    (92, Syscall::Fcntl),
    (123, Syscall::Fchown),
    (124, Syscall::Fchmod),
    (128, Syscall::Rename),
    (131, Syscall::Flock),
    (132, Syscall::Mkfifo),
    (136, Syscall::Mkdir),
    (137, Syscall::Rmdir),
    (138, Syscall::Utimes),
    (139, Syscall::Futimes),
    (188, Syscall::Stat),
    (189, Syscall::Fstat),
    (190, Syscall::Lstat),
    (191, Syscall::Pathconf),
    (192, Syscall::Fpathconf),
    (196, Syscall::Getdirentries),
    (200, Syscall::Truncate),
    (205, Syscall::Undelete),
    (216, Syscall::OpenDprotectedNp),
    (220, Syscall::Getattrlist),
    (221, Syscall::Setattrlist),
    (222, Syscall::Getdirentriesattr),
    (223, Syscall::Exchangedata),
    (225, Syscall::Searchfs),
    (226, Syscall::Delete),
    (227, Syscall::Copyfile),
    (228, Syscall::Fgetattrlist),
    (229, Syscall::Fsetattrlist),
    (234, Syscall::Getxattr),
    (235, Syscall::Fgetxattr),
    (236, Syscall::Setxattr),
    (237, Syscall::Fsetxattr),
    (238, Syscall::Removexattr),
    (239, Syscall::Fremovexattr),
    (240, Syscall::Listxattr),
    (241, Syscall::Flistxattr),
    (244, Syscall::PosixSpawn),
    (248, Syscall::Fhopen),
    (277, Syscall::OpenExtended),
    (279, Syscall::StatExtended),
    (280, Syscall::LstatExtended),
    (281, Syscall::FstatExtended),
    (282, Syscall::ChmodExtended),
    (283, Syscall::FchmodExtended),
    (284, Syscall::AccessExtended),
    (291, Syscall::MkfifoExtended),
    (292, Syscall::MkdirExtended),
    (338, Syscall::Stat64),
    (339, Syscall::Fstat64),
    (340, Syscall::Lstat64),
    (341, Syscall::Stat64Extended),
    (342, Syscall::Lstat64Extended),
    (343, Syscall::Fstat64Extended),
    (344, Syscall::Getdirentries64),
    (348, Syscall::PthreadChdir),
    (349, Syscall::PthreadFchdir),
    (364, Syscall::Lchown),
    (398, Syscall::OpenNocancel),
    (399, Syscall::CloseNocancel),
    (406, Syscall::FcntlNocancel),
    (427, Syscall::Fsgetpath),
    (441, Syscall::GuardedOpenNp),
    (442, Syscall::GuardedCloseNp),
    (461, Syscall::Getattrlistbulk),
    (463, Syscall::Openat),
    (464, Syscall::OpenatNocancel),
    (465, Syscall::Renameat),
    (466, Syscall::Faccessat),
    (467, Syscall::Fchmodat),
    (468, Syscall::Fchownat),
    (469, Syscall::Fstatat),
    (470, Syscall::Fstatat64),
    (471, Syscall::Linkat),
    (472, Syscall::Unlinkat),
    (473, Syscall::Readlinkat),
    (474, Syscall::Symlinkat),
    (475, Syscall::Mkdirat),
    (476, Syscall::Getattrlistat),
    (479, Syscall::OpenbyidNp),
    (484, Syscall::GuardedOpenDprotectedNp),
    (488, Syscall::RenameatxNp),
];

/// Linux x86_64 syscall numbers
const LINUX_X86_64: &[(u32, Syscall)] = &[
    (2, Syscall::Open),
    (3, Syscall::Close),
    (4, Syscall::Stat),
    (5, Syscall::Fstat),
    (6, Syscall::Lstat),
    (21, Syscall::Access),
    (32, Syscall::Dup),
    (33, Syscall::Dup2),
    (57, Syscall::Fork),
    (58, Syscall::Vfork),
    (59, Syscall::Execve),
    (72, Syscall::Fcntl),
    (73, Syscall::Flock),
    (76, Syscall::Truncate),
    (78, Syscall::Getdents),
    (80, Syscall::Chdir),
    (81, Syscall::Fchdir),
    (82, Syscall::Rename),
    (83, Syscall::Mkdir),
    (84, Syscall::Rmdir),
    (85, Syscall::Creat),
    (86, Syscall::Link),
    (87, Syscall::Unlink),
    (88, Syscall::Symlink),
    (89, Syscall::Readlink),
    (90, Syscall::Chmod),
    (91, Syscall::Fchmod),
    (92, Syscall::Chown),
    (93, Syscall::Fchown),
    (94, Syscall::Lchown),
    (132, Syscall::Utime),
    (133, Syscall::Mknod),
    (161, Syscall::Chroot),
    (188, Syscall::Setxattr),
    (189, Syscall::Lsetxattr),
    (190, Syscall::Fsetxattr),
    (191, Syscall::Getxattr),
    (192, Syscall::Lgetxattr),
    (193, Syscall::Fgetxattr),
    (194, Syscall::Listxattr),
    (195, Syscall::Llistxattr),
    (196, Syscall::Flistxattr),
    (197, Syscall::Removexattr),
    (198, Syscall::Lremovexattr),
    (199, Syscall::Fremovexattr),
    (217, Syscall::Getdents64),
    (235, Syscall::Utimes),
    (257, Syscall::Openat),
    (258, Syscall::Mkdirat),
    (259, Syscall::Mknodat),
    (260, Syscall::Fchownat),
    (261, Syscall::Futimesat),
    (262, Syscall::Newfstatat),
    (263, Syscall::Unlinkat),
    (264, Syscall::Renameat),
    (265, Syscall::Linkat),
    (266, Syscall::Symlinkat),
    (267, Syscall::Readlinkat),
    (268, Syscall::Fchmodat),
    (269, Syscall::Faccessat),
    (280, Syscall::Utimensat),
    (292, Syscall::Dup3),
    (304, Syscall::OpenByHandleAt),
    (316, Syscall::Renameat2),
    (322, Syscall::Execveat),
    (332, Syscall::Statx),
    (439, Syscall::Faccessat2),
];

/// Flag and sentinel values whose encoding differs between kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiConstants {
    pub at_fdcwd: i32,
    pub o_accmode: u64,
    pub o_wronly: u64,
    pub o_rdwr: u64,
    pub o_creat: u64,
    pub o_trunc: u64,
    pub o_excl: u64,
    pub o_cloexec: u64,
    pub f_dupfd: u64,
    pub f_setfd: u64,
    pub f_dupfd_cloexec: u64,
    pub fd_cloexec: u64,
    /// `RENAME_EXCHANGE` (Linux renameat2) / `RENAME_SWAP` (Darwin renameatx_np)
    pub rename_exchange: u64,
}

const DARWIN_CONSTANTS: AbiConstants = AbiConstants {
    at_fdcwd: -2,
    o_accmode: 0x3,
    o_wronly: 0x1,
    o_rdwr: 0x2,
    o_creat: 0x200,
    o_trunc: 0x400,
    o_excl: 0x800,
    o_cloexec: 0x0100_0000,
    f_dupfd: 0,
    f_setfd: 2,
    f_dupfd_cloexec: 67,
    fd_cloexec: 1,
    rename_exchange: 0x2,
};

const LINUX_CONSTANTS: AbiConstants = AbiConstants {
    at_fdcwd: -100,
    o_accmode: 0o3,
    o_wronly: 0o1,
    o_rdwr: 0o2,
    o_creat: 0o100,
    o_trunc: 0o1000,
    o_excl: 0o200,
    o_cloexec: 0o2000000,
    f_dupfd: 0,
    f_setfd: 2,
    f_dupfd_cloexec: 1030,
    fd_cloexec: 1,
    rename_exchange: 0x2,
};

/// Syscall numbering convention of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum Abi {
    /// Darwin BSD syscalls (kdebug probes)
    #[serde(rename = "darwin")]
    #[value(name = "darwin")]
    Darwin,
    /// Linux on x86_64 (ptrace probe)
    #[serde(rename = "linux-x86_64")]
    #[value(name = "linux-x86_64")]
    LinuxX86_64,
}

impl Abi {
    /// ABI of the machine this binary runs on, if a probe exists for it
    pub fn host() -> Option<Abi> {
        if cfg!(target_os = "macos") {
            Some(Abi::Darwin)
        } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            Some(Abi::LinuxX86_64)
        } else {
            None
        }
    }

    fn table(self) -> &'static [(u32, Syscall)] {
        match self {
            Abi::Darwin => DARWIN,
            Abi::LinuxX86_64 => LINUX_X86_64,
        }
    }

    fn index(self) -> &'static FnvHashMap<u32, Syscall> {
        static DARWIN_INDEX: OnceLock<FnvHashMap<u32, Syscall>> = OnceLock::new();
        static LINUX_INDEX: OnceLock<FnvHashMap<u32, Syscall>> = OnceLock::new();
        let cell = match self {
            Abi::Darwin => &DARWIN_INDEX,
            Abi::LinuxX86_64 => &LINUX_INDEX,
        };
        cell.get_or_init(|| self.table().iter().copied().collect())
    }

    /// Resolve a raw syscall number. Returns `None` for syscalls that do not
    /// touch paths or that this tracer does not know yet.
    pub fn syscall(self, number: u32) -> Option<Syscall> {
        self.index().get(&number).copied()
    }

    /// Reverse lookup, mostly useful for building records by hand
    pub fn number(self, syscall: Syscall) -> Option<u32> {
        self.table()
            .iter()
            .find(|(_, s)| *s == syscall)
            .map(|(number, _)| *number)
    }

    pub fn constants(self) -> &'static AbiConstants {
        match self {
            Abi::Darwin => &DARWIN_CONSTANTS,
            Abi::LinuxX86_64 => &LINUX_CONSTANTS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Abi::Darwin => "darwin",
            Abi::LinuxX86_64 => "linux-x86_64",
        }
    }
}
