//! Records delivered by a probe source
//!
//! A probe reports one record per completed syscall plus lifecycle
//! notifications for processes and threads. Every record carries a globally
//! comparable sequence number assigned when the syscall completed.

use serde::{Deserialize, Serialize};

/// Process id
pub type Pid = u32;

/// Thread id (kernel thread ids on Darwin do not fit in 32 bits)
pub type Tid = u64;

/// Result of a completed syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { retval: i64 },
    Failure { errno: i32 },
}

impl Outcome {
    /// Decode a raw return register using the kernel convention of returning
    /// `-errno` in the range `-4095..0`
    pub fn from_raw(ret: i64) -> Self {
        if (-4095..0).contains(&ret) {
            Outcome::Failure { errno: (-ret) as i32 }
        } else {
            Outcome::Success { retval: ret }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn retval(&self) -> Option<i64> {
        match self {
            Outcome::Success { retval } => Some(*retval),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { errno } => Some(*errno),
        }
    }
}

/// What a record reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    /// A completed syscall. `number` is in the probe's ABI, `paths` holds the
    /// path strings the kernel consulted, in argument order.
    Syscall {
        number: u32,
        args: Vec<u64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
        outcome: Outcome,
    },
    /// A new process: the traced root when `parent` is `None`, a forked child
    /// otherwise
    ProcessStart {
        parent: Option<Pid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// A new thread inside `pid`, started by `(parent_pid, parent_tid)`
    ThreadStart { parent_pid: Pid, parent_tid: Tid },
    ThreadExit,
    /// The process has exited and been reaped
    ProcessExit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
}

/// One entry of the probe stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub sequence: u64,
    pub pid: Pid,
    pub tid: Tid,
    #[serde(flatten)]
    pub kind: RecordKind,
}

impl ProbeRecord {
    pub fn new(sequence: u64, pid: Pid, tid: Tid, kind: RecordKind) -> Self {
        Self {
            sequence,
            pid,
            tid,
            kind,
        }
    }

    /// Convenience constructor for syscall records
    pub fn syscall(
        sequence: u64,
        pid: Pid,
        tid: Tid,
        number: u32,
        args: &[u64],
        paths: &[&str],
        outcome: Outcome,
    ) -> Self {
        Self::new(
            sequence,
            pid,
            tid,
            RecordKind::Syscall {
                number,
                args: args.to_vec(),
                paths: paths.iter().map(|p| p.to_string()).collect(),
                outcome,
            },
        )
    }
}
