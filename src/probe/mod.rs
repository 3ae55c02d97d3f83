//! Probe sources
//!
//! A probe watches the traced command and sends [`ProbeMessage`]s down a
//! crossbeam channel to the session. Records may be produced by several
//! threads; ordering is restored by the session from their sequence numbers.
//!
//! - [`ptrace`]: live tracing on Linux x86_64
//! - [`capture`]: recording a record stream to a JSON-lines file and playing
//!   it back

pub mod capture;
pub mod ptrace;

use crate::record::ProbeRecord;
use thiserror::Error;

/// What travels from a probe to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeMessage {
    Record(ProbeRecord),
    /// The traced tree is gone. `code` is the exit status of the root
    /// process, or 128 plus the signal number that killed it.
    Exited { code: i32 },
}

/// Failure to attach to or launch the traced command. Anything that happens
/// after attachment degrades the trace instead of failing it.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no probe available on this platform ({0})")]
    Unsupported(&'static str),

    #[error("failed to launch traced command: {0}")]
    Launch(String),

    #[error("ptrace setup failed: {0}")]
    Attach(#[from] nix::Error),

    #[error("failed to start probe thread: {0}")]
    Thread(#[from] std::io::Error),
}
