//! Path-level events produced by the classifier
//!
//! Every syscall the traced command makes is reduced to zero or more of four
//! event kinds attributed to an absolute path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a syscall did to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The program obtained information about the path: contents, metadata,
    /// or merely whether it exists.
    Read,
    /// The program modified the path but may have left parts of its previous
    /// contents in place.
    Write,
    /// The program created the path or entirely overwrote its contents.
    Create,
    /// The program removed the path.
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Read => "read",
            EventKind::Write => "write",
            EventKind::Create => "create",
            EventKind::Delete => "delete",
        }
    }

    /// Whether the event lets the program observe the path
    pub fn is_observation(self) -> bool {
        matches!(self, EventKind::Read | EventKind::Write)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by the classifier for a single syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub path: String,
    /// Sequence number of the syscall record that produced the event
    pub sequence: u64,
}

impl RawEvent {
    pub fn new(kind: EventKind, path: impl Into<String>, sequence: u64) -> Self {
        Self {
            kind,
            path: path.into(),
            sequence,
        }
    }
}

/// Event that survived reduction and is reported to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalEvent {
    pub kind: EventKind,
    pub path: String,
}

impl FinalEvent {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

impl From<RawEvent> for FinalEvent {
    fn from(event: RawEvent) -> Self {
        Self {
            kind: event.kind,
            path: event.path,
        }
    }
}

impl fmt::Display for FinalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}
