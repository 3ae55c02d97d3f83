//! shk-trace - syscall tracer that reports file system dependencies
//!
//! The library turns a stream of completed syscalls from a traced command
//! and all of its descendants into a flat, chronological log of the paths
//! the command read, wrote, created and deleted.
//!
//! ```text
//! probe ──records──▶ session ──▶ classifier ⇄ resolution store
//!                                   │
//!                                raw events ──▶ reducer ──▶ output
//! ```

pub mod classifier;
pub mod cli;
pub mod clock;
pub mod event;
pub mod output;
pub mod probe;
pub mod record;
pub mod reducer;
pub mod resolution;
pub mod session;
pub mod stats;
pub mod syscalls;
