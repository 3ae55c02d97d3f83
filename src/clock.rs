//! Sequence clock for probe records
//!
//! Every record a probe emits is stamped with a number drawn from one shared
//! clock at the moment the syscall completed. The coordinator orders records
//! by that number, so two records from different threads compare the same
//! way the kernel saw them finish.
//!
//! # Example
//!
//! ```
//! use shk_trace::clock::SequenceClock;
//!
//! static CLOCK: SequenceClock = SequenceClock::new();
//!
//! let first = CLOCK.tick();
//! let second = CLOCK.tick();
//! assert!(first < second);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter shared by all producers of a session
///
/// `tick()` is a single atomic `fetch_add`, so the clock can be shared across
/// probe threads through an `Arc` or a static.
#[derive(Debug, Default)]
pub struct SequenceClock {
    counter: AtomicU64,
}

impl SequenceClock {
    /// Create a clock whose first tick returns 0
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Take the next sequence number
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}
