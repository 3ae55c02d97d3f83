//! Syscall statistics for `--summary` mode

use std::collections::HashMap;

/// Statistics for a single syscall
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallStats {
    /// Number of completed calls seen
    pub count: u64,
    /// Number of calls that failed
    pub errors: u64,
    /// Raw events the calls produced before reduction
    pub events: u64,
}

/// Totals over all syscalls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatTotals {
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_events: u64,
}

/// Tracks per-syscall counts for one trace session
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    stats: HashMap<String, SyscallStats>,
    /// Records with a syscall number the classifier does not know
    pub unclassified: u64,
    /// Records released from the reorder buffer ahead of a missing sequence
    /// number
    pub forced_releases: u64,
    /// Records that arrived after cancellation and were dropped
    pub dropped: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed syscall
    pub fn record(&mut self, syscall_name: &str, failed: bool, events: usize) {
        let entry = self.stats.entry(syscall_name.to_string()).or_default();
        entry.count += 1;
        entry.events += events as u64;
        if failed {
            entry.errors += 1;
        }
    }

    pub fn get(&self, syscall_name: &str) -> Option<&SyscallStats> {
        self.stats.get(syscall_name)
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn totals(&self) -> StatTotals {
        self.stats.values().fold(StatTotals::default(), |acc, s| StatTotals {
            total_calls: acc.total_calls + s.count,
            total_errors: acc.total_errors + s.errors,
            total_events: acc.total_events + s.events,
        })
    }

    /// Print a strace-style summary table to stderr
    pub fn print_summary(&self) {
        if self.stats.is_empty() {
            eprintln!("No syscalls traced.");
            return;
        }

        let totals = self.totals();

        // Sort by call count (descending), then by name
        let mut sorted: Vec<_> = self.stats.iter().collect();
        sorted.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

        eprintln!("% calls     calls    errors    events syscall");
        eprintln!("------- --------- --------- --------- ----------------");

        for (name, stats) in sorted {
            let percent = if totals.total_calls > 0 {
                (stats.count as f64 / totals.total_calls as f64) * 100.0
            } else {
                0.0
            };

            eprintln!(
                "{:7.2} {:>9} {:>9} {:>9} {}",
                percent,
                stats.count,
                if stats.errors > 0 {
                    stats.errors.to_string()
                } else {
                    String::new()
                },
                stats.events,
                name
            );
        }

        eprintln!("------- --------- --------- --------- ----------------");
        eprintln!(
            " 100.00 {:>9} {:>9} {:>9} total",
            totals.total_calls, totals.total_errors, totals.total_events
        );

        if self.unclassified > 0 || self.forced_releases > 0 || self.dropped > 0 {
            eprintln!(
                "unclassified: {}  out-of-order releases: {}  dropped after cancel: {}",
                self.unclassified, self.forced_releases, self.dropped
            );
        }
    }
}
