//! Trace session coordinator
//!
//! The session owns every piece of mutable trace state: the resolution store,
//! the classifier and the raw event log. Records come in on one channel in
//! whatever order the probe threads produced them; a [`ReorderBuffer`] puts
//! them back in sequence order before each is classified, so state updates
//! happen exactly in the order the kernel completed the syscalls.

use crate::classifier::{Classifier, Diagnostic};
use crate::event::{FinalEvent, RawEvent};
use crate::probe::capture::{CaptureError, CaptureWriter};
use crate::probe::ProbeMessage;
use crate::record::{ProbeRecord, RecordKind};
use crate::reducer;
use crate::resolution::ResolutionStore;
use crate::stats::SessionStats;
use crate::syscalls::Abi;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Records held back waiting for a smaller sequence number before the
/// lowest one is released anyway
pub const DEFAULT_REORDER_WINDOW: usize = 4096;

/// Heap entry ordered so the smallest sequence number sits on top
#[derive(Debug)]
struct Queued(ProbeRecord);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence == other.0.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.sequence.cmp(&self.0.sequence)
    }
}

/// Restores sequence order of an inbound record stream
///
/// Sequence numbers start at 0 and have no gaps unless a probe lost a record.
/// A record is released once every smaller number has been released. If more
/// than `window` records are waiting the gap is given up on and the lowest
/// waiting record is released.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BinaryHeap<Queued>,
    next: u64,
    window: usize,
    forced: u64,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_WINDOW)
    }
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            pending: BinaryHeap::new(),
            next: 0,
            window: window.max(1),
            forced: 0,
        }
    }

    pub fn push(&mut self, record: ProbeRecord) {
        self.pending.push(Queued(record));
    }

    /// Next record that may be dispatched, if any
    pub fn pop_ready(&mut self) -> Option<ProbeRecord> {
        let lowest = self.pending.peek()?.0.sequence;
        if lowest > self.next {
            if self.pending.len() <= self.window {
                return None;
            }
            warn!(
                expected = self.next,
                released = lowest,
                "sequence gap, releasing out of order"
            );
            self.forced += 1;
        }
        let Queued(record) = self.pending.pop()?;
        self.next = self.next.max(record.sequence + 1);
        Some(record)
    }

    /// Release everything still held, lowest first
    pub fn drain(&mut self) -> Vec<ProbeRecord> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(Queued(record)) = self.pending.pop() {
            self.next = self.next.max(record.sequence + 1);
            out.push(record);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// How many records were released ahead of a missing sequence number
    pub fn forced_releases(&self) -> u64 {
        self.forced
    }
}

/// Everything a finished session produced
#[derive(Debug)]
pub struct TraceReport {
    pub events: Vec<FinalEvent>,
    pub stats: SessionStats,
    pub diagnostics: Vec<Diagnostic>,
    /// Exit status of the traced command, `None` if the probe never said
    pub exit_code: Option<i32>,
    /// Set when the session was cancelled before the command exited
    pub cancelled: bool,
    /// First error hit while writing the capture file, which stops capturing
    /// but not tracing
    pub capture_error: Option<CaptureError>,
}

pub struct TraceSession {
    store: ResolutionStore,
    classifier: Classifier,
    reorder: ReorderBuffer,
    events: Vec<RawEvent>,
    stats: SessionStats,
    capture: Option<CaptureWriter>,
    capture_error: Option<CaptureError>,
    exit_code: Option<i32>,
    cancelled: bool,
}

impl TraceSession {
    pub fn new(abi: Abi) -> Self {
        Self::with_window(abi, DEFAULT_REORDER_WINDOW)
    }

    pub fn with_window(abi: Abi, window: usize) -> Self {
        Self {
            store: ResolutionStore::new(),
            classifier: Classifier::new(abi),
            reorder: ReorderBuffer::new(window),
            events: Vec::new(),
            stats: SessionStats::new(),
            capture: None,
            capture_error: None,
            exit_code: None,
            cancelled: false,
        }
    }

    /// Tee every accepted record into `writer`
    pub fn capture_to(&mut self, writer: CaptureWriter) {
        self.capture = Some(writer);
    }

    pub fn abi(&self) -> Abi {
        self.classifier.abi()
    }

    /// Accept one record. Records arriving after cancellation are dropped.
    pub fn push(&mut self, record: ProbeRecord) {
        if self.cancelled {
            self.stats.dropped += 1;
            return;
        }
        if let Some(writer) = self.capture.as_mut() {
            if let Err(err) = writer.write_record(&record) {
                warn!(error = %err, "capture stopped");
                self.capture = None;
                self.capture_error = Some(err);
            }
        }
        self.reorder.push(record);
        while let Some(ready) = self.reorder.pop_ready() {
            self.dispatch(ready);
        }
    }

    fn dispatch(&mut self, record: ProbeRecord) {
        let events = self.classifier.classify(&mut self.store, &record);
        if let RecordKind::Syscall {
            number, outcome, ..
        } = &record.kind
        {
            match self.classifier.abi().syscall(*number) {
                Some(syscall) => {
                    self.stats
                        .record(syscall.name(), !outcome.is_success(), events.len())
                }
                None => self.stats.unclassified += 1,
            }
        }
        self.events.extend(events);
    }

    /// Stop accepting records. Whatever was accepted is still classified.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            info!(pending = self.reorder.len(), "trace cancelled");
            self.cancelled = true;
        }
    }

    /// Drive the session from a probe channel until the traced tree exits or
    /// every sender is gone
    ///
    /// When `timeout` elapses first the session cancels itself and calls
    /// `kill`, which must make the probe kill the traced tree. The loop then
    /// keeps waiting for the exit notification so the exit status is known.
    pub fn run<F: FnMut()>(
        &mut self,
        rx: &Receiver<ProbeMessage>,
        timeout: Option<Duration>,
        mut kill: F,
    ) {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let message = match deadline {
                Some(deadline) if !self.cancelled => match rx.recv_deadline(deadline) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(?timeout, "traced command timed out, killing it");
                        self.cancel();
                        kill();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                _ => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            match message {
                ProbeMessage::Record(record) => self.push(record),
                ProbeMessage::Exited { code } => {
                    debug!(code, "traced command exited");
                    self.exit_code = Some(code);
                    break;
                }
            }
        }
    }

    /// Set the exit status without a channel, used by replay
    pub fn set_exit_code(&mut self, code: Option<i32>) {
        self.exit_code = code;
    }

    /// Classify what is still buffered and reduce the log
    pub fn finish(mut self) -> TraceReport {
        for record in self.reorder.drain() {
            self.dispatch(record);
        }
        self.stats.forced_releases = self.reorder.forced_releases();

        if let Some(writer) = self.capture.take() {
            if let Err(err) = writer.finish(self.exit_code) {
                warn!(error = %err, "failed to finish capture file");
                self.capture_error.get_or_insert(err);
            }
        }

        debug!(
            raw = self.events.len(),
            processes = self.store.process_count(),
            "reducing event log"
        );
        TraceReport {
            events: reducer::reduce(self.events),
            stats: self.stats,
            diagnostics: self.classifier.take_diagnostics(),
            exit_code: self.exit_code,
            cancelled: self.cancelled,
            capture_error: self.capture_error,
        }
    }
}
