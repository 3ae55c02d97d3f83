//! Event log reduction
//!
//! A file the command creates and later deletes is invisible to anyone
//! looking at the filesystem before and after the command ran, so the pair
//! is dropped from the log. Everything else is kept as it happened.

use crate::event::{EventKind, FinalEvent, RawEvent};
use std::collections::HashMap;

/// Reduce raw classifier output to the reported log
///
/// Events are stably ordered by sequence number first. Then, per path, a
/// run starts at a create. Reads and writes of the path inside the run only
/// see what the command itself wrote, so they join the run. A delete closes
/// the run and cancels every event in it, itself included. Runs that never
/// see a delete are kept untouched, as is everything outside a run.
pub fn reduce(mut events: Vec<RawEvent>) -> Vec<FinalEvent> {
    events.sort_by_key(|e| e.sequence);

    let mut keep = vec![true; events.len()];
    {
        let mut runs: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, event) in events.iter().enumerate() {
            let path = event.path.as_str();
            match event.kind {
                EventKind::Create => runs.entry(path).or_default().push(index),
                EventKind::Read | EventKind::Write => {
                    if let Some(run) = runs.get_mut(path) {
                        run.push(index);
                    }
                }
                EventKind::Delete => {
                    if let Some(run) = runs.remove(path) {
                        for cancelled in run {
                            keep[cancelled] = false;
                        }
                        keep[index] = false;
                    }
                }
            }
        }
    }

    events
        .into_iter()
        .zip(keep)
        .filter_map(|(event, kept)| kept.then(|| FinalEvent::from(event)))
        .collect()
}
