//! Trace file writers
//!
//! The text format is one `<kind> <path>` line per event in chronological
//! order. The JSON format is an array of `{"kind": ..., "path": ...}`.

use crate::event::FinalEvent;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Output format for trace files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `<kind> <path>` lines (default)
    #[default]
    Text,
    /// JSON array for machine parsing
    Json,
}

pub fn write_events<W: Write>(out: &mut W, events: &[FinalEvent], format: OutputFormat) -> io::Result<()> {
    match format {
        OutputFormat::Text => {
            for event in events {
                writeln!(out, "{}", event)?;
            }
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, events)?;
            writeln!(out)?;
        }
    }
    out.flush()
}

/// Write the trace to `path`, replacing any previous file
pub fn write_trace_file(path: &Path, events: &[FinalEvent], format: OutputFormat) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_events(&mut out, events, format)
}
