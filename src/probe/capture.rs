//! Capture files
//!
//! A capture is the probe record stream of one trace, stored as JSON lines:
//!
//! ```text
//! {"line":"header","abi":"linux-x86_64","root_pid":4242}
//! {"line":"record","sequence":0,"pid":4242,"tid":4242,"type":"process_start",...}
//! ...
//! {"line":"trailer","exit_code":0}
//! ```
//!
//! Replaying a capture runs the same classification as the live trace did,
//! on any host. That makes captures the fixture format for scenario tests and
//! the way to look at a trace taken on a machine with another ABI.

use super::ProbeMessage;
use crate::record::{Pid, ProbeRecord};
use crate::syscalls::Abi;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: malformed capture line: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode capture record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}: capture does not start with a header line")]
    MissingHeader(PathBuf),
}

/// First line of a capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub abi: Abi,
    pub root_pid: Pid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "line", rename_all = "snake_case")]
enum CaptureLine {
    Header(CaptureHeader),
    Record(ProbeRecord),
    Trailer {
        #[serde(default)]
        exit_code: Option<i32>,
    },
}

/// Streams records into a capture file
pub struct CaptureWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl CaptureWriter {
    pub fn create(path: impl AsRef<Path>, header: CaptureHeader) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| CaptureError::Io {
            path: path.clone(),
            source,
        })?;
        let mut writer = Self {
            path,
            out: BufWriter::new(file),
        };
        writer.write_line(&CaptureLine::Header(header))?;
        Ok(writer)
    }

    fn write_line(&mut self, line: &CaptureLine) -> Result<(), CaptureError> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n").map_err(|source| CaptureError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn write_record(&mut self, record: &ProbeRecord) -> Result<(), CaptureError> {
        // The enum owns its payload; records are small enough to clone
        self.write_line(&CaptureLine::Record(record.clone()))
    }

    /// Write the trailer and flush
    pub fn finish(mut self, exit_code: Option<i32>) -> Result<(), CaptureError> {
        self.write_line(&CaptureLine::Trailer { exit_code })?;
        self.out.flush().map_err(|source| CaptureError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// A capture read back into memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub header: CaptureHeader,
    pub records: Vec<ProbeRecord>,
    /// `None` when the capture has no trailer, e.g. the tracer was killed
    pub exit_code: Option<i32>,
}

impl Capture {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(BufReader::new(file), path)
    }

    /// Parse a capture from any line source. `origin` is only used in error
    /// messages.
    pub fn from_reader<R: BufRead>(reader: R, origin: &Path) -> Result<Self, CaptureError> {
        let mut header = None;
        let mut records = Vec::new();
        let mut exit_code = None;

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| CaptureError::Io {
                path: origin.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: CaptureLine =
                serde_json::from_str(&line).map_err(|source| CaptureError::Parse {
                    path: origin.to_path_buf(),
                    line: index + 1,
                    source,
                })?;
            match (parsed, header.is_some()) {
                (CaptureLine::Header(h), false) => header = Some(h),
                (_, false) => return Err(CaptureError::MissingHeader(origin.to_path_buf())),
                (CaptureLine::Header(_), true) => {
                    tracing::warn!(line = index + 1, "ignoring repeated capture header")
                }
                (CaptureLine::Record(record), true) => records.push(record),
                (CaptureLine::Trailer { exit_code: code }, true) => exit_code = code,
            }
        }

        let header = header.ok_or_else(|| CaptureError::MissingHeader(origin.to_path_buf()))?;
        Ok(Self {
            header,
            records,
            exit_code,
        })
    }

    /// The capture as the message stream a live probe would have sent
    pub fn into_messages(self) -> impl Iterator<Item = ProbeMessage> {
        let exit = self.exit_code.map(|code| ProbeMessage::Exited { code });
        self.records
            .into_iter()
            .map(ProbeMessage::Record)
            .chain(exit)
    }
}
