//! CLI argument parsing for shk-trace

use crate::output::OutputFormat;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const USAGE: &str = "shk-trace [-h] [-j] [-s] [--debug] [--timeout SECS] [-C CAPTURE] \
                         (-c COMMAND -f FILE | -r CAPTURE [-f FILE])";

#[derive(Parser, Debug)]
#[command(name = "shk-trace")]
#[command(version)]
#[command(about = "Trace which files a command reads, writes, creates and deletes", long_about = None)]
#[command(disable_help_flag = true)]
#[command(override_usage = USAGE)]
#[command(help_template = "usage: {usage}\n\n{about}\n\n{all-args}\n")]
pub struct Cli {
    /// Print usage and exit
    #[arg(short = 'h', long = "help")]
    pub help: bool,

    /// Shell command to trace, run with /bin/sh -c
    #[arg(short = 'c', long = "command", value_name = "COMMAND")]
    pub command: Option<String>,

    /// File to write the trace to (stdout when replaying without -f)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Write JSON instead of `<kind> <path>` lines
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Also record the raw probe stream to CAPTURE
    #[arg(short = 'C', long = "capture", value_name = "CAPTURE")]
    pub capture: Option<PathBuf>,

    /// Classify a previously captured probe stream instead of running a command
    #[arg(short = 'r', long = "replay", value_name = "CAPTURE")]
    pub replay: Option<PathBuf>,

    /// Kill the traced command after SECS seconds and keep the partial trace
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print per-syscall statistics to stderr
    #[arg(short = 's', long = "summary")]
    pub summary: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

/// Where records come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceSource {
    Command(String),
    Replay(PathBuf),
}

/// Validated settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub source: TraceSource,
    /// `None` writes to stdout
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
    pub capture: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub summary: bool,
    pub debug: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CliError {
    /// Nothing to do; print usage only
    #[error("no command or capture given")]
    Usage,

    #[error("-c and -r cannot be combined")]
    CommandAndReplay,

    #[error("-c requires -f FILE")]
    MissingOutput,

    #[error("--capture only applies to a live trace")]
    CaptureDuringReplay,

    #[error("--timeout must be at least 1 second")]
    ZeroTimeout,
}

impl Cli {
    pub fn usage() -> String {
        Cli::command().render_help().to_string()
    }

    pub fn into_config(self) -> Result<TraceConfig, CliError> {
        let source = match (self.command, self.replay) {
            (Some(_), Some(_)) => return Err(CliError::CommandAndReplay),
            (Some(command), None) => {
                if self.file.is_none() {
                    return Err(CliError::MissingOutput);
                }
                TraceSource::Command(command)
            }
            (None, Some(capture)) => {
                if self.capture.is_some() {
                    return Err(CliError::CaptureDuringReplay);
                }
                TraceSource::Replay(capture)
            }
            (None, None) => return Err(CliError::Usage),
        };

        let timeout = match self.timeout {
            Some(0) => return Err(CliError::ZeroTimeout),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(TraceConfig {
            source,
            output: self.file,
            format: if self.json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            capture: self.capture,
            timeout,
            summary: self.summary,
            debug: self.debug,
        })
    }
}
