use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::unbounded;
use shk_trace::cli::{Cli, CliError, TraceConfig, TraceSource};
use shk_trace::output;
use shk_trace::probe::capture::{Capture, CaptureHeader, CaptureWriter};
use shk_trace::probe::ptrace::PtraceProbe;
use shk_trace::session::{TraceReport, TraceSession};
use shk_trace::syscalls::Abi;
use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn usage_exit(err: Option<CliError>) -> ! {
    eprint!("{}", Cli::usage());
    if let Some(err) = err {
        eprintln!("shk-trace: {}", err);
    }
    std::process::exit(1);
}

/// Run the command under the ptrace probe
fn trace_command(command: &str, config: &TraceConfig) -> Result<TraceReport> {
    let (tx, rx) = unbounded();
    let probe = PtraceProbe::spawn(command, tx).context("Failed to start tracing")?;
    let killer = probe.killer();

    let mut session = TraceSession::new(Abi::LinuxX86_64);
    if let Some(path) = &config.capture {
        let header = CaptureHeader {
            abi: Abi::LinuxX86_64,
            root_pid: probe.root_pid(),
        };
        match CaptureWriter::create(path, header) {
            Ok(writer) => session.capture_to(writer),
            Err(err) => {
                killer.kill();
                probe.join();
                return Err(err).context("Failed to create capture file");
            }
        }
    }

    session.run(&rx, config.timeout, || killer.kill());
    probe.join();
    Ok(session.finish())
}

/// Classify a stored capture as if it were arriving live
fn replay_capture(path: &Path) -> Result<TraceReport> {
    let capture = Capture::read(path)
        .with_context(|| format!("Failed to read capture {}", path.display()))?;
    tracing::debug!(
        abi = capture.header.abi.name(),
        root_pid = capture.header.root_pid,
        records = capture.records.len(),
        "replaying capture"
    );

    let (tx, rx) = unbounded();
    let mut session = TraceSession::new(capture.header.abi);
    for message in capture.into_messages() {
        tx.send(message).context("Replay channel closed")?;
    }
    drop(tx);

    session.run(&rx, None, || {});
    Ok(session.finish())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    if args.help {
        usage_exit(None);
    }
    let config = match args.into_config() {
        Ok(config) => config,
        Err(CliError::Usage) => usage_exit(None),
        Err(err) => usage_exit(Some(err)),
    };

    // Initialize tracing if --debug flag is set
    init_tracing(config.debug);

    let report = match &config.source {
        TraceSource::Command(command) => trace_command(command, &config)?,
        TraceSource::Replay(path) => replay_capture(path)?,
    };

    for diagnostic in &report.diagnostics {
        eprintln!("shk-trace: warning: {}", diagnostic);
    }
    if let Some(err) = &report.capture_error {
        eprintln!("shk-trace: warning: capture incomplete: {}", err);
    }
    if report.cancelled {
        eprintln!("shk-trace: traced command timed out, trace is partial");
    }

    if config.summary {
        report.stats.print_summary();
    }

    match &config.output {
        Some(path) => output::write_trace_file(path, &report.events, config.format)
            .with_context(|| format!("Failed to write trace to {}", path.display()))?,
        None => output::write_events(&mut io::stdout().lock(), &report.events, config.format)
            .context("Failed to write trace to stdout")?,
    }

    // Exit with traced program's exit code
    std::process::exit(report.exit_code.unwrap_or(1));
}
