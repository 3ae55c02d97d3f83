// Helpers for building synthetic probe streams in integration tests

#![allow(dead_code)]

use shk_trace::clock::SequenceClock;
use shk_trace::probe::ProbeMessage;
use shk_trace::record::{Outcome, Pid, ProbeRecord, RecordKind, Tid};
use shk_trace::session::{TraceReport, TraceSession};
use shk_trace::syscalls::{Abi, Syscall};

/// A probe stream written by hand, one record per call
pub struct Stream {
    abi: Abi,
    clock: SequenceClock,
    records: Vec<ProbeRecord>,
    exit_code: Option<i32>,
}

impl Stream {
    /// Start a stream whose root process `root` runs in `cwd`
    pub fn new(abi: Abi, root: Pid, cwd: &str) -> Self {
        let mut stream = Self {
            abi,
            clock: SequenceClock::new(),
            records: Vec::new(),
            exit_code: None,
        };
        stream.lifecycle(
            root,
            root as Tid,
            RecordKind::ProcessStart {
                parent: None,
                cwd: Some(cwd.to_string()),
            },
        );
        stream
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// `AT_FDCWD` as the probe would report it in an argument register
    pub fn at_fdcwd(&self) -> u64 {
        self.abi.constants().at_fdcwd as u32 as u64
    }

    pub fn call(
        &mut self,
        pid: Pid,
        tid: Tid,
        syscall: Syscall,
        args: &[u64],
        paths: &[&str],
        ret: i64,
    ) -> &mut Self {
        let number = self
            .abi
            .number(syscall)
            .unwrap_or_else(|| panic!("{:?} has no number on {}", syscall, self.abi.name()));
        let sequence = self.clock.tick();
        self.records.push(ProbeRecord::syscall(
            sequence,
            pid,
            tid,
            number,
            args,
            paths,
            Outcome::from_raw(ret),
        ));
        self
    }

    /// Single-threaded shorthand for `call`
    pub fn sys(&mut self, pid: Pid, syscall: Syscall, args: &[u64], paths: &[&str], ret: i64) -> &mut Self {
        self.call(pid, pid as Tid, syscall, args, paths, ret)
    }

    /// `parent` forks `child`: the parent's fork returns, then the child appears
    pub fn fork(&mut self, parent: Pid, child: Pid) -> &mut Self {
        self.sys(parent, Syscall::Fork, &[], &[], child as i64);
        self.lifecycle(
            child,
            child as Tid,
            RecordKind::ProcessStart {
                parent: Some(parent),
                cwd: None,
            },
        )
    }

    pub fn thread(&mut self, pid: Pid, tid: Tid, parent_tid: Tid) -> &mut Self {
        self.lifecycle(
            pid,
            tid,
            RecordKind::ThreadStart {
                parent_pid: pid,
                parent_tid,
            },
        )
    }

    pub fn exit(&mut self, pid: Pid, code: i32) -> &mut Self {
        self.lifecycle(pid, pid as Tid, RecordKind::ProcessExit { code: Some(code) })
    }

    /// The traced root exits with `code`
    pub fn finish_with(&mut self, code: i32) -> &mut Self {
        self.exit_code = Some(code);
        self
    }

    fn lifecycle(&mut self, pid: Pid, tid: Tid, kind: RecordKind) -> &mut Self {
        let sequence = self.clock.tick();
        self.records.push(ProbeRecord::new(sequence, pid, tid, kind));
        self
    }

    pub fn records(&self) -> &[ProbeRecord] {
        &self.records
    }

    /// Messages in stream order, followed by the exit notification
    pub fn messages(&self) -> Vec<ProbeMessage> {
        let mut messages: Vec<_> = self.records.iter().cloned().map(ProbeMessage::Record).collect();
        if let Some(code) = self.exit_code {
            messages.push(ProbeMessage::Exited { code });
        }
        messages
    }

    /// Push every record into a fresh session and finish it
    pub fn run(&self) -> TraceReport {
        let mut session = TraceSession::new(self.abi);
        for record in &self.records {
            session.push(record.clone());
        }
        session.set_exit_code(self.exit_code);
        session.finish()
    }
}

/// The `<kind> <path>` lines a report would be written as
pub fn lines(report: &TraceReport) -> Vec<String> {
    report.events.iter().map(|event| event.to_string()).collect()
}
