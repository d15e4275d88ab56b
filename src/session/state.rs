use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::log::MemoryLog;

/// Lifecycle of the single benchmark session.
///
/// `Idle → Running → {Complete, Error} → Running → …`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

impl SessionStatus {
    /// Complete and Error are terminal for a run, but never for the session:
    /// a new `start` is always allowed from them.
    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Complete => "complete",
            SessionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The benchmark exited on its own.
    Exited,
    /// The operator stopped the run.
    Stopped,
    /// The operator declined to continue after a failed connectivity check.
    Declined,
}

/// Outcome of a completed run, present only after `Complete`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub outcome: RunOutcome,
    /// `None` when the benchmark was never launched or could not be reaped.
    pub exit_code: Option<u32>,
    /// Framed lines emitted during the run.
    pub line_count: usize,
    /// Raw output log, when the benchmark was launched.
    pub log_file: Option<PathBuf>,
    pub started_at: DateTime<Local>,
    pub duration_ms: u64,
}

impl RunResult {
    pub(crate) fn without_child(outcome: RunOutcome, started_at: DateTime<Local>) -> Self {
        Self {
            outcome,
            exit_code: None,
            line_count: 0,
            log_file: None,
            started_at,
            duration_ms: 0,
        }
    }
}

/// Consistent point-in-time copy of the session, for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub log: Vec<String>,
    pub result: Option<RunResult>,
    pub waiting_for_input: bool,
}

/// Mutable session fields, always accessed under the controller's mutex.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub status: SessionStatus,
    pub log: MemoryLog,
    pub result: Option<RunResult>,
    pub stop_requested: bool,
}

impl SessionState {
    pub fn new(max_log_lines: usize) -> Self {
        Self {
            status: SessionStatus::Idle,
            log: MemoryLog::new(max_log_lines),
            result: None,
            stop_requested: false,
        }
    }

    /// Move to Running for a fresh run, clearing the previous run's output.
    pub fn begin_run(&mut self) {
        self.status = SessionStatus::Running;
        self.log.clear();
        self.result = None;
        self.stop_requested = false;
    }

    /// Leave Running. Only the worker calls this.
    pub fn end_run(&mut self, status: SessionStatus, result: Option<RunResult>) {
        debug_assert!(status.is_finished());
        self.status = status;
        self.result = match status {
            SessionStatus::Complete => result,
            _ => None,
        };
        self.stop_requested = false;
    }
}
