//! Interactive session controller.
//!
//! A [`SessionController`] owns the single benchmark session. Commands
//! (`start`, `stop`, `send_input`, `status`) may arrive from any thread; the
//! run itself happens on a dedicated worker thread that owns the terminal
//! bridge for its whole lifetime.
//!
//! All mutable session fields live in one mutex. Command methods only check
//! and flip flags under that lock and never wait on the worker, so a status
//! poll is answered even while the benchmark is blocked on a prompt.
//!
//! Lock order is state, then the input router's wait slot. Nothing takes the
//! wait slot and then the state lock. Terminal writes hold only the writer's
//! own lock, so a stuck write never stalls `stop` or `status`.

pub mod state;

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::bridge::{LoopEnd, SpawnConfig, TerminalBridge, TerminalSettings};
use crate::error::SessionError;
use crate::framer::FramerSettings;
use crate::input::{Delivery, InputReply, InputRouter};
use crate::log::{LineSink, RunLog};
use crate::probe::ConnectivityCheck;
pub use state::{RunOutcome, RunResult, SessionSnapshot, SessionStatus};
use state::SessionState;

const CONTINUE_PROMPT: &str = "Connection failed. Continue anyway? (y/n)";
const STATUS_POLL: Duration = Duration::from_millis(20);

/// Media server the pre-flight check talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub credential: String,
}

/// Everything a run needs, fixed for the controller's lifetime.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub spawn: SpawnConfig,
    pub terminal: TerminalSettings,
    pub framer: FramerSettings,
    /// Directory for per-run raw output logs.
    pub log_dir: PathBuf,
    /// Capacity of the in-memory line log.
    pub max_log_lines: usize,
    /// `None` when no media server is configured; the pre-flight check then
    /// fails and the operator is asked whether to go on.
    pub endpoint: Option<Endpoint>,
}

impl SessionConfig {
    pub fn new(spawn: SpawnConfig, log_dir: PathBuf) -> Self {
        Self {
            spawn,
            terminal: TerminalSettings::default(),
            framer: FramerSettings::default(),
            log_dir,
            max_log_lines: 50_000,
            endpoint: None,
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    router: InputRouter,
    sinks: Vec<Arc<dyn LineSink>>,
    probe: Option<Arc<dyn ConnectivityCheck>>,
    config: SessionConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Append one line to the session log, then notify sinks outside the
    /// lock.
    fn append(&self, line: String) {
        self.lock().log.push(line.clone());
        self.notify(&line);
    }

    /// A panicking sink loses the line; the worker keeps going.
    fn notify(&self, line: &str) {
        for sink in &self.sinks {
            if panic::catch_unwind(AssertUnwindSafe(|| sink.append_line(line))).is_err() {
                warn!("line sink panicked, line not delivered");
            }
        }
    }

    /// Show `prompt` and block until the operator answers or the session is
    /// stopped.
    fn await_input(&self, prompt: &str) -> InputReply {
        // Register before showing the prompt so an answer sent as soon as it
        // appears is routed to this wait rather than the terminal.
        let pending = self.router.wait_for_reply();
        self.append(prompt.to_string());

        // A stop that landed before the wait was registered found nothing to
        // cancel.
        if self.stop_requested() {
            self.router.cancel_pending();
        }

        let reply = pending.wait();
        if let InputReply::Text(text) = &reply {
            self.append(format!("Received input: {text}"));
        }
        reply
    }
}

/// Handle to the process-wide benchmark session. Cheap to clone; all clones
/// drive the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// `probe` is the pre-flight connectivity check; `None` skips it.
    /// Every appended session line is also passed to each of `sinks`.
    pub fn new(
        config: SessionConfig,
        probe: Option<Arc<dyn ConnectivityCheck>>,
        sinks: Vec<Arc<dyn LineSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::new(config.max_log_lines)),
                router: InputRouter::new(),
                sinks,
                probe,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Begin a new run on a background worker.
    ///
    /// Fails fast with [`SessionError::AlreadyRunning`] instead of queueing.
    /// The previous run's log and result are discarded.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut state = self.shared.lock();
        if state.status == SessionStatus::Running {
            return Err(SessionError::AlreadyRunning);
        }
        state.begin_run();

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("autotune-session".to_string())
            .spawn(move || run_worker(shared));

        match spawned {
            Ok(_) => {
                info!(program = %self.shared.config.spawn.program, "session started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to start session worker");
                state
                    .log
                    .push(format!("Error: failed to start session worker: {e}"));
                state.end_run(SessionStatus::Error, None);
                Err(SessionError::Worker(e))
            }
        }
    }

    /// Ask the worker to end the run.
    ///
    /// Returns immediately; the status changes once the worker has torn the
    /// benchmark down. A pending confirmation prompt is cancelled.
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut state = self.shared.lock();
        if state.status != SessionStatus::Running {
            return Err(SessionError::NotRunning);
        }
        if !state.stop_requested {
            info!("stop requested");
            state.stop_requested = true;
        }
        if self.shared.router.cancel_pending() {
            debug!("cancelled pending confirmation prompt");
        }
        Ok(())
    }

    /// Route operator input to a pending prompt or the benchmark.
    ///
    /// A failed terminal write is recorded in the session log but is not an
    /// error for the caller.
    pub fn send_input(&self, text: Option<&str>) -> Result<(), SessionError> {
        if self.shared.lock().status != SessionStatus::Running {
            return Err(SessionError::NotRunning);
        }
        let text = text.ok_or(SessionError::MissingInput)?;

        match self.shared.router.deliver(text) {
            Delivery::Reply | Delivery::Terminal => {}
            Delivery::NoProcess => debug!("input dropped: no active process to receive input"),
            Delivery::WriteFailed(e) => {
                self.shared.append(format!("Failed to write to pty: {e}"));
            }
        }
        Ok(())
    }

    /// Point-in-time copy of the session.
    pub fn status(&self) -> SessionSnapshot {
        let state = self.shared.lock();
        SessionSnapshot {
            status: state.status,
            log: state.log.snapshot(),
            result: state.result.clone(),
            waiting_for_input: self.shared.router.is_waiting(),
        }
    }

    pub fn is_waiting_for_input(&self) -> bool {
        self.shared.router.is_waiting()
    }

    /// Poll until the session leaves Running or `timeout` passes.
    ///
    /// Returns the final snapshot, or `None` on timeout.
    pub fn wait_while_running(&self, timeout: Duration) -> Option<SessionSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.status();
            if snapshot.status != SessionStatus::Running {
                return Some(snapshot);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(STATUS_POLL);
        }
    }
}

/// Worker entry point. Every exit path, including a panic, ends the run.
fn run_worker(shared: Arc<Shared>) {
    let started_at = Local::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(&shared, started_at)));

    shared.router.cancel_pending();
    shared.router.detach();

    let (status, result, error_line) = match outcome {
        Ok(Ok(result)) => {
            info!(
                outcome = ?result.outcome,
                exit_code = ?result.exit_code,
                lines = result.line_count,
                duration_ms = result.duration_ms,
                "session complete"
            );
            (SessionStatus::Complete, Some(result), None)
        }
        Ok(Err(e)) => {
            error!("session failed: {e:#}");
            (SessionStatus::Error, None, Some(format!("Error: {e:#}")))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "session worker panicked");
            let line = format!("Error: session worker panicked: {message}");
            (SessionStatus::Error, None, Some(line))
        }
    };

    // The run ends before any sink sees the error line.
    {
        let mut state = shared.lock();
        if let Some(line) = &error_line {
            state.log.push(line.clone());
        }
        state.end_run(status, result);
    }
    if let Some(line) = error_line {
        shared.notify(&line);
    }
}

fn execute(shared: &Shared, started_at: DateTime<Local>) -> Result<RunResult> {
    let clock = Instant::now();
    let config = &shared.config;
    let finish_early = |outcome| RunResult {
        duration_ms: elapsed_ms(clock),
        ..RunResult::without_child(outcome, started_at)
    };

    if let Some(outcome) = preflight(shared) {
        return Ok(finish_early(outcome));
    }
    if shared.stop_requested() {
        return Ok(finish_early(RunOutcome::Stopped));
    }

    let mut framer = config
        .framer
        .build()
        .context("invalid prompt pattern")?;
    let (mut bridge, writer) = TerminalBridge::spawn(&config.spawn, config.terminal.clone())?;
    let mut run_log = RunLog::create(&config.log_dir, started_at)?;
    shared.router.attach(writer);

    let mut line_count = 0usize;
    let mut log_write_failed = false;
    let end = bridge.read_loop(
        || shared.stop_requested(),
        |chunk| {
            if let Err(e) = run_log.write(chunk) {
                if !log_write_failed {
                    warn!("run log write failed, continuing without it: {e:#}");
                    log_write_failed = true;
                }
            }
            for line in framer.push(chunk) {
                shared.append(line);
                line_count += 1;
            }
        },
    );

    if config.framer.flush_on_exit {
        if let Some(line) = framer.finish() {
            shared.append(line);
            line_count += 1;
        }
    }
    shared.router.detach();

    let outcome = match end {
        LoopEnd::Stopped => RunOutcome::Stopped,
        LoopEnd::Eof | LoopEnd::ChildExited => {
            bridge.settle();
            RunOutcome::Exited
        }
        LoopEnd::ReadError(e) => {
            debug!(error = %e, "terminal read ended with error");
            bridge.settle();
            RunOutcome::Exited
        }
    };
    let exit_code = bridge.terminate();

    Ok(RunResult {
        outcome,
        exit_code,
        line_count,
        log_file: Some(run_log.path().to_path_buf()),
        started_at,
        duration_ms: elapsed_ms(clock),
    })
}

/// Connectivity pre-flight. Returns an outcome when the run must end without
/// launching the benchmark.
fn preflight(shared: &Shared) -> Option<RunOutcome> {
    let probe = shared.probe.as_ref()?;

    let checked = match &shared.config.endpoint {
        Some(endpoint) => probe.check_connection(&endpoint.url, &endpoint.credential),
        None => Err(anyhow::anyhow!("media server URL is not configured")),
    };
    let err = match checked {
        Ok(summary) => {
            for line in summary {
                info!("{line}");
            }
            return None;
        }
        Err(e) => e,
    };

    warn!("connectivity check failed: {err:#}");
    shared.append(format!("Failed to connect to media server: {err:#}"));

    match shared.await_input(CONTINUE_PROMPT) {
        InputReply::Text(answer) if is_yes(&answer) => None,
        InputReply::Text(_) => {
            info!("operator declined to continue");
            Some(RunOutcome::Declined)
        }
        InputReply::Cancelled => Some(RunOutcome::Stopped),
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
