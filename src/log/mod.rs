//! Session output sinks.
//!
//! Output from a run goes two places at once:
//!
//! - [`MemoryLog`]: the framed lines, kept in memory for status polling;
//! - [`RunLog`]: the raw terminal text, appended to one file per run and
//!   flushed after every write so a crash still leaves a readable log.
//!
//! Anything else that wants to observe lines (a terminal printer, tests)
//! implements [`LineSink`] and is injected into the session controller.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

const RUN_LOG_PREFIX: &str = "run-";
const RUN_LOG_EXTENSION: &str = "log";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Anything that accepts framed session lines.
pub trait LineSink: Send + Sync {
    fn append_line(&self, line: &str);
}

/// Ordered in-memory log of framed lines.
///
/// Bounded so a runaway benchmark cannot grow memory without limit; once
/// full, the oldest line is evicted. Not synchronized on its own: the
/// session keeps it inside its state mutex.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl MemoryLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Append-only raw output file for one run.
pub struct RunLog {
    file: File,
    path: PathBuf,
}

impl RunLog {
    /// Create a new timestamped log file under `dir`.
    ///
    /// Creates `dir` if needed. A name already taken (two runs within the
    /// same second) gets a numeric suffix rather than sharing the file.
    pub fn create(dir: &Path, started_at: DateTime<Local>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

        let stem = format!(
            "{RUN_LOG_PREFIX}{}",
            started_at.format("%Y%m%d-%H%M%S")
        );
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.{RUN_LOG_EXTENSION}")
            } else {
                format!("{stem}-{attempt}.{RUN_LOG_EXTENSION}")
            };
            let path = dir.join(name);
            match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "opened run log");
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to open log file: {}", path.display()));
                }
            }
        }
        anyhow::bail!("no free run log name for {stem} in {}", dir.display())
    }

    /// Append raw terminal text and flush it.
    pub fn write(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .context("failed to write run log")?;
        self.file.flush().context("failed to flush run log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A persisted run log, as listed by [`list_run_logs`].
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

/// List run logs in `dir`, newest first.
///
/// A missing directory just has no runs yet.
pub fn list_run_logs(dir: &Path) -> Result<Vec<RunLogEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read log directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_run_log_name(&name) || !path.is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        entries.push(RunLogEntry {
            name,
            path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }

    // Names embed the start time, so name order is start order.
    entries.sort_by(|a, b| b.name.cmp(&a.name));
    Ok(entries)
}

/// Read one run log by file name.
///
/// Only bare names of run logs inside `dir` are accepted, so a caller
/// cannot walk out of the log directory.
pub fn read_run_log(dir: &Path, name: &str) -> Result<String> {
    let is_bare = Path::new(name).file_name().is_some_and(|f| f == name);
    if !is_bare || !is_run_log_name(name) {
        anyhow::bail!("not a run log name: {name}");
    }
    let path = dir.join(name);
    let bytes =
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn is_run_log_name(name: &str) -> bool {
    name.starts_with(RUN_LOG_PREFIX)
        && Path::new(name)
            .extension()
            .is_some_and(|ext| ext == RUN_LOG_EXTENSION)
}
