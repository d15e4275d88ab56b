//! Terminal bridge: runs the benchmark attached to a pseudo-terminal.
//!
//! The benchmark prompts interactively and line-buffers only when it sees a
//! terminal, so it is spawned on the slave side of a PTY pair. The parent
//! keeps the master: a reader for output, and a writer that is handed to the
//! input router for pass-through.
//!
//! The read loop multiplexes the master against a bounded poll interval so
//! it can notice stop requests and child exit without spinning. Shutdown is
//! escalating (SIGTERM to the process group, grace period, SIGKILL) and runs
//! exactly once, either explicitly via [`TerminalBridge::terminate`] or on
//! drop.

pub mod decode;

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
pub use decode::Utf8Decoder;

/// Write half of the terminal master.
pub type TerminalWriter = Box<dyn Write + Send>;

/// How long to wait for the child to be reaped after its output closed.
const EXIT_SETTLE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// What to run inside the terminal.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// The program to execute (e.g., "jellybench").
    pub program: String,
    /// Arguments to pass to the program.
    pub args: Vec<String>,
    /// Working directory; the current directory when unset.
    pub work_dir: Option<PathBuf>,
    /// Extra environment variables (key, value pairs).
    pub env: Vec<(String, String)>,
}

/// Terminal and read-loop tuning.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    /// Upper bound on how long one poll of the master may block. Smaller
    /// values react faster to prompts and stop requests but wake more often.
    pub poll_interval: Duration,
    /// Maximum bytes taken per read.
    pub chunk_size: usize,
    /// How long the child gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    pub size: PtySize,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            chunk_size: 1024,
            grace_period: Duration::from_secs(3),
            size: PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

/// Why the read loop returned.
#[derive(Debug)]
pub enum LoopEnd {
    /// The far end closed (zero-length read).
    Eof,
    /// The child was reaped and the terminal went quiet.
    ChildExited,
    /// The caller asked to stop.
    Stopped,
    /// Polling or reading failed. On Linux this is also how a closed slave
    /// shows up (EIO), so it is not treated as fatal.
    ReadError(io::Error),
}

/// Owns the PTY master and the child process for one run.
pub struct TerminalBridge {
    master: Option<Box<dyn MasterPty + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    exit_code: Option<u32>,
    settings: TerminalSettings,
    decoder: Utf8Decoder,
}

impl TerminalBridge {
    /// Open a PTY pair and start `spawn.program` on its slave side.
    ///
    /// Returns the bridge (reader + child) and the master's writer.
    pub fn spawn(
        spawn: &SpawnConfig,
        settings: TerminalSettings,
    ) -> Result<(Self, TerminalWriter), BridgeError> {
        let pair = native_pty_system()
            .openpty(settings.size)
            .map_err(BridgeError::Pty)?;

        let work_dir = match &spawn.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let mut cmd = CommandBuilder::new(&spawn.program);
        cmd.args(&spawn.args);
        cmd.cwd(&work_dir);
        for (key, val) in &spawn.env {
            cmd.env(key, val);
        }

        info!(
            program = %spawn.program,
            args = ?spawn.args,
            work_dir = %work_dir.display(),
            "spawning benchmark in PTY"
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|source| BridgeError::Spawn {
                program: spawn.program.clone(),
                source,
            })?;

        // Only the master is used from here on.
        drop(pair.slave);

        // From here on the child is owned by `bridge`, so an early return
        // still tears it down through Drop.
        let mut bridge = Self {
            master: None,
            reader: None,
            child: Some(child),
            exit_code: None,
            settings,
            decoder: Utf8Decoder::new(),
        };

        let reader = pair.master.try_clone_reader().map_err(BridgeError::Pty)?;
        let writer = pair.master.take_writer().map_err(BridgeError::Pty)?;
        bridge.master = Some(pair.master);
        bridge.reader = Some(reader);

        Ok((bridge, writer))
    }

    /// Pump terminal output into `on_chunk` until the child goes away or
    /// `should_stop` returns true.
    ///
    /// Output is decoded lossily; a chunk is never empty. Errors end the
    /// loop and are reported in the returned [`LoopEnd`], never raised.
    pub fn read_loop(
        &mut self,
        should_stop: impl Fn() -> bool,
        mut on_chunk: impl FnMut(&str),
    ) -> LoopEnd {
        let Some(mut reader) = self.reader.take() else {
            return LoopEnd::Eof;
        };
        let fd = self.master_fd();
        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        let mut child_gone = false;

        let end = loop {
            if should_stop() {
                break LoopEnd::Stopped;
            }

            match wait_readable(fd, self.settings.poll_interval) {
                Ok(true) => {}
                Ok(false) => {
                    // A quiet interval after the child was reaped means any
                    // remaining holder of the slave is not ours to wait for.
                    if child_gone {
                        break LoopEnd::ChildExited;
                    }
                    child_gone = self.poll_exit();
                    continue;
                }
                Err(e) => break LoopEnd::ReadError(e),
            }

            match reader.read(&mut buf) {
                Ok(0) => break LoopEnd::Eof,
                Ok(n) => {
                    let text = self.decoder.decode(&buf[..n]);
                    if !text.is_empty() {
                        on_chunk(&text);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("PTY read error (process likely exited): {e}");
                    break LoopEnd::ReadError(e);
                }
            }
        };

        let tail = self.decoder.finish();
        if !tail.is_empty() {
            on_chunk(&tail);
        }

        self.reader = Some(reader);
        end
    }

    /// Wait up to `timeout` for the child to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_exit() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    /// Give a child whose output just closed a moment to be reaped.
    pub fn settle(&mut self) -> bool {
        self.wait_exit(EXIT_SETTLE)
    }

    /// Stop the child if it is still alive, reap it, and close the master.
    ///
    /// Idempotent: only the first call does any work. Returns the child's
    /// exit code when one could be observed.
    pub fn terminate(&mut self) -> Option<u32> {
        if let Some(mut child) = self.child.take() {
            if self.exit_code.is_none() {
                self.exit_code = shut_down(child.as_mut(), self.settings.grace_period);
            }
        }
        self.reader.take();
        self.master.take();
        self.exit_code
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.process_id())
    }

    fn poll_exit(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(code = status.exit_code(), "benchmark process exited");
                self.exit_code = Some(status.exit_code());
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to poll benchmark process");
                false
            }
        }
    }

    #[cfg(unix)]
    fn master_fd(&self) -> Option<std::os::fd::RawFd> {
        self.master.as_ref().and_then(|m| m.as_raw_fd())
    }

    #[cfg(not(unix))]
    fn master_fd(&self) -> Option<i32> {
        None
    }
}

impl Drop for TerminalBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn shut_down(child: &mut (dyn Child + Send + Sync), grace: Duration) -> Option<u32> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status.exit_code());
    }

    debug!(pid = ?child.process_id(), "sending SIGTERM to benchmark");
    send_term(child);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => std::thread::sleep(EXIT_POLL),
            Err(e) => {
                warn!(error = %e, "failed to poll benchmark during shutdown");
                break;
            }
        }
    }

    warn!(
        grace_ms = grace.as_millis() as u64,
        "benchmark still alive after grace period, killing"
    );
    send_kill(child);
    match child.wait() {
        Ok(status) => Some(status.exit_code()),
        Err(e) => {
            warn!(error = %e, "failed to reap benchmark process");
            None
        }
    }
}

/// Signal the child's process group. portable-pty makes the child a session
/// leader, so its pid doubles as the group id.
#[cfg(unix)]
fn signal_group(child: &(dyn Child + Send + Sync), signal: libc::c_int) -> bool {
    let Some(pid) = child
        .process_id()
        .and_then(|pid| libc::pid_t::try_from(pid).ok())
        .filter(|&pid| pid > 0)
    else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    // `pid` is positive, so neither call can target our own process group.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

#[cfg(unix)]
fn send_term(child: &mut (dyn Child + Send + Sync)) {
    if !signal_group(child, libc::SIGTERM) {
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn send_kill(child: &mut (dyn Child + Send + Sync)) {
    if !signal_group(child, libc::SIGKILL) {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut (dyn Child + Send + Sync)) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut (dyn Child + Send + Sync)) {
    let _ = child.kill();
}

/// Block until `fd` is readable (or hung up) or `timeout` passes.
#[cfg(unix)]
fn wait_readable(fd: Option<std::os::fd::RawFd>, timeout: Duration) -> io::Result<bool> {
    let Some(fd) = fd else {
        return Ok(true);
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a live, exclusively borrowed pollfd and the count of
    // 1 matches it; poll(2) only writes its `revents` field.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    // POLLHUP/POLLERR count as ready so the read reports EOF or EIO.
    Ok(rc > 0)
}

#[cfg(not(unix))]
fn wait_readable(_fd: Option<i32>, _timeout: Duration) -> io::Result<bool> {
    Ok(true)
}
