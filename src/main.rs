mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use autotune::config::{ENV_API_KEY, ENV_SERVER_URL, ProjectConfig};
use autotune::log::{self, LineSink, RunLogEntry};
use autotune::paths;
use autotune::probe::{ConnectivityCheck, HttpProbe};
use autotune::session::{RunOutcome, SessionController, SessionSnapshot, SessionStatus};
use autotune::SessionError;
use cli::{Cli, Command, LogsCommand};

const STATUS_REFRESH: Duration = Duration::from_millis(250);

/// Prints session lines as they are appended. A closed stdout (for example a
/// pipe into `head`) drops lines instead of panicking.
struct ConsoleSink {
    to_stderr: bool,
}

impl LineSink for ConsoleSink {
    fn append_line(&self, line: &str) {
        let _ = if self.to_stderr {
            writeln!(io::stderr().lock(), "{line}")
        } else {
            writeln!(io::stdout().lock(), "{line}")
        };
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .autotune/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Benchmark\n");
    push_kv(&mut output, "program", &config.benchmark.program);
    if config.benchmark.args.is_empty() {
        push_kv(&mut output, "args", "(none)");
    } else {
        push_kv(&mut output, "args", config.benchmark.args.join(", "));
    }
    push_kv(
        &mut output,
        "work_dir",
        config
            .benchmark
            .work_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(current directory)".to_string()),
    );
    output.push('\n');

    output.push_str("Server\n");
    push_kv(
        &mut output,
        "url",
        config.server.url.as_deref().unwrap_or("(not set)"),
    );
    push_kv(
        &mut output,
        "api_key",
        if config.server.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        },
    );
    push_kv(&mut output, "timeout", format!("{}s", config.server.timeout_secs));
    output.push('\n');

    output.push_str("Terminal\n");
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.terminal.poll_interval_millis),
    );
    push_kv(&mut output, "chunk_size", config.terminal.chunk_size);
    push_kv(
        &mut output,
        "grace_period",
        format!("{}ms", config.terminal.grace_period_millis),
    );
    push_kv(
        &mut output,
        "size",
        format!("{}x{}", config.terminal.cols, config.terminal.rows),
    );
    output.push('\n');

    output.push_str("Framer\n");
    let delimiters: Vec<String> = config
        .framer
        .prompt_delimiters
        .iter()
        .map(|c| format!("{c:?}"))
        .collect();
    push_kv(&mut output, "prompt_delimiters", delimiters.join(", "));
    push_kv(
        &mut output,
        "prompt_pattern",
        config.framer.prompt_pattern.as_deref().unwrap_or("(none)"),
    );
    push_kv(&mut output, "flush_on_exit", config.framer.flush_on_exit);
    output.push('\n');

    output.push_str("Log\n");
    push_kv(
        &mut output,
        "dir",
        config
            .log
            .dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| ".autotune/logs".to_string()),
    );
    push_kv(&mut output, "max_lines", config.log.max_lines);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn render_summary(snapshot: &SessionSnapshot) -> String {
    let mut output = String::new();
    output.push_str(&format!("Session {}\n", snapshot.status));
    if let Some(result) = &snapshot.result {
        let outcome = match result.outcome {
            RunOutcome::Exited => "exited",
            RunOutcome::Stopped => "stopped",
            RunOutcome::Declined => "declined",
        };
        push_kv(&mut output, "outcome", outcome);
        push_kv(
            &mut output,
            "exit_code",
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(none)".to_string()),
        );
        push_kv(&mut output, "lines", result.line_count);
        push_kv(
            &mut output,
            "duration",
            format!("{:.1}s", result.duration_ms as f64 / 1000.0),
        );
        if let Some(path) = &result.log_file {
            push_kv(&mut output, "log_file", path.display());
        }
    }
    output
}

fn format_age(modified: Option<SystemTime>) -> String {
    let Some(elapsed) = modified.and_then(|m| m.elapsed().ok()) else {
        return "-".to_string();
    };
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

fn render_log_list(entries: &[RunLogEntry]) -> String {
    if entries.is_empty() {
        return "No run logs yet.\n".to_string();
    }
    let mut output = String::new();
    for entry in entries {
        output.push_str(&format!(
            "{:<32} {:>10}  {}\n",
            entry.name,
            entry.size,
            format_age(entry.modified)
        ));
    }
    output
}

/// Forward stdin lines to the session until it stops running or stdin
/// closes.
fn forward_stdin(session: &SessionController) {
    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        };
        match session.send_input(Some(line.trim_end_matches('\r'))) {
            Ok(()) => {}
            Err(SessionError::NotRunning) => break,
            Err(e) => warn!(error = %e, "input not delivered"),
        }
    }
}

fn run_session(config: &ProjectConfig, project_root: &Path, json: bool) -> Result<()> {
    let session_config = config.session_config(project_root)?;
    let probe: Arc<dyn ConnectivityCheck> = Arc::new(HttpProbe::new(config.server.timeout()));
    let sink: Arc<dyn LineSink> = Arc::new(ConsoleSink { to_stderr: json });
    let session = SessionController::new(session_config, Some(probe), vec![sink]);

    let stopper = session.clone();
    ctrlc::set_handler(move || {
        if stopper.stop().is_ok() {
            eprintln!("stopping benchmark...");
        }
    })
    .context("failed to install Ctrl-C handler")?;

    session.start()?;

    let forwarder = session.clone();
    thread::Builder::new()
        .name("autotune-stdin".to_string())
        .spawn(move || forward_stdin(&forwarder))
        .context("failed to start stdin forwarder")?;

    let snapshot = loop {
        if let Some(snapshot) = session.wait_while_running(STATUS_REFRESH) {
            break snapshot;
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("failed to serialize session")?
        );
    } else {
        print!("{}", render_summary(&snapshot));
    }

    if snapshot.status == SessionStatus::Error {
        anyhow::bail!("benchmark session failed");
    }
    if let Some(result) = &snapshot.result {
        if let (RunOutcome::Exited, Some(code)) = (result.outcome, result.exit_code) {
            if code != 0 {
                anyhow::bail!("benchmark exited with code {code}");
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "autotune=warn",
        0 => "autotune=info",
        1 => "autotune=debug",
        _ => "autotune=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (mut config, config_path) = ProjectConfig::load(&cwd)?;
    config.apply_env();

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .autotune/config.toml found, using defaults"),
        }
    }

    let project_root: PathBuf = config_path
        .as_deref()
        .and_then(paths::project_root_for)
        .unwrap_or_else(|| cwd.clone());

    match cli.command {
        Command::Run { json } => run_session(&config, &project_root, json)?,
        Command::Probe => {
            let endpoint = config.server.endpoint().with_context(|| {
                format!("no media server configured: set [server].url or {ENV_SERVER_URL}")
            })?;
            if endpoint.credential.is_empty() {
                warn!("no API key configured (set [server].api_key or {ENV_API_KEY})");
            }
            let probe = HttpProbe::new(config.server.timeout());
            let lines = probe
                .check_connection(&endpoint.url, &endpoint.credential)
                .with_context(|| format!("failed to connect to {}", endpoint.url))?;
            for line in lines {
                println!("{line}");
            }
        }
        Command::Logs { command } => {
            let log_dir = config.log_dir(&project_root);
            match command {
                LogsCommand::List { json } => {
                    let entries = log::list_run_logs(&log_dir)?;
                    if json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&entries)
                                .context("failed to serialize run logs")?
                        );
                    } else {
                        print!("{}", render_log_list(&entries));
                    }
                }
                LogsCommand::Show { name } => {
                    print!("{}", log::read_run_log(&log_dir, &name)?);
                }
            }
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
