use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "autotune",
    about = "Run interactive transcoding benchmarks under a supervising terminal",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the benchmark, streaming its output and forwarding stdin to it
    Run {
        /// Print the final session snapshot as JSON (live output goes to stderr)
        #[arg(long)]
        json: bool,
    },

    /// Check connectivity to the configured media server
    Probe,

    /// Inspect persisted run logs
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogsCommand {
    /// List run logs, newest first
    List {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Print one run log
    Show {
        /// Log file name (e.g., "run-20240101-120000.log")
        name: String,
    },
}
