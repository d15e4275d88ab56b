//! Errors returned synchronously by the session command interface.

use std::io;

/// Command-interface failures. These are answers to the caller, not faults:
/// a rejected `start` or `stop` never touches the running session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("benchmark already running")]
    AlreadyRunning,
    #[error("benchmark not running")]
    NotRunning,
    #[error("no input provided")]
    MissingInput,
    #[error("failed to start session worker: {0}")]
    Worker(#[source] io::Error),
}

/// Failures raised while attaching the benchmark to a terminal.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to open terminal pair")]
    Pty(#[source] anyhow::Error),
    #[error("spawn failed: {program}")]
    Spawn {
        program: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("terminal I/O failed")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_render_for_callers() {
        assert_eq!(
            SessionError::AlreadyRunning.to_string(),
            "benchmark already running"
        );
        assert_eq!(SessionError::NotRunning.to_string(), "benchmark not running");
        assert_eq!(SessionError::MissingInput.to_string(), "no input provided");
    }

    #[test]
    fn spawn_error_names_the_program() {
        let err = BridgeError::Spawn {
            program: "jellybench".to_string(),
            source: anyhow::anyhow!("No such file or directory"),
        };
        assert_eq!(err.to_string(), "spawn failed: jellybench");
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.starts_with("spawn failed: jellybench: "), "got {chain}");
        assert!(chain.contains("No such file"));
    }
}
