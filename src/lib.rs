//! Supervise an interactive benchmark attached to a pseudo-terminal.
//!
//! The [`session::SessionController`] is the entry point: it starts the
//! benchmark on a worker thread, streams framed output lines to observers,
//! routes operator input, and stops the run on request.

pub mod bridge;
pub mod config;
pub mod error;
pub mod framer;
pub mod input;
pub mod log;
pub mod paths;
pub mod probe;
pub mod session;

pub use error::{BridgeError, SessionError};
pub use session::{SessionConfig, SessionController, SessionSnapshot, SessionStatus};
