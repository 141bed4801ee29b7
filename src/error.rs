//! Error types for worker spawning

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for spawn operations
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Errors that can occur while spawning a worker process
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid spawn options: {0}")]
    InvalidOptions(String),

    #[error("privilege resolution failed: {0}")]
    Resolution(String),

    #[error("environment blob decode failed: {0}")]
    Codec(String),

    /// The application's own startup code failed inside the worker. The
    /// message is the one the application produced, carried across the
    /// process boundary unchanged.
    #[error("application failed to start: {message}")]
    ApplicationLoad {
        message: String,
        category: Option<String>,
    },

    /// The worker died without sending a structured report.
    #[error("worker process {pid} died with status {status} before reporting")]
    ChildDied { pid: i32, status: i32 },

    #[error("worker did not report readiness within {0:?}")]
    Timeout(Duration),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl SpawnError {
    /// Distinguishes "the system could not create a worker" from "your
    /// application is broken".
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, SpawnError::ApplicationLoad { .. })
    }
}
