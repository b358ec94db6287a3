//! Error types for scheduler operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Resource acquisition did not complete before its deadline.
    #[error("timed out after {waited_ms}ms waiting for {requested} units")]
    AcquireTimeout {
        /// Units requested from the pool.
        requested: u64,
        /// Milliseconds spent polling before giving up.
        waited_ms: u128,
    },
    /// The surrounding task was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// An external program exited with a non-zero status.
    #[error("process exited with code {code:?}")]
    ProcessFailed {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// Captured standard output.
        stdout: String,
    },
    /// An external program could not be started.
    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),
    /// The store's write lock could not be acquired.
    #[error("write contention: {0}")]
    WriteContention(String),
    /// A lock file was left behind by a previous run.
    #[error("stale lock file {0}")]
    StaleLock(PathBuf),
    /// Backing store failure with context.
    #[error("store error: {0}")]
    Store(String),
    /// Invalid pool or runner configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Whether this error came from cancellation rather than a failure.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Store(format!("background task failed: {err}"))
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
