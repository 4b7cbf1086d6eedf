//! Error types for finalize orchestration.

use thiserror::Error;

/// Top-level error type for finalize, polling and event streaming.
#[derive(Error, Debug)]
pub enum Error {
    /// The request is not acceptable in the task's current state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    NotFound(String),

    /// Task storage failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// Hosting provider (GitHub CLI) operation failed.
    #[error("hosting provider error: {0}")]
    Hosting(String),

    /// Waiting for CI or merging failed.
    #[error("CI merge failed: {0}")]
    Ci(String),

    /// The phase executor reported a failure.
    #[error("phase execution failed: {0}")]
    Phase(String),

    /// The operation was cancelled before it could finish.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Downstream event delivery failed.
    #[error("event stream error: {0}")]
    Stream(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or parsing failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error represents a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for finalize operations.
pub type Result<T> = std::result::Result<T, Error>;
