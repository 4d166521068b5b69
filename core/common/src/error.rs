//! Common error types for Larder.

use thiserror::Error;

/// Top-level error type for Larder sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store failed (quota, corruption, closed handle).
    #[error("Storage fault: {0}")]
    Storage(String),

    /// Backend unreachable, timed out or answered with a server error.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Server state diverged from the version a change was based on.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload rejected as malformed or out of range.
    #[error("Validation rejected: {0}")]
    Validation(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Sync service lifecycle error (not started, already stopped).
    #[error("Sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
