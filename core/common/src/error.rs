//! Error taxonomy for fieldsync operations.

use thiserror::Error;

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity or edit does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another edit for the same entity is already in flight.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The remote service permanently refused an edit.
    #[error("Rejected by server: {0}")]
    ValidationRejected(String),

    /// Temporary failure that may succeed on retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// A sync session is already running.
    #[error("Sync already in progress")]
    Busy,

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The remote service could not be reached at all.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service answered with an error.
    #[error("Remote service error: {message}")]
    RemoteService { message: String, retriable: bool },

    /// The persistence layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Transient(_) => true,
            Error::RemoteService { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Whether the error should be reported as a failure.
    ///
    /// Cancellation and a busy engine are expected outcomes of cooperative
    /// scheduling, not failures.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Cancelled | Error::Busy)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(err.to_string())
        } else {
            Error::Storage(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
