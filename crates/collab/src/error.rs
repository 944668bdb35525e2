//! Error types for the collaboration crate.

use crate::offline::OfflineError;
use thiserror::Error;

/// Result type alias for collaboration operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias for channel and presence store calls.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Failures reported by an operation log or presence store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Backend cannot be reached right now; the caller should retry later.
    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    /// The subscription or channel has been closed.
    #[error("Channel closed")]
    Closed,

    /// The backend refused the write.
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// Payload could not be encoded for the backend.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors that can occur during synchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No active session for the call.
    #[error("Session not initialized")]
    NotInitialized,

    /// Channel or presence store failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Element or operation could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Element payload is not a JSON object or lacks an id.
    #[error("Invalid element payload: {0}")]
    InvalidPayload(String),

    /// Offline buffer persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<OfflineError> for SyncError {
    fn from(err: OfflineError) -> Self {
        match err {
            OfflineError::Serialization(msg) => SyncError::Serialization(msg),
            other => SyncError::Storage(other.to_string()),
        }
    }
}
