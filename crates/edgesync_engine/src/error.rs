//! Error types for the sync engine.

use edgesync_protocol::{ErrorKind, ProtocolError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A store could not be reached or answered inconsistently.
    #[error("{store} unavailable: {message}")]
    Connectivity {
        /// Store name.
        store: String,
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A store call exceeded its timeout.
    #[error("{store} call timed out after {after:?}")]
    Timeout {
        /// Store name.
        store: String,
        /// Configured timeout.
        after: Duration,
    },

    /// Malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Protocol-level validation error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Credentials or signature rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The run cannot proceed at all.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The run was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// No run with this ID is known.
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The run queue is shut down.
    #[error("run queue is closed")]
    QueueClosed,

    /// Another process holds the state directory lock.
    #[error("state directory is locked by another process: {0}")]
    StateLocked(String),

    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a retryable connectivity error.
    pub fn connectivity_retryable(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            store: store.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable connectivity error.
    pub fn connectivity_fatal(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            store: store.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connectivity { retryable, .. } => *retryable,
            SyncError::Timeout { .. } => true,
            SyncError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Maps the error onto the taxonomy recorded on runs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connectivity { .. } | SyncError::Timeout { .. } | SyncError::Sqlite(_) => {
                ErrorKind::Connectivity
            }
            SyncError::Validation(_) | SyncError::Protocol(_) | SyncError::Json(_) => {
                ErrorKind::Validation
            }
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Fatal(_)
            | SyncError::RunNotFound(_)
            | SyncError::QueueClosed
            | SyncError::StateLocked(_)
            | SyncError::Io(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the error means a store is unavailable.
    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }
}
