//! Error types for the sync engine.

use fieldsync_protocol::{ConflictId, EntryId, ProtocolError, RecordId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Conflicts are not errors: they are routed to the resolver and always
/// produce an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A network call exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The transport is not reachable.
    #[error("not connected to server")]
    NotConnected,

    /// The server rejected a payload. Not retried automatically.
    #[error("validation failed for record {record_id}: {reason}")]
    Validation {
        /// Rejected record.
        record_id: RecordId,
        /// Server-provided reason.
        reason: String,
    },

    /// Local storage failed. Fatal for the device, distinct from sync failure.
    #[error("local storage error: {0}")]
    Storage(String),

    /// Two copies with the same id and version differ.
    #[error("consistency violation on record {record_id} at version {version}")]
    ConsistencyViolation {
        /// Affected record.
        record_id: RecordId,
        /// Shared version number.
        version: u64,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Protocol contract broken by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(String),

    /// Server rejected the request as a whole.
    #[error("server error: {0}")]
    ServerError(String),

    /// No such record in the local store.
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),

    /// The record is a tombstone awaiting sync.
    #[error("record {0} is deleted")]
    RecordDeleted(RecordId),

    /// No such change log entry.
    #[error("unknown change log entry {0}")]
    UnknownEntry(EntryId),

    /// No such archived conflict.
    #[error("unknown conflict {0}")]
    UnknownConflict(ConflictId),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::NotConnected => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true for failures of the local device rather than of sync.
    pub fn is_fatal_local(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidMessage(msg) => SyncError::Protocol(msg),
            other => SyncError::Codec(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
