//! Error types for the sync server.

use fieldsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
///
/// Per-entry outcomes (conflicts, validation rejections) are dispositions,
/// not errors. These errors reject a request as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Push batch above the configured limit.
    #[error("push batch too large: {size} > {max}")]
    BatchTooLarge {
        /// Entries in the request.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No endpoint at this path.
    #[error("no such endpoint: {0}")]
    UnknownEndpoint(String),

    /// Request or response body could not be (de)coded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::BatchTooLarge { .. }
                | ServerError::UnknownEndpoint(_)
                | ServerError::Codec(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::UnknownEndpoint(_) => 404,
            ServerError::BatchTooLarge { .. } => 413,
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => 400,
            ServerError::Internal(_) => 500,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidMessage(msg) => ServerError::InvalidRequest(msg),
            ProtocolError::Decode(msg) => ServerError::Codec(msg),
            ProtocolError::Encode(msg) => ServerError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert_eq!(ServerError::UnknownEndpoint("/x".into()).status_code(), 404);
        assert_eq!(ServerError::Internal("oops".into()).status_code(), 500);
    }

    #[test]
    fn error_display() {
        let err = ServerError::BatchTooLarge { size: 600, max: 500 };
        let msg = err.to_string();
        assert!(msg.contains("600"));
        assert!(msg.contains("500"));
    }

    #[test]
    fn encode_failures_are_internal() {
        let err: ServerError = ProtocolError::Encode("buffer".into()).into();
        assert!(err.is_server_error());
        let err: ServerError = ProtocolError::Decode("eof".into()).into();
        assert_eq!(err.status_code(), 400);
    }
}
