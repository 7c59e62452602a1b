//! Error types for the sync server.

use rowsync_core::CoreError;
use rowsync_sync_engine::SyncError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The scope is not served here.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// The session does not exist or holds no download.
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// Storage or batch error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::UnknownScope(_)
                | ServerError::UnknownSession(_)
                | ServerError::Core(CoreError::CorruptBatch { .. })
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

impl From<SyncError> for ServerError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Core(e) => ServerError::Core(e),
            e @ (SyncError::SetupMismatch { .. } | SyncError::BadMessage(_)) => ServerError::InvalidRequest(e.to_string()),
            e => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<rowsync_codec::CodecError> for ServerError {
    fn from(error: rowsync_codec::CodecError) -> Self {
        ServerError::InvalidRequest(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::UnknownSession(Uuid::nil()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::UnknownScope("s".into()).is_server_error());
        assert!(ServerError::Core(CoreError::corrupt_batch("b", "short")).is_client_error());
    }

    #[test]
    fn sync_errors_are_mapped() {
        let mismatch = SyncError::SetupMismatch {
            scope: "s".into(),
            client: "a".into(),
            server: "b".into(),
        };
        assert!(ServerError::from(mismatch).is_client_error());
        assert!(ServerError::from(SyncError::Cancelled).is_server_error());
    }
}
