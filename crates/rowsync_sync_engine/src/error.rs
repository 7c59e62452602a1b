//! Run-level failures of a synchronization.
//!
//! A [`SyncError`] ends the run. Both watermarks stay where the last
//! successful run left them; rows that merely failed to apply are counted in
//! the summary and never surface here.

use crate::state::SyncState;
use rowsync_core::CoreError;
use thiserror::Error;

/// Result of an agent or orchestrator call.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a run stopped.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Storage, provisioning or batch failure on this side.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The HTTP exchange with the sync server failed before an answer was
    /// read, or the server refused the request with a 4xx.
    #[error("http exchange failed: {reason}")]
    Http {
        /// What went wrong.
        reason: String,
        /// False when sending the same request again cannot succeed.
        retryable: bool,
    },

    /// No answer within the configured request timeout.
    #[error("no answer from the sync server in time")]
    TimedOut,

    /// A message decoded but does not fit the session, such as a reply for
    /// another session or a part index out of order.
    #[error("malformed sync message: {0}")]
    BadMessage(String),

    /// The server answered with a 5xx.
    #[error("sync server failed: {0}")]
    ServerFailed(String),

    /// The client's last server timestamp is older than the tracking
    /// history the server still holds.
    #[error("scope {scope} is outdated and must be reinitialized")]
    OutdatedScope {
        /// Scope name.
        scope: String,
    },

    /// Client and server fingerprints of the scope's setup differ.
    #[error("setup mismatch for scope {scope}: client {client}, server {server}")]
    SetupMismatch {
        /// Scope name.
        scope: String,
        /// Client setup fingerprint.
        client: String,
        /// Server setup fingerprint.
        server: String,
    },

    /// The agent was driven out of its run order.
    #[error("agent cannot go from {from} to {to}")]
    IllegalTransition {
        /// State the agent was in.
        from: SyncState,
        /// State it was asked to enter.
        to: SyncState,
    },

    /// The run's cancellation token fired.
    #[error("sync cancelled")]
    Cancelled,

    /// The operation needs configuration this orchestrator lacks.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl SyncError {
    /// An HTTP failure worth sending again, such as a reset connection.
    pub fn http_transient(reason: impl Into<String>) -> Self {
        Self::Http {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// An HTTP failure that would repeat on every attempt.
    pub fn http_permanent(reason: impl Into<String>) -> Self {
        Self::Http {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Whether the web client may resend the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http { retryable, .. } => *retryable,
            SyncError::TimedOut | SyncError::ServerFailed(_) => true,
            _ => false,
        }
    }

    /// True for a cancelled run, whether the agent or the applier noticed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::Core(CoreError::Cancelled))
    }
}
