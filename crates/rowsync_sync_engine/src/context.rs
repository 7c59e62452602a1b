//! Per-run context.

use crate::error::{SyncError, SyncResult};
use crate::progress::{Progress, SyncStage};
use rowsync_core::{SyncParameters, SyncSide};
use rowsync_sync_protocol::SyncType;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a run carries through the orchestrators: identity, kind,
/// filter parameters, progress sink and cancellation signal.
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// Run identity, also the server session id.
    pub session_id: Uuid,
    /// Scope synchronized.
    pub scope_name: String,
    /// Run kind.
    pub sync_type: SyncType,
    /// Filter parameter values.
    pub parameters: SyncParameters,
    progress: Progress,
    cancel: CancellationToken,
}

impl SyncContext {
    /// Creates a context with a fresh session id.
    pub fn new(scope_name: impl Into<String>, sync_type: SyncType) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope_name: scope_name.into(),
            sync_type,
            parameters: SyncParameters::new(),
            progress: Progress::none(),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an existing session id.
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    /// Sets the filter parameters.
    pub fn with_parameters(mut self, parameters: SyncParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the progress sink.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails with [`SyncError::Cancelled`] if the run was cancelled.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Emits a progress event.
    pub fn report(&self, percent: u8, stage: SyncStage, side: SyncSide, message: impl Into<String>) {
        self.progress.report(percent, stage, side, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_observed() {
        let cancel = CancellationToken::new();
        let context = SyncContext::new("default", SyncType::Normal).with_cancellation(cancel.clone());
        assert!(context.check_cancelled().is_ok());
        cancel.cancel();
        assert!(matches!(context.check_cancelled(), Err(SyncError::Cancelled)));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SyncContext::new("default", SyncType::Normal);
        let b = SyncContext::new("default", SyncType::Normal);
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(b.clone().with_session_id(a.session_id).session_id, a.session_id);
    }
}
