//! Progress reporting.
//!
//! The sink is called synchronously from the run, so it must return quickly.

use rowsync_core::SyncSide;
use std::fmt;
use std::sync::Arc;

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    /// Loading or provisioning the scopes.
    ScopeLoading,
    /// Selecting local changes.
    ChangesSelecting,
    /// Uploading changes and receiving the server changes.
    ChangesExchanging,
    /// Applying received changes.
    ChangesApplying,
    /// Saving watermarks.
    ScopeSaving,
    /// Run finished.
    Completed,
}

impl SyncStage {
    /// Returns the stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::ScopeLoading => "scope_loading",
            SyncStage::ChangesSelecting => "changes_selecting",
            SyncStage::ChangesExchanging => "changes_exchanging",
            SyncStage::ChangesApplying => "changes_applying",
            SyncStage::ScopeSaving => "scope_saving",
            SyncStage::Completed => "completed",
        }
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Completion, 0 to 100.
    pub percent: u8,
    /// Current phase.
    pub stage: SyncStage,
    /// Human-readable message.
    pub message: String,
    /// Side doing the work.
    pub side: SyncSide,
}

/// Receiver of progress events.
#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<Arc<dyn Fn(&ProgressEvent) + Send + Sync>>,
}

impl Progress {
    /// A progress handle that drops every event.
    pub fn none() -> Self {
        Self { sink: None }
    }

    /// A progress handle that forwards events to `sink`.
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Emits an event.
    pub fn report(&self, percent: u8, stage: SyncStage, side: SyncSide, message: impl Into<String>) {
        if let Some(sink) = &self.sink {
            sink(&ProgressEvent {
                percent: percent.min(100),
                stage,
                message: message.into(),
                side,
            });
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn events_reach_the_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress = Progress::new(move |event| sink.lock().push(event.clone()));

        progress.report(40, SyncStage::ChangesApplying, SyncSide::Client, "applying");
        progress.report(250, SyncStage::Completed, SyncSide::Client, "done");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stage, SyncStage::ChangesApplying);
        assert_eq!(seen[1].percent, 100);
    }

    #[test]
    fn none_drops_events() {
        Progress::none().report(10, SyncStage::ScopeLoading, SyncSide::Server, "ignored");
    }
}
