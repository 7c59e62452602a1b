//! Run state machine.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::fmt;

/// State of a synchronization run.
///
/// A run moves forward one state at a time and ends back in `Idle`, either
/// after `ScopeSaved` or when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No run in progress.
    Idle,
    /// Scopes loaded or provisioned on both sides.
    ScopeLoaded,
    /// Local changes selected into a batch.
    ChangesComputed,
    /// Upload sent and download received.
    ChangesExchanged,
    /// Download applied.
    ChangesApplied,
    /// Watermarks saved.
    ScopeSaved,
}

impl SyncState {
    /// The state following this one in a successful run.
    pub fn next(&self) -> SyncState {
        match self {
            SyncState::Idle => SyncState::ScopeLoaded,
            SyncState::ScopeLoaded => SyncState::ChangesComputed,
            SyncState::ChangesComputed => SyncState::ChangesExchanged,
            SyncState::ChangesExchanged => SyncState::ChangesApplied,
            SyncState::ChangesApplied => SyncState::ScopeSaved,
            SyncState::ScopeSaved => SyncState::Idle,
        }
    }

    /// Returns true if a run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }

    /// Returns true if `to` may follow this state.
    pub fn can_transition_to(&self, to: SyncState) -> bool {
        to == self.next() || (to == SyncState::Idle && self.is_active())
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared cell holding the state of the current run.
#[derive(Debug)]
pub struct RunState {
    state: RwLock<SyncState>,
}

impl RunState {
    /// Creates an idle cell.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SyncState::Idle),
        }
    }

    /// Current state.
    pub fn get(&self) -> SyncState {
        *self.state.read()
    }

    /// Moves to `to`, rejecting transitions the machine does not allow.
    pub fn transition(&self, to: SyncState) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(to) {
            return Err(SyncError::IllegalTransition { from: *state, to });
        }
        tracing::trace!(from = %*state, to = %to, "state transition");
        *state = to;
        Ok(())
    }

    /// Returns to `Idle` from any state.
    pub fn reset(&self) {
        *self.state.write() = SyncState::Idle;
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle() {
        let run = RunState::new();
        let mut state = SyncState::Idle;
        for _ in 0..6 {
            state = state.next();
            run.transition(state).unwrap();
        }
        assert_eq!(run.get(), SyncState::Idle);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let run = RunState::new();
        run.transition(SyncState::ScopeLoaded).unwrap();
        let err = run.transition(SyncState::ChangesApplied).unwrap_err();
        assert!(matches!(err, SyncError::IllegalTransition { .. }));
        assert_eq!(run.get(), SyncState::ScopeLoaded);
    }

    #[test]
    fn failure_returns_to_idle() {
        let run = RunState::new();
        run.transition(SyncState::ScopeLoaded).unwrap();
        run.transition(SyncState::ChangesComputed).unwrap();
        run.transition(SyncState::Idle).unwrap();
        assert!(!run.get().is_active());
        assert!(run.transition(SyncState::Idle).is_err());
    }
}
