//! Conflict resolution.
//!
//! A conflict is raised by the provider when an incoming row targets a local
//! row changed since the sender's base watermark by someone other than the
//! sender. The resolver turns it into an action, either from a registered
//! hook or from the configured [`ConflictPolicy`], and records the outcome.

use crate::interceptor::Interceptors;
use crate::row::SyncRow;
use crate::setup::SyncSide;
use rowsync_codec::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Automatic resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// The server version is kept.
    #[default]
    ServerWins,
    /// The client version is kept.
    ClientWins,
    /// The most recently changed version is kept. Equal change times prefer
    /// the version whose writer scope id sorts lower.
    LastWriterWins,
}

/// What to do with one conflicting row, from the applying side's viewpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAction {
    /// Keep the local version and drop the incoming one.
    KeepLocal,
    /// Overwrite the local version with the incoming one.
    KeepRemote,
    /// Write this row instead. Values are aligned with the conflict's columns.
    Merge(Vec<Value>),
    /// Refuse the row.
    Abort,
}

/// Recorded resolution of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictOutcome {
    /// The server version was kept.
    ServerWins,
    /// The client version was kept.
    ClientWins,
    /// A merged row was written.
    MergeRow,
    /// The incoming row was refused.
    Rollback,
}

/// One conflicting row, handed to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Table of the row.
    pub table: String,
    /// Column names the row values are aligned with.
    pub columns: Vec<String>,
    /// Primary key.
    pub key: Vec<Value>,
    /// Local version. `Deleted` if the row is a local tombstone.
    pub local: SyncRow,
    /// Incoming version.
    pub remote: SyncRow,
    /// Side applying the rows.
    pub side: SyncSide,
}

/// A resolved conflict, reported in run summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    /// Table of the row.
    pub table: String,
    /// Primary key.
    pub key: Vec<Value>,
    /// Outcome.
    pub outcome: ConflictOutcome,
}

/// Decides conflicts for one applying side.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    side: SyncSide,
    local_scope_id: Uuid,
    remote_scope_id: Uuid,
}

impl ConflictResolver {
    /// Creates a resolver for rows sent by `remote_scope_id` and applied on
    /// `side`, whose own scope id is `local_scope_id`.
    pub fn new(policy: ConflictPolicy, side: SyncSide, local_scope_id: Uuid, remote_scope_id: Uuid) -> Self {
        Self {
            policy,
            side,
            local_scope_id,
            remote_scope_id,
        }
    }

    /// Configured policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Picks the action for a conflict: the first hook that answers, else
    /// the policy.
    pub fn resolve(&self, conflict: &Conflict, interceptors: &Interceptors) -> ConflictAction {
        if let Some(action) = interceptors.conflict_action(conflict) {
            return action;
        }
        match (self.policy, self.side) {
            (ConflictPolicy::ServerWins, SyncSide::Server)
            | (ConflictPolicy::ClientWins, SyncSide::Client) => ConflictAction::KeepLocal,
            (ConflictPolicy::ServerWins, SyncSide::Client)
            | (ConflictPolicy::ClientWins, SyncSide::Server) => ConflictAction::KeepRemote,
            (ConflictPolicy::LastWriterWins, _) => self.last_writer(conflict),
        }
    }

    fn last_writer(&self, conflict: &Conflict) -> ConflictAction {
        let local_writer = conflict.local.update_scope_id.unwrap_or(self.local_scope_id);
        let remote_writer = conflict.remote.update_scope_id.unwrap_or(self.remote_scope_id);
        let local_wins = match conflict.local.changed_at.cmp(&conflict.remote.changed_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => local_writer <= remote_writer,
        };
        if local_wins {
            ConflictAction::KeepLocal
        } else {
            ConflictAction::KeepRemote
        }
    }

    /// Translates an action into the side-independent outcome.
    pub fn outcome(&self, action: &ConflictAction) -> ConflictOutcome {
        match (action, self.side) {
            (ConflictAction::KeepLocal, SyncSide::Server) | (ConflictAction::KeepRemote, SyncSide::Client) => {
                ConflictOutcome::ServerWins
            }
            (ConflictAction::KeepLocal, SyncSide::Client) | (ConflictAction::KeepRemote, SyncSide::Server) => {
                ConflictOutcome::ClientWins
            }
            (ConflictAction::Merge(_), _) => ConflictOutcome::MergeRow,
            (ConflictAction::Abort, _) => ConflictOutcome::Rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowState;

    fn conflict(side: SyncSide, local_at: i64, remote_at: i64) -> Conflict {
        let mut local = SyncRow::upsert(RowState::Modified, vec![1i64.into(), "local".into()]);
        local.changed_at = local_at;
        let mut remote = SyncRow::upsert(RowState::Modified, vec![1i64.into(), "remote".into()]);
        remote.changed_at = remote_at;
        Conflict {
            table: "Customer".into(),
            columns: vec!["id".into(), "name".into()],
            key: vec![1i64.into()],
            local,
            remote,
            side,
        }
    }

    #[test]
    fn server_wins_on_both_sides() {
        let ids = (Uuid::new_v4(), Uuid::new_v4());
        let hooks = Interceptors::new();

        let server = ConflictResolver::new(ConflictPolicy::ServerWins, SyncSide::Server, ids.0, ids.1);
        let action = server.resolve(&conflict(SyncSide::Server, 0, 0), &hooks);
        assert_eq!(action, ConflictAction::KeepLocal);
        assert_eq!(server.outcome(&action), ConflictOutcome::ServerWins);

        let client = ConflictResolver::new(ConflictPolicy::ServerWins, SyncSide::Client, ids.1, ids.0);
        let action = client.resolve(&conflict(SyncSide::Client, 0, 0), &hooks);
        assert_eq!(action, ConflictAction::KeepRemote);
        assert_eq!(client.outcome(&action), ConflictOutcome::ServerWins);
    }

    #[test]
    fn last_writer_wins_with_stable_tie_break() {
        let low = Uuid::nil();
        let high = Uuid::from_u128(u128::MAX);
        let hooks = Interceptors::new();

        let resolver = ConflictResolver::new(ConflictPolicy::LastWriterWins, SyncSide::Server, high, low);
        assert_eq!(
            resolver.resolve(&conflict(SyncSide::Server, 10, 5), &hooks),
            ConflictAction::KeepLocal
        );
        assert_eq!(
            resolver.resolve(&conflict(SyncSide::Server, 5, 10), &hooks),
            ConflictAction::KeepRemote
        );
        // Tie: the remote writer sorts lower.
        assert_eq!(
            resolver.resolve(&conflict(SyncSide::Server, 7, 7), &hooks),
            ConflictAction::KeepRemote
        );
    }

    #[test]
    fn hook_overrides_policy() {
        let hooks = Interceptors::new();
        hooks.on_conflict(|c| {
            let mut merged = c.remote.values.clone();
            merged[1] = "merged".into();
            Some(ConflictAction::Merge(merged))
        });
        let resolver =
            ConflictResolver::new(ConflictPolicy::ServerWins, SyncSide::Server, Uuid::new_v4(), Uuid::new_v4());
        let action = resolver.resolve(&conflict(SyncSide::Server, 0, 0), &hooks);
        assert!(matches!(action, ConflictAction::Merge(ref v) if v[1] == Value::Text("merged".into())));
        assert_eq!(resolver.outcome(&action), ConflictOutcome::MergeRow);
    }
}
