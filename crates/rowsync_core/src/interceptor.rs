//! Interception points around change selection and application.
//!
//! Each point keeps an ordered list of callbacks, invoked synchronously in
//! registration order. Callbacks receiving a `&mut SyncTable` may rewrite
//! its rows; the rewritten rows are what later callbacks and the core loop
//! see.

use crate::conflict::{Conflict, ConflictAction};
use crate::row::SyncTable;
use parking_lot::RwLock;
use std::fmt;

/// Arguments of the selecting hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSelecting {
    /// Table about to be selected.
    pub table: String,
    /// Watermark the selection starts from.
    pub since: u64,
    /// Whether tombstones or live rows are selected.
    pub tombstones: bool,
    /// Set to true to skip the table.
    pub skip: bool,
}

/// Arguments of the applied hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableApplied {
    /// Table that was applied.
    pub table: String,
    /// Rows written or already present.
    pub applied: usize,
    /// Conflicts detected.
    pub conflicts: usize,
    /// Rows that failed.
    pub failed: usize,
}

type SelectingHook = Box<dyn Fn(&mut TableSelecting) + Send + Sync>;
type RowsHook = Box<dyn Fn(&mut SyncTable) + Send + Sync>;
type AppliedHook = Box<dyn Fn(&TableApplied) + Send + Sync>;
type ConflictHook = Box<dyn Fn(&Conflict) -> Option<ConflictAction> + Send + Sync>;

/// Registered interception callbacks of one orchestrator.
#[derive(Default)]
pub struct Interceptors {
    selecting: RwLock<Vec<SelectingHook>>,
    selected: RwLock<Vec<RowsHook>>,
    applying: RwLock<Vec<RowsHook>>,
    applied: RwLock<Vec<AppliedHook>>,
    conflict: RwLock<Vec<ConflictHook>>,
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("selecting", &self.selecting.read().len())
            .field("selected", &self.selected.read().len())
            .field("applying", &self.applying.read().len())
            .field("applied", &self.applied.read().len())
            .field("conflict", &self.conflict.read().len())
            .finish()
    }
}

impl Interceptors {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before a table's changes are selected.
    pub fn on_table_changes_selecting<F>(&self, hook: F)
    where
        F: Fn(&mut TableSelecting) + Send + Sync + 'static,
    {
        self.selecting.write().push(Box::new(hook));
    }

    /// Called with a table's selected rows before they are batched.
    pub fn on_table_changes_selected<F>(&self, hook: F)
    where
        F: Fn(&mut SyncTable) + Send + Sync + 'static,
    {
        self.selected.write().push(Box::new(hook));
    }

    /// Called with a table's incoming rows before they are applied.
    pub fn on_table_changes_applying<F>(&self, hook: F)
    where
        F: Fn(&mut SyncTable) + Send + Sync + 'static,
    {
        self.applying.write().push(Box::new(hook));
    }

    /// Called after a table's rows were applied.
    pub fn on_table_changes_applied<F>(&self, hook: F)
    where
        F: Fn(&TableApplied) + Send + Sync + 'static,
    {
        self.applied.write().push(Box::new(hook));
    }

    /// Called for every conflict. The first hook returning an action
    /// overrides the conflict policy.
    pub fn on_conflict<F>(&self, hook: F)
    where
        F: Fn(&Conflict) -> Option<ConflictAction> + Send + Sync + 'static,
    {
        self.conflict.write().push(Box::new(hook));
    }

    pub(crate) fn table_changes_selecting(&self, args: &mut TableSelecting) {
        for hook in self.selecting.read().iter() {
            hook(args);
        }
    }

    pub(crate) fn table_changes_selected(&self, table: &mut SyncTable) {
        for hook in self.selected.read().iter() {
            hook(table);
        }
    }

    pub(crate) fn table_changes_applying(&self, table: &mut SyncTable) {
        for hook in self.applying.read().iter() {
            hook(table);
        }
    }

    pub(crate) fn table_changes_applied(&self, args: &TableApplied) {
        for hook in self.applied.read().iter() {
            hook(args);
        }
    }

    pub(crate) fn conflict_action(&self, conflict: &Conflict) -> Option<ConflictAction> {
        self.conflict.read().iter().find_map(|hook| hook(conflict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{RowState, SyncRow};
    use rowsync_codec::Value;

    #[test]
    fn hooks_run_in_registration_order() {
        let interceptors = Interceptors::new();
        interceptors.on_table_changes_applying(|table| {
            table.rows.retain(|r| !r.state.is_delete());
        });
        interceptors.on_table_changes_applying(|table| {
            assert!(table.rows.iter().all(|r| !r.state.is_delete()));
            table.rows.truncate(1);
        });

        let mut table = SyncTable::new("Customer", vec!["id".into()], vec!["id".into()]);
        table.rows.push(SyncRow::delete(vec![Value::Integer(1)]));
        table.rows.push(SyncRow::upsert(RowState::Inserted, vec![Value::Integer(2)]));
        table.rows.push(SyncRow::upsert(RowState::Inserted, vec![Value::Integer(3)]));
        interceptors.table_changes_applying(&mut table);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].values[0], Value::Integer(2));
    }

    #[test]
    fn selecting_hook_can_skip() {
        let interceptors = Interceptors::new();
        interceptors.on_table_changes_selecting(|args| args.skip = args.table == "Audit");
        let mut args = TableSelecting {
            table: "Audit".into(),
            since: 0,
            tombstones: false,
            skip: false,
        };
        interceptors.table_changes_selecting(&mut args);
        assert!(args.skip);
    }
}
