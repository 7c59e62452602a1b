//! The storage provider contract.
//!
//! A provider adapts one database engine. It owns schema introspection, DDL
//! for generated objects, and transactional row reads and writes. Every side
//! effect is confined to the transaction passed in; the orchestrators never
//! share a transaction between phases.

use crate::error::CoreResult;
use crate::filter::BoundFilter;
use crate::row::{FailedRow, SyncRow};
use crate::schema::{SyncSchema, TableSchema};
use crate::setup::SyncSetup;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

bitflags! {
    /// Categories of generated objects, provisioned independently.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProvisionFlags: u8 {
        /// The replicated tables themselves.
        const TABLE = 0b0000_0001;
        /// One tracking table per replicated table.
        const TRACKING_TABLE = 0b0000_0010;
        /// Insert, update and delete capture triggers.
        const TRIGGERS = 0b0000_0100;
        /// Select, update and delete procedures.
        const STORED_PROCEDURES = 0b0000_1000;
        /// Scope info and client history tables.
        const SCOPE_TABLE = 0b0001_0000;
    }
}

impl ProvisionFlags {
    /// Everything except the replicated tables.
    pub fn tracking() -> Self {
        Self::TRACKING_TABLE | Self::TRIGGERS | Self::STORED_PROCEDURES | Self::SCOPE_TABLE
    }
}

/// Change-capture trigger kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    /// Fires after insert.
    Insert,
    /// Fires after update.
    Update,
    /// Fires after delete.
    Delete,
}

impl TriggerKind {
    /// All trigger kinds.
    pub const ALL: [TriggerKind; 3] = [TriggerKind::Insert, TriggerKind::Update, TriggerKind::Delete];

    /// Lowercase name used in generated object names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Insert => "insert",
            TriggerKind::Update => "update",
            TriggerKind::Delete => "delete",
        }
    }
}

/// Stored procedure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureKind {
    /// Selects changes since a timestamp.
    SelectChanges,
    /// Applies an upsert with conflict detection.
    Update,
    /// Applies a delete with conflict detection.
    Delete,
    /// Removes every row and tracking row of the table.
    Reset,
}

impl ProcedureKind {
    /// All procedure kinds.
    pub const ALL: [ProcedureKind; 4] = [
        ProcedureKind::SelectChanges,
        ProcedureKind::Update,
        ProcedureKind::Delete,
        ProcedureKind::Reset,
    ];

    /// Lowercase name used in generated object names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::SelectChanges => "changes",
            ProcedureKind::Update => "update",
            ProcedureKind::Delete => "delete",
            ProcedureKind::Reset => "reset",
        }
    }
}

/// Which scope table a statement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeTableKind {
    /// Scope records keyed by scope name.
    Info,
    /// Server-side history keyed by scope name and client scope id.
    History,
}

/// A DDL statement for one generated object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlStatement {
    /// Creates a replicated table.
    CreateTable(TableSchema),
    /// Drops a replicated table.
    DropTable {
        /// Table name.
        name: String,
    },
    /// Creates a tracking table and backfills rows already present.
    CreateTrackingTable {
        /// Tracking table name.
        name: String,
        /// Tracked table.
        table: String,
        /// Columns copied into tracking rows for filtering deletes.
        filter_columns: Vec<String>,
    },
    /// Drops a tracking table, discarding its history.
    DropTrackingTable {
        /// Tracking table name.
        name: String,
    },
    /// Creates a change-capture trigger.
    CreateTrigger {
        /// Trigger name.
        name: String,
        /// Tracked table.
        table: String,
        /// Trigger kind.
        kind: TriggerKind,
    },
    /// Drops a trigger.
    DropTrigger {
        /// Trigger name.
        name: String,
    },
    /// Creates a stored procedure.
    CreateProcedure {
        /// Procedure name.
        name: String,
        /// Table the procedure serves.
        table: String,
        /// Procedure kind.
        kind: ProcedureKind,
        /// Filter the select procedure is specialised for.
        filter: Option<String>,
    },
    /// Drops a stored procedure.
    DropProcedure {
        /// Procedure name.
        name: String,
    },
    /// Creates a scope table.
    CreateScopeTable {
        /// Table name.
        name: String,
        /// Scope table kind.
        kind: ScopeTableKind,
    },
    /// Drops a scope table.
    DropScopeTable {
        /// Table name.
        name: String,
    },
}

impl DdlStatement {
    /// Name of the object the statement creates or drops.
    pub fn object_name(&self) -> &str {
        match self {
            DdlStatement::CreateTable(schema) => &schema.name,
            DdlStatement::DropTable { name }
            | DdlStatement::CreateTrackingTable { name, .. }
            | DdlStatement::DropTrackingTable { name }
            | DdlStatement::CreateTrigger { name, .. }
            | DdlStatement::DropTrigger { name }
            | DdlStatement::CreateProcedure { name, .. }
            | DdlStatement::DropProcedure { name }
            | DdlStatement::CreateScopeTable { name, .. }
            | DdlStatement::DropScopeTable { name } => name,
        }
    }

    /// Returns true for statements creating an object.
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            DdlStatement::CreateTable(_)
                | DdlStatement::CreateTrackingTable { .. }
                | DdlStatement::CreateTrigger { .. }
                | DdlStatement::CreateProcedure { .. }
                | DdlStatement::CreateScopeTable { .. }
        )
    }
}

/// Arguments of a change selection for one table.
#[derive(Debug, Clone)]
pub struct SelectChanges<'a> {
    /// Table schema, restricted to the replicated columns.
    pub table: &'a TableSchema,
    /// Select procedure to run.
    pub procedure: &'a str,
    /// Row filter, if the table is filtered.
    pub filter: Option<&'a BoundFilter>,
    /// Only rows with a tracking timestamp strictly above this are selected.
    pub since: u64,
    /// Rows last written by this scope are skipped.
    pub exclude_scope_id: Option<Uuid>,
    /// Select tombstones instead of live rows.
    pub tombstones: bool,
}

/// Arguments of a row application.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    /// Scope that produced the incoming rows.
    pub sender_scope_id: Uuid,
    /// Watermark the sender last saw from this store. Local rows tracked
    /// above it and not written by the sender are conflicts.
    pub last_sync_timestamp: u64,
    /// Scope recorded as the writer of applied rows, `None` for a local write.
    pub write_scope_id: Option<Uuid>,
    /// Skip conflict detection.
    pub force: bool,
    /// Enforce foreign keys while applying.
    pub check_constraints: bool,
    /// Update procedure to run.
    pub update_procedure: String,
    /// Delete procedure to run.
    pub delete_procedure: String,
}

/// A row whose application was refused because of a local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRow {
    /// The incoming row.
    pub remote: SyncRow,
    /// The current local version. A local tombstone is a `Deleted` row
    /// carrying only its key.
    pub local: SyncRow,
}

/// Result of applying a set of rows.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Rows written or already in the incoming state.
    pub applied: usize,
    /// Rows refused because of a conflict.
    pub conflicts: Vec<ConflictRow>,
    /// Rows refused because of a row-level error.
    pub failed: Vec<FailedRow>,
}

/// A per-engine adapter for schema, DDL and transactional row access.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// An open transaction.
    type Transaction: Send;

    /// Engine name, for logs.
    fn engine(&self) -> &str;

    /// Opens a transaction.
    async fn begin(&self) -> CoreResult<Self::Transaction>;

    /// Commits a transaction.
    async fn commit(&self, txn: Self::Transaction) -> CoreResult<()>;

    /// Rolls back a transaction.
    async fn rollback(&self, txn: Self::Transaction) -> CoreResult<()>;

    /// Executes one DDL statement.
    async fn execute_ddl(&self, txn: &mut Self::Transaction, statement: &DdlStatement)
        -> CoreResult<()>;

    /// Returns true if an object with this name exists.
    async fn object_exists(&self, txn: &mut Self::Transaction, name: &str) -> CoreResult<bool>;

    /// Reads the schema of every table in the setup, restricted to the
    /// setup's columns.
    async fn get_schema(&self, txn: &mut Self::Transaction, setup: &SyncSetup)
        -> CoreResult<SyncSchema>;

    /// Highest tracking timestamp assigned so far.
    async fn current_timestamp(&self, txn: &mut Self::Transaction) -> CoreResult<u64>;

    /// Oldest timestamp the store still has complete history for.
    async fn min_valid_timestamp(&self, txn: &mut Self::Transaction) -> CoreResult<u64>;

    /// Selects changed rows of one table.
    async fn select_changes(
        &self,
        txn: &mut Self::Transaction,
        request: &SelectChanges<'_>,
    ) -> CoreResult<Vec<SyncRow>>;

    /// Applies rows of one table.
    async fn apply_rows(
        &self,
        txn: &mut Self::Transaction,
        table: &TableSchema,
        columns: &[String],
        rows: &[SyncRow],
        context: &ApplyContext,
    ) -> CoreResult<ApplyOutcome>;

    /// Removes every row and tracking row of a table using its reset procedure.
    async fn reset_table(&self, txn: &mut Self::Transaction, table: &str, procedure: &str)
        -> CoreResult<()>;

    /// Purges tombstones tracked at or below `older_than` and raises the
    /// retained-history floor. Returns the number of purged tracking rows.
    async fn delete_metadata(
        &self,
        txn: &mut Self::Transaction,
        tracking_tables: &[String],
        older_than: u64,
    ) -> CoreResult<usize>;

    /// Reads a record from a scope table.
    async fn read_scope_record(
        &self,
        txn: &mut Self::Transaction,
        scope_table: &str,
        key: &str,
    ) -> CoreResult<Option<Vec<u8>>>;

    /// Writes a record to a scope table.
    async fn write_scope_record(
        &self,
        txn: &mut Self::Transaction,
        scope_table: &str,
        key: &str,
        record: Vec<u8>,
    ) -> CoreResult<()>;

    /// Lists records of a scope table whose key starts with `prefix`.
    async fn list_scope_records(
        &self,
        txn: &mut Self::Transaction,
        scope_table: &str,
        prefix: &str,
    ) -> CoreResult<Vec<(String, Vec<u8>)>>;

    /// Deletes a record from a scope table.
    async fn delete_scope_record(
        &self,
        txn: &mut Self::Transaction,
        scope_table: &str,
        key: &str,
    ) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = ProvisionFlags::tracking();
        assert!(flags.contains(ProvisionFlags::TRIGGERS));
        assert!(!flags.contains(ProvisionFlags::TABLE));
        assert_eq!(
            (ProvisionFlags::TABLE | flags).bits(),
            ProvisionFlags::all().bits()
        );
    }

    #[test]
    fn statement_names() {
        let stmt = DdlStatement::CreateTrigger {
            name: "Customer_insert_trigger".into(),
            table: "Customer".into(),
            kind: TriggerKind::Insert,
        };
        assert_eq!(stmt.object_name(), "Customer_insert_trigger");
        assert!(stmt.is_create());
        assert!(!DdlStatement::DropTrigger { name: "x".into() }.is_create());
    }
}
