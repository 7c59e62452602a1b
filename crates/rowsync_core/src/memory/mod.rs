//! In-memory storage provider.
//!
//! The reference engine: it implements every provider operation with the
//! same observable semantics a relational engine would, which makes it the
//! store of choice for tests and for embedding.
//!
//! A transaction holds the database lock and works on a copy that replaces
//! the shared state on commit, so an uncommitted transaction is invisible to
//! everyone else and rollback is free.

mod database;
mod filter;

pub use database::TrackingRow;

use crate::error::{CoreError, CoreResult};
use crate::provider::{ApplyContext, ApplyOutcome, DdlStatement, SelectChanges, StorageProvider};
use crate::row::SyncRow;
use crate::schema::{SyncSchema, TableSchema};
use crate::setup::SyncSetup;
use async_trait::async_trait;
use database::Database;
use rowsync_codec::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Kind of a catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// Replicated table.
    Table,
    /// Tracking table.
    TrackingTable,
    /// Change-capture trigger.
    Trigger,
    /// Stored procedure.
    Procedure,
    /// Scope table.
    ScopeTable,
}

/// An in-memory database.
///
/// Cloning shares the underlying database.
#[derive(Clone)]
pub struct MemoryProvider {
    name: Arc<str>,
    db: Arc<Mutex<Database>>,
}

/// An open transaction on a [`MemoryProvider`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Database>,
    working: Database,
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryProvider {
    /// Creates an empty database.
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            db: Arc::new(Mutex::new(Database::default())),
        }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a table outside of any provisioning.
    pub async fn create_table(&self, schema: TableSchema) -> CoreResult<()> {
        let mut db = self.db.lock().await;
        db.execute_ddl(&DdlStatement::CreateTable(schema))
    }

    /// Enables or disables foreign key enforcement.
    pub async fn set_foreign_keys(&self, enabled: bool) {
        self.db.lock().await.enforce_foreign_keys = enabled;
    }

    /// Inserts a row given in column order. Fires the insert trigger.
    pub async fn insert_row(&self, table: &str, values: Vec<Value>) -> CoreResult<()> {
        self.db.lock().await.insert_row(table, values)
    }

    /// Updates non-key columns of a row. Fires the update trigger.
    pub async fn update_row(
        &self,
        table: &str,
        key: &[Value],
        changes: &[(&str, Value)],
    ) -> CoreResult<()> {
        self.db.lock().await.update_row(table, key, changes)
    }

    /// Deletes a row. Fires the delete trigger.
    pub async fn delete_row(&self, table: &str, key: &[Value]) -> CoreResult<()> {
        self.db.lock().await.delete_row(table, key)
    }

    /// Returns one row in column order.
    pub async fn row(&self, table: &str, key: &[Value]) -> CoreResult<Option<Vec<Value>>> {
        let db = self.db.lock().await;
        Ok(db.table(table)?.rows.get(key).cloned())
    }

    /// Returns every row of a table in key order.
    pub async fn rows(&self, table: &str) -> CoreResult<Vec<Vec<Value>>> {
        let db = self.db.lock().await;
        Ok(db.table(table)?.rows.values().cloned().collect())
    }

    /// Returns the tracking row of a key, if the table is tracked.
    pub async fn tracking_row(&self, table: &str, key: &[Value]) -> Option<TrackingRow> {
        let db = self.db.lock().await;
        db.tracking
            .values()
            .find(|t| t.table == table)
            .and_then(|t| t.rows.get(key).cloned())
    }

    /// Lists every object of the catalog with its kind, sorted by name.
    pub async fn catalog(&self) -> Vec<(String, ObjectKind)> {
        let db = self.db.lock().await;
        let mut objects: Vec<(String, ObjectKind)> = db
            .tables
            .keys()
            .map(|n| (n.clone(), ObjectKind::Table))
            .chain(db.tracking.keys().map(|n| (n.clone(), ObjectKind::TrackingTable)))
            .chain(db.triggers.keys().map(|n| (n.clone(), ObjectKind::Trigger)))
            .chain(db.procedures.keys().map(|n| (n.clone(), ObjectKind::Procedure)))
            .chain(db.scope_tables.keys().map(|n| (n.clone(), ObjectKind::ScopeTable)))
            .collect();
        objects.sort();
        objects
    }

    /// Describes generated objects: trigger, procedure and scope table
    /// kinds by object name. Useful for asserting provisioning results.
    pub async fn describe(&self, name: &str) -> Option<String> {
        let db = self.db.lock().await;
        if let Some(trigger) = db.triggers.get(name) {
            return Some(format!("trigger {} on {}", trigger.kind.as_str(), trigger.table));
        }
        if let Some(procedure) = db.procedures.get(name) {
            return Some(format!("procedure {} on {}", procedure.kind.as_str(), procedure.table));
        }
        if let Some(table) = db.scope_tables.get(name) {
            return Some(format!("scope table {:?}", table.kind));
        }
        if let Some(tracking) = db.tracking.get(name) {
            return Some(format!("tracking table on {}", tracking.table));
        }
        db.tables.get(name).map(|_| "table".to_string())
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    type Transaction = MemoryTransaction;

    fn engine(&self) -> &str {
        "memory"
    }

    async fn begin(&self) -> CoreResult<MemoryTransaction> {
        let guard = Arc::clone(&self.db).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction { guard, working })
    }

    async fn commit(&self, txn: MemoryTransaction) -> CoreResult<()> {
        let MemoryTransaction { mut guard, working } = txn;
        *guard = working;
        Ok(())
    }

    async fn rollback(&self, txn: MemoryTransaction) -> CoreResult<()> {
        drop(txn);
        Ok(())
    }

    async fn execute_ddl(&self, txn: &mut MemoryTransaction, statement: &DdlStatement) -> CoreResult<()> {
        tracing::trace!(db = %self.name, object = statement.object_name(), "ddl");
        txn.working.execute_ddl(statement)
    }

    async fn object_exists(&self, txn: &mut MemoryTransaction, name: &str) -> CoreResult<bool> {
        Ok(txn.working.object_exists(name))
    }

    async fn get_schema(&self, txn: &mut MemoryTransaction, setup: &SyncSetup) -> CoreResult<SyncSchema> {
        txn.working.get_schema(setup)
    }

    async fn current_timestamp(&self, txn: &mut MemoryTransaction) -> CoreResult<u64> {
        Ok(txn.working.counter)
    }

    async fn min_valid_timestamp(&self, txn: &mut MemoryTransaction) -> CoreResult<u64> {
        Ok(txn.working.min_valid)
    }

    async fn select_changes(
        &self,
        txn: &mut MemoryTransaction,
        request: &SelectChanges<'_>,
    ) -> CoreResult<Vec<SyncRow>> {
        txn.working.select_changes(request)
    }

    async fn apply_rows(
        &self,
        txn: &mut MemoryTransaction,
        table: &TableSchema,
        columns: &[String],
        rows: &[SyncRow],
        context: &ApplyContext,
    ) -> CoreResult<ApplyOutcome> {
        txn.working.apply_rows(table, columns, rows, context)
    }

    async fn reset_table(&self, txn: &mut MemoryTransaction, table: &str, procedure: &str) -> CoreResult<()> {
        txn.working.reset_table(table, procedure)
    }

    async fn delete_metadata(
        &self,
        txn: &mut MemoryTransaction,
        tracking_tables: &[String],
        older_than: u64,
    ) -> CoreResult<usize> {
        txn.working.delete_metadata(tracking_tables, older_than)
    }

    async fn read_scope_record(
        &self,
        txn: &mut MemoryTransaction,
        scope_table: &str,
        key: &str,
    ) -> CoreResult<Option<Vec<u8>>> {
        Ok(txn.working.scope_table(scope_table)?.records.get(key).cloned())
    }

    async fn write_scope_record(
        &self,
        txn: &mut MemoryTransaction,
        scope_table: &str,
        key: &str,
        record: Vec<u8>,
    ) -> CoreResult<()> {
        txn.working
            .scope_table_mut(scope_table)?
            .records
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn list_scope_records(
        &self,
        txn: &mut MemoryTransaction,
        scope_table: &str,
        prefix: &str,
    ) -> CoreResult<Vec<(String, Vec<u8>)>> {
        Ok(txn
            .working
            .scope_table(scope_table)?
            .records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete_scope_record(
        &self,
        txn: &mut MemoryTransaction,
        scope_table: &str,
        key: &str,
    ) -> CoreResult<()> {
        match txn.working.scope_table_mut(scope_table)?.records.remove(key) {
            Some(_) => Ok(()),
            None => Err(CoreError::missing_object("scope record", key)),
        }
    }
}
