//! In-flight row changes.

use rowsync_codec::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of change a row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowState {
    /// The row did not exist at the watermark.
    Inserted,
    /// The row existed at the watermark and was changed.
    Modified,
    /// The row was deleted; only key columns are meaningful.
    Deleted,
}

impl RowState {
    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        matches!(self, RowState::Deleted)
    }
}

/// A tracked change joined with its data row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Change kind.
    pub state: RowState,
    /// Values aligned with the owning [`SyncTable::columns`]. Non-key values
    /// of deletes are `NULL`.
    pub values: Vec<Value>,
    /// Tracking timestamp on the side that selected the row.
    pub timestamp: u64,
    /// Scope that last wrote the row, `None` for a local edit.
    pub update_scope_id: Option<Uuid>,
    /// Wall-clock time of the original change, milliseconds since the epoch.
    pub changed_at: i64,
}

impl SyncRow {
    /// Creates an upsert row.
    pub fn upsert(state: RowState, values: Vec<Value>) -> Self {
        Self {
            state,
            values,
            timestamp: 0,
            update_scope_id: None,
            changed_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Creates a delete row.
    pub fn delete(values: Vec<Value>) -> Self {
        Self::upsert(RowState::Deleted, values)
    }
}

/// All changed rows of one table within a batch part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    /// Table name.
    pub name: String,
    /// Column names the row values are aligned with.
    pub columns: Vec<String>,
    /// Primary key column names.
    pub primary_key: Vec<String>,
    /// Rows in selection order.
    pub rows: Vec<SyncRow>,
}

impl SyncTable {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>, columns: Vec<String>, primary_key: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key,
            rows: Vec::new(),
        }
    }

    /// Returns the position of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns the value of `column` in `row`.
    pub fn value<'a>(&self, row: &'a SyncRow, column: &str) -> Option<&'a Value> {
        self.column_index(column).and_then(|i| row.values.get(i))
    }

    /// Extracts the primary key of a row.
    pub fn key_of(&self, row: &SyncRow) -> Vec<Value> {
        self.primary_key
            .iter()
            .map(|pk| self.value(row, pk).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A changeset, or one part of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSet {
    /// Tables in application order. A table may appear twice: once for
    /// upserts and once for deletes.
    pub tables: Vec<SyncTable>,
}

impl SyncSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across tables.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(SyncTable::len).sum()
    }

    /// Appends a row, extending the last table when it matches.
    pub fn push(&mut self, template: &SyncTable, row: SyncRow) {
        let extend = self
            .tables
            .last()
            .map(|t| t.name == template.name && t.columns == template.columns)
            .unwrap_or(false);
        if !extend {
            self.tables.push(SyncTable::new(
                template.name.clone(),
                template.columns.clone(),
                template.primary_key.clone(),
            ));
        }
        if let Some(table) = self.tables.last_mut() {
            table.rows.push(row);
        }
    }
}

/// A row that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRow {
    /// Table of the row.
    pub table: String,
    /// Primary key.
    pub key: Vec<Value>,
    /// Why it failed.
    pub reason: String,
}

impl FailedRow {
    /// Creates a failed row record.
    pub fn new(table: impl Into<String>, key: Vec<Value>, reason: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key,
            reason: reason.into(),
        }
    }
}

/// Formats a primary key for messages and logs.
pub fn display_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
    format!("({})", parts.join(", "))
}
