//! State of an in-memory database and the operations on it.
//!
//! Every operation validates before it mutates, so a failed row or statement
//! leaves the state untouched.

use super::filter::{row_matches, tombstone_matches};
use crate::error::{CoreError, CoreResult};
use crate::provider::{
    ApplyContext, ApplyOutcome, ConflictRow, DdlStatement, ProcedureKind, ScopeTableKind,
    SelectChanges, TriggerKind,
};
use crate::row::{display_key, FailedRow, RowState, SyncRow};
use crate::schema::{SyncSchema, TableSchema};
use crate::setup::SyncSetup;
use rowsync_codec::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Rows of a replicated table, keyed by primary key.
#[derive(Debug, Clone)]
pub(crate) struct TableData {
    pub(crate) schema: TableSchema,
    pub(crate) rows: BTreeMap<Vec<Value>, Vec<Value>>,
}

impl TableData {
    pub(crate) fn row_map(&self, values: &[Value]) -> BTreeMap<String, Value> {
        self.schema
            .columns
            .iter()
            .zip(values)
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect()
    }
}

/// Change metadata of one tracked row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRow {
    /// Timestamp of the last change.
    pub timestamp: u64,
    /// Timestamp at which the row was first tracked.
    pub created_timestamp: u64,
    /// Scope that last wrote the row, `None` for a local edit.
    pub update_scope_id: Option<Uuid>,
    /// True once the row is deleted.
    pub is_tombstone: bool,
    /// Wall-clock creation time, milliseconds.
    pub created_at: i64,
    /// Scope that first wrote the row.
    pub created_by: Option<Uuid>,
    /// Wall-clock time of the last change, milliseconds.
    pub changed_at: i64,
    /// Values of the filter columns as of the last change.
    pub(crate) filter_values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct TrackingTable {
    pub(crate) table: String,
    pub(crate) filter_columns: Vec<String>,
    pub(crate) rows: BTreeMap<Vec<Value>, TrackingRow>,
}

#[derive(Debug, Clone)]
pub(crate) struct TriggerDef {
    pub(crate) table: String,
    pub(crate) kind: TriggerKind,
}

#[derive(Debug, Clone)]
pub(crate) struct ProcedureDef {
    pub(crate) table: String,
    pub(crate) kind: ProcedureKind,
}

#[derive(Debug, Clone)]
pub(crate) struct ScopeTableData {
    pub(crate) kind: ScopeTableKind,
    pub(crate) records: BTreeMap<String, Vec<u8>>,
}

/// Where a local change came from.
enum LocalChange<'a> {
    Upsert(&'a [Value]),
    Delete,
}

#[derive(Debug, Clone)]
pub(crate) struct Database {
    pub(crate) tables: BTreeMap<String, TableData>,
    pub(crate) tracking: BTreeMap<String, TrackingTable>,
    pub(crate) triggers: BTreeMap<String, TriggerDef>,
    pub(crate) procedures: BTreeMap<String, ProcedureDef>,
    pub(crate) scope_tables: BTreeMap<String, ScopeTableData>,
    pub(crate) counter: u64,
    pub(crate) min_valid: u64,
    pub(crate) enforce_foreign_keys: bool,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            tables: BTreeMap::new(),
            tracking: BTreeMap::new(),
            triggers: BTreeMap::new(),
            procedures: BTreeMap::new(),
            scope_tables: BTreeMap::new(),
            counter: 0,
            min_valid: 0,
            enforce_foreign_keys: true,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Database {
    pub(crate) fn object_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
            || self.tracking.contains_key(name)
            || self.triggers.contains_key(name)
            || self.procedures.contains_key(name)
            || self.scope_tables.contains_key(name)
    }

    fn next_timestamp(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub(crate) fn table(&self, name: &str) -> CoreResult<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| CoreError::missing_table(name))
    }

    fn tracking_name_for(&self, table: &str) -> Option<String> {
        self.tracking
            .iter()
            .find(|(_, t)| t.table == table)
            .map(|(name, _)| name.clone())
    }

    fn require_tracking(&self, table: &str) -> CoreResult<String> {
        self.tracking_name_for(table)
            .ok_or_else(|| CoreError::missing_object("tracking table", table))
    }

    fn require_procedure(&self, name: &str, table: &str) -> CoreResult<()> {
        match self.procedures.get(name) {
            Some(def) if def.table == table => Ok(()),
            _ => Err(CoreError::missing_object("stored procedure", name)),
        }
    }

    fn has_trigger(&self, table: &str, kind: TriggerKind) -> bool {
        self.triggers
            .values()
            .any(|t| t.table == table && t.kind == kind)
    }

    pub(crate) fn execute_ddl(&mut self, statement: &DdlStatement) -> CoreResult<()> {
        let name = statement.object_name();
        if statement.is_create() && self.object_exists(name) {
            return Err(CoreError::provisioning(name, "object already exists"));
        }
        if !statement.is_create() && !self.object_exists(name) {
            return Err(CoreError::provisioning(name, "object does not exist"));
        }

        match statement {
            DdlStatement::CreateTable(schema) => {
                schema.primary_key_indices().map_err(|e| {
                    CoreError::provisioning(&schema.name, e.to_string())
                })?;
                if schema.primary_key.is_empty() {
                    return Err(CoreError::provisioning(&schema.name, "table has no primary key"));
                }
                self.tables.insert(
                    schema.name.clone(),
                    TableData {
                        schema: schema.clone(),
                        rows: BTreeMap::new(),
                    },
                );
            }
            DdlStatement::DropTable { name } => {
                self.tables.remove(name);
            }
            DdlStatement::CreateTrackingTable {
                name,
                table,
                filter_columns,
            } => {
                let data = self
                    .tables
                    .get(table)
                    .ok_or_else(|| CoreError::provisioning(name, format!("table {table} not found")))?;
                let filter_indices = filter_columns
                    .iter()
                    .map(|c| {
                        data.schema.column_index(c).ok_or_else(|| {
                            CoreError::provisioning(name, format!("filter column {c} not found"))
                        })
                    })
                    .collect::<CoreResult<Vec<_>>>()?;

                // Rows already present get tracked so they are uploaded once.
                let existing: Vec<(Vec<Value>, Vec<Value>)> = data
                    .rows
                    .iter()
                    .map(|(k, v)| (k.clone(), filter_indices.iter().map(|i| v[*i].clone()).collect()))
                    .collect();
                let mut rows = BTreeMap::new();
                for (key, filter_values) in existing {
                    let ts = self.next_timestamp();
                    let now = now_millis();
                    rows.insert(
                        key,
                        TrackingRow {
                            timestamp: ts,
                            created_timestamp: ts,
                            update_scope_id: None,
                            is_tombstone: false,
                            created_at: now,
                            created_by: None,
                            changed_at: now,
                            filter_values,
                        },
                    );
                }
                tracing::debug!(tracking = %name, backfilled = rows.len(), "tracking table created");
                self.tracking.insert(
                    name.clone(),
                    TrackingTable {
                        table: table.clone(),
                        filter_columns: filter_columns.clone(),
                        rows,
                    },
                );
            }
            DdlStatement::DropTrackingTable { name } => {
                self.tracking.remove(name);
                self.min_valid = self.min_valid.max(self.counter);
            }
            DdlStatement::CreateTrigger { name, table, kind } => {
                self.table(table)
                    .map_err(|e| CoreError::provisioning(name, e.to_string()))?;
                self.triggers.insert(
                    name.clone(),
                    TriggerDef {
                        table: table.clone(),
                        kind: *kind,
                    },
                );
            }
            DdlStatement::DropTrigger { name } => {
                self.triggers.remove(name);
            }
            DdlStatement::CreateProcedure {
                name, table, kind, ..
            } => {
                self.table(table)
                    .map_err(|e| CoreError::provisioning(name, e.to_string()))?;
                self.procedures.insert(
                    name.clone(),
                    ProcedureDef {
                        table: table.clone(),
                        kind: *kind,
                    },
                );
            }
            DdlStatement::DropProcedure { name } => {
                self.procedures.remove(name);
            }
            DdlStatement::CreateScopeTable { name, kind } => {
                self.scope_tables.insert(
                    name.clone(),
                    ScopeTableData {
                        kind: *kind,
                        records: BTreeMap::new(),
                    },
                );
            }
            DdlStatement::DropScopeTable { name } => {
                self.scope_tables.remove(name);
            }
        }
        Ok(())
    }

    pub(crate) fn get_schema(&self, setup: &SyncSetup) -> CoreResult<SyncSchema> {
        let mut tables = Vec::with_capacity(setup.tables.len());
        for table in &setup.tables {
            let data = self.table(&table.name)?;
            let mut schema = data.schema.project(&table.columns)?;
            schema
                .relations
                .retain(|r| setup.table(&r.parent_table).is_some());
            tables.push(schema);
        }
        Ok(SyncSchema::new(tables))
    }

    fn check_parents(&self, schema: &TableSchema, row: &BTreeMap<String, Value>) -> Option<String> {
        for relation in &schema.relations {
            let values: Vec<&Value> = relation
                .columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let parent = match self.tables.get(&relation.parent_table) {
                Some(parent) => parent,
                None => continue,
            };
            let found = parent.rows.values().any(|prow| {
                let pmap = parent.row_map(prow);
                relation
                    .parent_columns
                    .iter()
                    .zip(&values)
                    .all(|(pc, v)| pmap.get(pc) == Some(*v))
            });
            if !found {
                return Some(format!(
                    "foreign key {} violated: no {} row",
                    relation.name, relation.parent_table
                ));
            }
        }
        None
    }

    fn check_children(&self, table: &str, row: &BTreeMap<String, Value>) -> Option<String> {
        for child in self.tables.values() {
            for relation in child.schema.relations.iter().filter(|r| r.parent_table == table) {
                let parent_values: Vec<&Value> = relation
                    .parent_columns
                    .iter()
                    .map(|c| row.get(c).unwrap_or(&Value::Null))
                    .collect();
                let referenced = child.rows.values().any(|crow| {
                    let cmap = child.row_map(crow);
                    relation
                        .columns
                        .iter()
                        .zip(&parent_values)
                        .all(|(cc, v)| cmap.get(cc) == Some(*v))
                });
                if referenced {
                    return Some(format!(
                        "foreign key {} violated: {} rows still reference it",
                        relation.name, child.schema.name
                    ));
                }
            }
        }
        None
    }

    fn filter_values_of(&self, tracking: &str, row: &BTreeMap<String, Value>) -> Vec<Value> {
        self.tracking
            .get(tracking)
            .map(|t| {
                t.filter_columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_tracking(
        &mut self,
        tracking: &str,
        key: Vec<Value>,
        tombstone: bool,
        scope: Option<Uuid>,
        changed_at: i64,
        filter_values: Option<Vec<Value>>,
    ) {
        let ts = self.next_timestamp();
        let Some(table) = self.tracking.get_mut(tracking) else {
            return;
        };
        match table.rows.get_mut(&key) {
            Some(existing) => {
                existing.timestamp = ts;
                existing.update_scope_id = scope;
                existing.is_tombstone = tombstone;
                existing.changed_at = changed_at;
                if let Some(values) = filter_values {
                    existing.filter_values = values;
                }
            }
            None => {
                table.rows.insert(
                    key,
                    TrackingRow {
                        timestamp: ts,
                        created_timestamp: ts,
                        update_scope_id: scope,
                        is_tombstone: tombstone,
                        created_at: now_millis(),
                        created_by: scope,
                        changed_at,
                        filter_values: filter_values.unwrap_or_default(),
                    },
                );
            }
        }
    }

    fn fire_trigger(&mut self, table: &str, kind: TriggerKind, key: Vec<Value>, change: LocalChange<'_>) {
        if !self.has_trigger(table, kind) {
            return;
        }
        let Some(tracking) = self.tracking_name_for(table) else {
            return;
        };
        let (tombstone, filter_values) = match change {
            LocalChange::Upsert(values) => {
                let map = match self.tables.get(table) {
                    Some(data) => data.row_map(values),
                    None => return,
                };
                (false, Some(self.filter_values_of(&tracking, &map)))
            }
            LocalChange::Delete => (true, None),
        };
        self.write_tracking(&tracking, key, tombstone, None, now_millis(), filter_values);
    }

    pub(crate) fn insert_row(&mut self, table: &str, values: Vec<Value>) -> CoreResult<()> {
        let data = self.table(table)?;
        if values.len() != data.schema.columns.len() {
            return Err(CoreError::invalid_operation(format!(
                "table {table} has {} columns, got {}",
                data.schema.columns.len(),
                values.len()
            )));
        }
        for (column, value) in data.schema.columns.iter().zip(&values) {
            column.check(value)?;
        }
        let key = data.schema.key_of(&values)?;
        if data.rows.contains_key(&key) {
            return Err(CoreError::invalid_operation(format!(
                "duplicate key {} in {table}",
                display_key(&key)
            )));
        }
        if self.enforce_foreign_keys {
            if let Some(reason) = self.check_parents(&data.schema, &data.row_map(&values)) {
                return Err(CoreError::invalid_operation(reason));
            }
        }

        if let Some(data) = self.tables.get_mut(table) {
            data.rows.insert(key.clone(), values.clone());
        }
        self.fire_trigger(table, TriggerKind::Insert, key, LocalChange::Upsert(&values));
        Ok(())
    }

    pub(crate) fn update_row(
        &mut self,
        table: &str,
        key: &[Value],
        changes: &[(&str, Value)],
    ) -> CoreResult<()> {
        let data = self.table(table)?;
        let mut row = data.rows.get(key).cloned().ok_or_else(|| {
            CoreError::invalid_operation(format!("no row {} in {table}", display_key(key)))
        })?;
        for (name, value) in changes {
            let index = data.schema.column_index(name).ok_or_else(|| {
                CoreError::invalid_operation(format!("no column {name} in {table}"))
            })?;
            if data.schema.primary_key.iter().any(|pk| pk == name) {
                return Err(CoreError::invalid_operation("primary key columns cannot be updated"));
            }
            data.schema.columns[index].check(value)?;
            row[index] = value.clone();
        }
        if self.enforce_foreign_keys {
            if let Some(reason) = self.check_parents(&data.schema, &data.row_map(&row)) {
                return Err(CoreError::invalid_operation(reason));
            }
        }

        if let Some(data) = self.tables.get_mut(table) {
            data.rows.insert(key.to_vec(), row.clone());
        }
        self.fire_trigger(table, TriggerKind::Update, key.to_vec(), LocalChange::Upsert(&row));
        Ok(())
    }

    pub(crate) fn delete_row(&mut self, table: &str, key: &[Value]) -> CoreResult<()> {
        let data = self.table(table)?;
        let row = data.rows.get(key).ok_or_else(|| {
            CoreError::invalid_operation(format!("no row {} in {table}", display_key(key)))
        })?;
        if self.enforce_foreign_keys {
            if let Some(reason) = self.check_children(table, &data.row_map(row)) {
                return Err(CoreError::invalid_operation(reason));
            }
        }

        if let Some(data) = self.tables.get_mut(table) {
            data.rows.remove(key);
        }
        self.fire_trigger(table, TriggerKind::Delete, key.to_vec(), LocalChange::Delete);
        Ok(())
    }

    pub(crate) fn select_changes(&self, request: &SelectChanges<'_>) -> CoreResult<Vec<SyncRow>> {
        let table_name = request.table.name.as_str();
        self.require_procedure(request.procedure, table_name)?;
        let data = self.table(table_name)?;
        let tracking = self
            .tracking
            .get(&self.require_tracking(table_name)?)
            .ok_or_else(|| CoreError::missing_object("tracking table", table_name))?;

        let mut rows = Vec::new();
        for (key, track) in &tracking.rows {
            if track.timestamp <= request.since || track.is_tombstone != request.tombstones {
                continue;
            }
            if request.exclude_scope_id.is_some() && track.update_scope_id == request.exclude_scope_id {
                continue;
            }

            let full: BTreeMap<String, Value> = if track.is_tombstone {
                let mut map: BTreeMap<String, Value> = data
                    .schema
                    .primary_key
                    .iter()
                    .cloned()
                    .zip(key.iter().cloned())
                    .collect();
                for (column, value) in tracking.filter_columns.iter().zip(&track.filter_values) {
                    map.insert(column.clone(), value.clone());
                }
                map
            } else {
                match data.rows.get(key) {
                    Some(values) => data.row_map(values),
                    None => continue,
                }
            };

            if let Some(filter) = request.filter {
                let matched = if track.is_tombstone {
                    tombstone_matches(self, filter, &full)
                } else {
                    row_matches(self, filter, &full)
                };
                if !matched {
                    continue;
                }
            }

            let values = request
                .table
                .columns
                .iter()
                .map(|c| {
                    let keep = !track.is_tombstone || request.table.primary_key.contains(&c.name);
                    match (keep, full.get(&c.name)) {
                        (true, Some(v)) => v.clone(),
                        _ => Value::Null,
                    }
                })
                .collect();

            let state = if track.is_tombstone {
                RowState::Deleted
            } else if track.created_timestamp > request.since {
                RowState::Inserted
            } else {
                RowState::Modified
            };

            rows.push(SyncRow {
                state,
                values,
                timestamp: track.timestamp,
                update_scope_id: track.update_scope_id,
                changed_at: track.changed_at,
            });
        }
        Ok(rows)
    }

    pub(crate) fn apply_rows(
        &mut self,
        schema: &TableSchema,
        columns: &[String],
        rows: &[SyncRow],
        context: &ApplyContext,
    ) -> CoreResult<ApplyOutcome> {
        let table_name = schema.name.as_str();
        self.require_procedure(&context.update_procedure, table_name)?;
        self.require_procedure(&context.delete_procedure, table_name)?;
        let tracking_name = self.require_tracking(table_name)?;
        let storage = self.table(table_name)?.schema.clone();

        let pk_positions: Vec<Option<usize>> = storage
            .primary_key
            .iter()
            .map(|pk| columns.iter().position(|c| c == pk))
            .collect();
        if pk_positions.iter().any(Option::is_none) {
            return Err(CoreError::invalid_operation(format!(
                "rows for {table_name} do not carry the full primary key"
            )));
        }
        let check_fk = context.check_constraints && self.enforce_foreign_keys;

        let mut outcome = ApplyOutcome::default();
        for row in rows {
            let key: Vec<Value> = pk_positions
                .iter()
                .flatten()
                .map(|i| row.values.get(*i).cloned().unwrap_or(Value::Null))
                .collect();

            let track = self
                .tracking
                .get(&tracking_name)
                .and_then(|t| t.rows.get(&key))
                .cloned();
            let local = self.tables.get(table_name).and_then(|d| d.rows.get(&key)).cloned();

            if !context.force {
                if let Some(track) = &track {
                    if track.timestamp > context.last_sync_timestamp
                        && track.update_scope_id != Some(context.sender_scope_id)
                    {
                        let local_row = self.local_version(&storage, schema, &key, local.as_deref(), track);
                        outcome.conflicts.push(ConflictRow {
                            remote: row.clone(),
                            local: local_row,
                        });
                        continue;
                    }
                }
            }

            if let Some(track) = &track {
                if track.update_scope_id == context.write_scope_id {
                    let unchanged = if row.state.is_delete() {
                        track.is_tombstone && local.is_none()
                    } else {
                        !track.is_tombstone
                            && local.as_ref().is_some_and(|l| {
                                columns.iter().zip(&row.values).all(|(c, v)| {
                                    storage.column_index(c).and_then(|i| l.get(i)) == Some(v)
                                })
                            })
                    };
                    if unchanged {
                        outcome.applied += 1;
                        continue;
                    }
                }
            }

            if row.state.is_delete() {
                if let Some(existing) = &local {
                    if check_fk {
                        let map = self.table(table_name)?.row_map(existing);
                        if let Some(reason) = self.check_children(table_name, &map) {
                            outcome.failed.push(FailedRow::new(table_name, key, reason));
                            continue;
                        }
                    }
                }
                if let Some(data) = self.tables.get_mut(table_name) {
                    data.rows.remove(&key);
                }
                self.write_tracking(
                    &tracking_name,
                    key,
                    true,
                    context.write_scope_id,
                    row.changed_at,
                    None,
                );
                outcome.applied += 1;
                continue;
            }

            let mut values = local
                .clone()
                .unwrap_or_else(|| vec![Value::Null; storage.columns.len()]);
            let mut invalid = None;
            for (column, value) in columns.iter().zip(&row.values) {
                match storage.column_index(column) {
                    Some(i) => values[i] = value.clone(),
                    None => {
                        invalid = Some(format!("unknown column {column}"));
                        break;
                    }
                }
            }
            if invalid.is_none() {
                invalid = storage
                    .columns
                    .iter()
                    .zip(&values)
                    .find_map(|(c, v)| c.check(v).err().map(|e| e.to_string()));
            }
            let map = self.table(table_name)?.row_map(&values);
            if invalid.is_none() && check_fk {
                invalid = self.check_parents(&storage, &map);
            }
            if let Some(reason) = invalid {
                outcome.failed.push(FailedRow::new(table_name, key, reason));
                continue;
            }

            let filter_values = self.filter_values_of(&tracking_name, &map);
            if let Some(data) = self.tables.get_mut(table_name) {
                data.rows.insert(key.clone(), values);
            }
            self.write_tracking(
                &tracking_name,
                key,
                false,
                context.write_scope_id,
                row.changed_at,
                Some(filter_values),
            );
            outcome.applied += 1;
        }
        Ok(outcome)
    }

    fn local_version(
        &self,
        storage: &TableSchema,
        projected: &TableSchema,
        key: &[Value],
        local: Option<&[Value]>,
        track: &TrackingRow,
    ) -> SyncRow {
        let values = projected
            .columns
            .iter()
            .map(|c| match (local, storage.column_index(&c.name)) {
                (Some(row), Some(i)) => row.get(i).cloned().unwrap_or(Value::Null),
                _ => projected
                    .primary_key
                    .iter()
                    .position(|pk| *pk == c.name)
                    .and_then(|i| key.get(i).cloned())
                    .unwrap_or(Value::Null),
            })
            .collect();
        SyncRow {
            state: if local.is_none() || track.is_tombstone {
                RowState::Deleted
            } else {
                RowState::Modified
            },
            values,
            timestamp: track.timestamp,
            update_scope_id: track.update_scope_id,
            changed_at: track.changed_at,
        }
    }

    pub(crate) fn reset_table(&mut self, table: &str, procedure: &str) -> CoreResult<()> {
        self.require_procedure(procedure, table)?;
        let tracking = self.require_tracking(table)?;
        if let Some(data) = self.tables.get_mut(table) {
            data.rows.clear();
        }
        if let Some(t) = self.tracking.get_mut(&tracking) {
            t.rows.clear();
        }
        Ok(())
    }

    pub(crate) fn delete_metadata(&mut self, tracking_tables: &[String], older_than: u64) -> CoreResult<usize> {
        let mut purged = 0;
        for name in tracking_tables {
            let table = self
                .tracking
                .get_mut(name)
                .ok_or_else(|| CoreError::missing_object("tracking table", name))?;
            let before = table.rows.len();
            table
                .rows
                .retain(|_, t| !(t.is_tombstone && t.timestamp <= older_than));
            purged += before - table.rows.len();
        }
        self.min_valid = self.min_valid.max(older_than);
        Ok(purged)
    }

    pub(crate) fn scope_table(&self, name: &str) -> CoreResult<&ScopeTableData> {
        self.scope_tables
            .get(name)
            .ok_or_else(|| CoreError::missing_object("scope table", name))
    }

    pub(crate) fn scope_table_mut(&mut self, name: &str) -> CoreResult<&mut ScopeTableData> {
        self.scope_tables
            .get_mut(name)
            .ok_or_else(|| CoreError::missing_object("scope table", name))
    }
}
