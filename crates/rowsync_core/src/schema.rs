//! Table schemas as seen by the sync engine.

use crate::error::{CoreError, CoreResult};
use rowsync_codec::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One column of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub data_type: DataType,
    /// Whether the column accepts `NULL`.
    pub nullable: bool,
    /// Maximum length for text and bytes columns.
    pub max_len: Option<usize>,
}

impl ColumnSchema {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            max_len: None,
        }
    }

    /// Marks the column nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the maximum length.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Checks a value against this column's type, length and nullability.
    pub fn check(&self, value: &Value) -> CoreResult<()> {
        if value.is_null() && !self.nullable {
            return Err(CoreError::invalid_operation(format!(
                "column {} is not nullable",
                self.name
            )));
        }
        value.check_type(self.data_type, self.max_len)?;
        Ok(())
    }
}

/// A foreign key from a child table to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation name.
    pub name: String,
    /// Columns of the child table.
    pub columns: Vec<String>,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced columns, aligned with `columns`.
    pub parent_columns: Vec<String>,
}

impl Relation {
    /// Creates a relation.
    pub fn new(
        name: impl Into<String>,
        columns: &[&str],
        parent_table: impl Into<String>,
        parent_columns: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            parent_table: parent_table.into(),
            parent_columns: parent_columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Schema of one replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in storage order.
    pub columns: Vec<ColumnSchema>,
    /// Primary key column names.
    pub primary_key: Vec<String>,
    /// Foreign keys to other tables.
    pub relations: Vec<Relation>,
}

impl TableSchema {
    /// Creates a table schema without relations.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            relations: Vec::new(),
        }
    }

    /// Adds a relation.
    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Finds a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the position of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns all column names in storage order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Returns the storage positions of the primary key columns.
    pub fn primary_key_indices(&self) -> CoreResult<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|pk| {
                self.column_index(pk).ok_or_else(|| {
                    CoreError::invalid_setup(format!(
                        "primary key column {pk} missing from table {}",
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// Extracts the primary key from a full row.
    pub fn key_of(&self, values: &[Value]) -> CoreResult<Vec<Value>> {
        Ok(self
            .primary_key_indices()?
            .into_iter()
            .map(|i| values.get(i).cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// Returns a copy restricted to `columns`, always keeping the primary key.
    ///
    /// An empty list keeps every column. Relations whose columns are not all
    /// kept are dropped.
    pub fn project(&self, columns: &[String]) -> CoreResult<TableSchema> {
        if columns.is_empty() {
            return Ok(self.clone());
        }

        for name in columns {
            if self.column(name).is_none() {
                return Err(CoreError::invalid_setup(format!(
                    "column {name} not found in table {}",
                    self.name
                )));
            }
        }

        let keep: BTreeSet<&str> = columns
            .iter()
            .map(String::as_str)
            .chain(self.primary_key.iter().map(String::as_str))
            .collect();

        Ok(TableSchema {
            name: self.name.clone(),
            columns: self
                .columns
                .iter()
                .filter(|c| keep.contains(c.name.as_str()))
                .cloned()
                .collect(),
            primary_key: self.primary_key.clone(),
            relations: self
                .relations
                .iter()
                .filter(|r| r.columns.iter().all(|c| keep.contains(c.as_str())))
                .cloned()
                .collect(),
        })
    }
}

/// The schema of every table in a setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchema {
    /// Tables in setup order.
    pub tables: Vec<TableSchema>,
}

impl SyncSchema {
    /// Creates a schema from tables.
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    /// Finds a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Finds a table by name or fails with `MissingTable`.
    pub fn require(&self, name: &str) -> CoreResult<&TableSchema> {
        self.table(name).ok_or_else(|| CoreError::missing_table(name))
    }

    /// Returns the tables ordered parents before children.
    ///
    /// Self references are ignored. Tables caught in a reference cycle keep
    /// their setup order after every table that could be ordered.
    pub fn dependency_order(&self) -> Vec<&TableSchema> {
        let names: BTreeSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let mut parents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for table in &self.tables {
            let deps = table
                .relations
                .iter()
                .map(|r| r.parent_table.as_str())
                .filter(|p| *p != table.name && names.contains(p))
                .collect();
            parents.insert(table.name.as_str(), deps);
        }

        let mut ordered: Vec<&TableSchema> = Vec::with_capacity(self.tables.len());
        let mut placed: BTreeSet<&str> = BTreeSet::new();

        loop {
            let before = placed.len();
            for table in &self.tables {
                if placed.contains(table.name.as_str()) {
                    continue;
                }
                let ready = parents
                    .get(table.name.as_str())
                    .map(|deps| deps.iter().all(|d| placed.contains(d)))
                    .unwrap_or(true);
                if ready {
                    placed.insert(table.name.as_str());
                    ordered.push(table);
                }
            }
            if placed.len() == before {
                break;
            }
        }

        for table in &self.tables {
            if !placed.contains(table.name.as_str()) {
                tracing::warn!(table = %table.name, "reference cycle, keeping setup order");
                ordered.push(table);
            }
        }

        ordered
    }
}
