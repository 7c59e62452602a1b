//! Sync setup: which tables replicate, in which direction, under which names.

use crate::error::{CoreError, CoreResult};
use crate::filter::SetupFilter;
use crate::provider::{ProcedureKind, TriggerKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which way rows of a table flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Rows flow both ways.
    #[default]
    Bidirectional,
    /// Client rows are uploaded; server rows are never downloaded.
    UploadOnly,
    /// Server rows are downloaded; client rows are never uploaded.
    DownloadOnly,
}

impl SyncDirection {
    /// Returns true if client changes to this table are uploaded.
    pub fn uploads(&self) -> bool {
        matches!(self, SyncDirection::Bidirectional | SyncDirection::UploadOnly)
    }

    /// Returns true if server changes to this table are downloaded.
    pub fn downloads(&self) -> bool {
        matches!(
            self,
            SyncDirection::Bidirectional | SyncDirection::DownloadOnly
        )
    }
}

/// Which side of the replication a component runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncSide {
    /// The client replica.
    Client,
    /// The authoritative server store.
    Server,
}

impl SyncSide {
    /// Returns true if this side selects changes of a table with `direction`.
    pub fn selects(&self, direction: SyncDirection) -> bool {
        match self {
            SyncSide::Client => direction.uploads(),
            SyncSide::Server => direction.downloads(),
        }
    }

    /// Returns a short lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSide::Client => "client",
            SyncSide::Server => "server",
        }
    }
}

/// A table taking part in a setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTable {
    /// Table name.
    pub name: String,
    /// Optional schema qualifier.
    pub schema_name: Option<String>,
    /// Columns to replicate. Empty means every column.
    pub columns: Vec<String>,
    /// Direction of replication.
    pub direction: SyncDirection,
}

impl SetupTable {
    /// Creates a bidirectional table replicating every column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_name: None,
            columns: Vec::new(),
            direction: SyncDirection::Bidirectional,
        }
    }

    /// Sets the schema qualifier.
    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    /// Restricts replication to the given columns.
    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Sets the direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Returns `schema.name`, or just the name when unqualified.
    pub fn qualified_name(&self) -> String {
        match &self.schema_name {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Prefixes and suffixes for generated objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingOptions {
    /// Prefix of tracking tables.
    pub tracking_table_prefix: String,
    /// Suffix of tracking tables.
    pub tracking_table_suffix: String,
    /// Prefix of triggers.
    pub trigger_prefix: String,
    /// Suffix of triggers.
    pub trigger_suffix: String,
    /// Prefix of stored procedures.
    pub procedure_prefix: String,
    /// Suffix of stored procedures.
    pub procedure_suffix: String,
    /// Name of the table holding scope records.
    pub scope_info_table: String,
    /// Name of the server table holding per-client history.
    pub scope_history_table: String,
}

impl NamingOptions {
    /// Name of the tracking table for `table`.
    pub fn tracking_table_name(&self, table: &str) -> String {
        format!(
            "{}{table}{}",
            self.tracking_table_prefix, self.tracking_table_suffix
        )
    }

    /// Name of a change-capture trigger.
    pub fn trigger_name(&self, table: &str, kind: TriggerKind) -> String {
        format!(
            "{}{table}_{}{}",
            self.trigger_prefix,
            kind.as_str(),
            self.trigger_suffix
        )
    }

    /// Name of a stored procedure, optionally specialised for a filter.
    pub fn procedure_name(&self, table: &str, kind: ProcedureKind, filter: Option<&str>) -> String {
        match filter {
            Some(filter) => format!(
                "{}{table}_{}_{filter}{}",
                self.procedure_prefix,
                kind.as_str(),
                self.procedure_suffix
            ),
            None => format!(
                "{}{table}_{}{}",
                self.procedure_prefix,
                kind.as_str(),
                self.procedure_suffix
            ),
        }
    }

    /// Sets the tracking table prefix and suffix.
    pub fn with_tracking_table(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.tracking_table_prefix = prefix.into();
        self.tracking_table_suffix = suffix.into();
        self
    }

    /// Sets the trigger prefix and suffix.
    pub fn with_triggers(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.trigger_prefix = prefix.into();
        self.trigger_suffix = suffix.into();
        self
    }

    /// Sets the stored procedure prefix and suffix.
    pub fn with_procedures(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.procedure_prefix = prefix.into();
        self.procedure_suffix = suffix.into();
        self
    }

    /// Sets the scope table names.
    pub fn with_scope_tables(mut self, info: impl Into<String>, history: impl Into<String>) -> Self {
        self.scope_info_table = info.into();
        self.scope_history_table = history.into();
        self
    }
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            tracking_table_prefix: String::new(),
            tracking_table_suffix: "_tracking".into(),
            trigger_prefix: String::new(),
            trigger_suffix: "_trigger".into(),
            procedure_prefix: String::new(),
            procedure_suffix: String::new(),
            scope_info_table: "scope_info".into(),
            scope_history_table: "scope_info_client".into(),
        }
    }
}

/// The configuration of a sync scope.
///
/// A setup is immutable once a scope is provisioned against it. Changing it
/// changes its [`fingerprint`](SyncSetup::fingerprint) and causes the
/// orchestrators to re-provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSetup {
    /// Replicated tables in setup order.
    pub tables: Vec<SetupTable>,
    /// Row filters, at most one per table.
    pub filters: Vec<SetupFilter>,
    /// Naming of generated objects.
    pub naming: NamingOptions,
}

impl SyncSetup {
    /// Creates a setup replicating whole tables in both directions.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(SetupTable::new).collect(),
            filters: Vec::new(),
            naming: NamingOptions::default(),
        }
    }

    /// Adds or replaces a table definition.
    pub fn with_table(mut self, table: SetupTable) -> Self {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
        self
    }

    /// Adds a filter.
    pub fn with_filter(mut self, filter: SetupFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the naming options.
    pub fn with_naming(mut self, naming: NamingOptions) -> Self {
        self.naming = naming;
        self
    }

    /// Finds a table definition.
    pub fn table(&self, name: &str) -> Option<&SetupTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns the filter declared for `table`, if any.
    pub fn filter_for(&self, table: &str) -> Option<&SetupFilter> {
        self.filters.iter().find(|f| f.table == table)
    }

    /// Name of the select procedure for `table`, specialised for its filter.
    pub fn select_procedure(&self, table: &str) -> String {
        let filter = self.filter_for(table).map(SetupFilter::name);
        self.naming
            .procedure_name(table, ProcedureKind::SelectChanges, filter.as_deref())
    }

    /// Name of a non-select procedure for `table`.
    pub fn procedure(&self, table: &str, kind: ProcedureKind) -> String {
        self.naming.procedure_name(table, kind, None)
    }

    /// Checks the structural rules of the setup and of every filter.
    pub fn validate(&self) -> CoreResult<()> {
        if self.tables.is_empty() {
            return Err(CoreError::invalid_setup("setup has no tables"));
        }

        let mut seen = BTreeSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(CoreError::invalid_setup(format!(
                    "table {} declared twice",
                    table.name
                )));
            }
        }

        let mut filtered = BTreeSet::new();
        for filter in &self.filters {
            if self.table(&filter.table).is_none() {
                return Err(CoreError::invalid_setup(format!(
                    "filter targets table {} which is not in the setup",
                    filter.table
                )));
            }
            if !filtered.insert(filter.table.as_str()) {
                return Err(CoreError::invalid_setup(format!(
                    "table {} has more than one filter",
                    filter.table
                )));
            }
            filter.validate()?;
        }

        Ok(())
    }

    /// Returns the stable fingerprint identifying this setup version.
    pub fn fingerprint(&self) -> CoreResult<String> {
        Ok(rowsync_codec::fingerprint(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SetupFilter;

    #[test]
    fn direction_by_side() {
        assert!(SyncSide::Client.selects(SyncDirection::UploadOnly));
        assert!(!SyncSide::Client.selects(SyncDirection::DownloadOnly));
        assert!(SyncSide::Server.selects(SyncDirection::DownloadOnly));
        assert!(!SyncSide::Server.selects(SyncDirection::UploadOnly));
    }

    #[test]
    fn generated_names() {
        let naming = NamingOptions::default();
        assert_eq!(naming.tracking_table_name("Customer"), "Customer_tracking");
        assert_eq!(
            naming.trigger_name("Customer", TriggerKind::Delete),
            "Customer_delete_trigger"
        );
        assert_eq!(
            naming.procedure_name("Order", ProcedureKind::SelectChanges, Some("CustomerId")),
            "Order_changes_CustomerId"
        );

        let naming = NamingOptions::default().with_tracking_table("t_", "");
        assert_eq!(naming.tracking_table_name("Customer"), "t_Customer");
    }

    #[test]
    fn fingerprint_changes_with_setup() {
        let a = SyncSetup::new(["Customer"]);
        let b = SyncSetup::new(["Customer", "Order"]);
        assert_eq!(a.fingerprint().unwrap(), a.clone().fingerprint().unwrap());
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn with_table_replaces() {
        let setup = SyncSetup::new(["Customer"])
            .with_table(SetupTable::new("Customer").with_direction(SyncDirection::DownloadOnly));
        assert_eq!(setup.tables.len(), 1);
        assert_eq!(setup.tables[0].direction, SyncDirection::DownloadOnly);
    }

    #[test]
    fn validate_rejects_duplicates_and_orphan_filters() {
        let setup = SyncSetup::new(["Customer", "Customer"]);
        assert!(setup.validate().is_err());

        let setup = SyncSetup::new(["Customer"]).with_filter(SetupFilter::new("Order"));
        assert!(setup.validate().is_err());

        assert!(SyncSetup::new(Vec::<String>::new()).validate().is_err());
    }
}
