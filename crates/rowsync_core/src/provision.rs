//! Creation and removal of change-tracking infrastructure.
//!
//! Each [`ProvisionFlags`] category is handled independently. Provisioning
//! skips objects that already exist and deprovisioning skips objects that are
//! already gone, so both are safe to repeat.

use crate::error::CoreResult;
use crate::provider::{DdlStatement, ProcedureKind, ProvisionFlags, ScopeTableKind, StorageProvider, TriggerKind};
use crate::schema::SyncSchema;
use crate::setup::SyncSetup;

/// Objects touched by a provisioning call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Objects created or dropped.
    pub executed: Vec<String>,
    /// Objects left alone because they were already in the requested state.
    pub skipped: Vec<String>,
}

/// Generates and runs DDL for a setup.
#[derive(Debug, Clone)]
pub struct Provisioner<'a> {
    setup: &'a SyncSetup,
    schema: &'a SyncSchema,
}

impl<'a> Provisioner<'a> {
    /// Creates a provisioner. `schema` must describe every table of `setup`.
    pub fn new(setup: &'a SyncSetup, schema: &'a SyncSchema) -> Self {
        Self { setup, schema }
    }

    /// Statements creating the objects selected by `flags`, in execution order.
    pub fn create_statements(&self, flags: ProvisionFlags) -> CoreResult<Vec<DdlStatement>> {
        let naming = &self.setup.naming;
        let mut statements = Vec::new();

        if flags.contains(ProvisionFlags::TABLE) {
            for table in self.schema.dependency_order() {
                statements.push(DdlStatement::CreateTable(table.clone()));
            }
        }

        for table in &self.setup.tables {
            self.schema.require(&table.name)?;
            let name = table.name.as_str();
            let filter = self.setup.filter_for(name);

            if flags.contains(ProvisionFlags::TRACKING_TABLE) {
                statements.push(DdlStatement::CreateTrackingTable {
                    name: naming.tracking_table_name(name),
                    table: name.to_string(),
                    filter_columns: filter.map(|f| f.tracked_columns()).unwrap_or_default(),
                });
            }

            if flags.contains(ProvisionFlags::TRIGGERS) {
                for kind in TriggerKind::ALL {
                    statements.push(DdlStatement::CreateTrigger {
                        name: naming.trigger_name(name, kind),
                        table: name.to_string(),
                        kind,
                    });
                }
            }

            if flags.contains(ProvisionFlags::STORED_PROCEDURES) {
                for kind in ProcedureKind::ALL {
                    statements.push(DdlStatement::CreateProcedure {
                        name: naming.procedure_name(name, kind, None),
                        table: name.to_string(),
                        kind,
                        filter: None,
                    });
                }
                if let Some(filter) = filter {
                    statements.push(DdlStatement::CreateProcedure {
                        name: self.setup.select_procedure(name),
                        table: name.to_string(),
                        kind: ProcedureKind::SelectChanges,
                        filter: Some(filter.name()),
                    });
                }
            }
        }

        if flags.contains(ProvisionFlags::SCOPE_TABLE) {
            statements.push(DdlStatement::CreateScopeTable {
                name: naming.scope_info_table.clone(),
                kind: ScopeTableKind::Info,
            });
            statements.push(DdlStatement::CreateScopeTable {
                name: naming.scope_history_table.clone(),
                kind: ScopeTableKind::History,
            });
        }

        Ok(statements)
    }

    /// Statements dropping the objects selected by `flags`, in execution order.
    pub fn drop_statements(&self, flags: ProvisionFlags) -> CoreResult<Vec<DdlStatement>> {
        let mut statements: Vec<DdlStatement> = self
            .create_statements(flags)?
            .into_iter()
            .rev()
            .map(|statement| {
                let name = statement.object_name().to_string();
                match statement {
                    DdlStatement::CreateTable(_) => DdlStatement::DropTable { name },
                    DdlStatement::CreateTrackingTable { .. } => DdlStatement::DropTrackingTable { name },
                    DdlStatement::CreateTrigger { .. } => DdlStatement::DropTrigger { name },
                    DdlStatement::CreateProcedure { .. } => DdlStatement::DropProcedure { name },
                    _ => DdlStatement::DropScopeTable { name },
                }
            })
            .collect();
        // Triggers go before the tracking tables they write to.
        statements.sort_by_key(|s| !matches!(s, DdlStatement::DropTrigger { .. }));
        Ok(statements)
    }

    /// Creates the objects selected by `flags` inside `txn`.
    pub async fn provision<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        flags: ProvisionFlags,
    ) -> CoreResult<ProvisionReport> {
        let statements = self.create_statements(flags)?;
        let report = run(provider, txn, statements, true).await?;
        tracing::info!(
            engine = provider.engine(),
            flags = ?flags,
            created = report.executed.len(),
            skipped = report.skipped.len(),
            "provisioned"
        );
        Ok(report)
    }

    /// Drops the objects selected by `flags` inside `txn`.
    ///
    /// Dropping tracking tables discards change history; clients that
    /// synchronized before become outdated.
    pub async fn deprovision<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        flags: ProvisionFlags,
    ) -> CoreResult<ProvisionReport> {
        let statements = self.drop_statements(flags)?;
        let report = run(provider, txn, statements, false).await?;
        tracing::info!(
            engine = provider.engine(),
            flags = ?flags,
            dropped = report.executed.len(),
            skipped = report.skipped.len(),
            "deprovisioned"
        );
        Ok(report)
    }
}

async fn run<P: StorageProvider>(
    provider: &P,
    txn: &mut P::Transaction,
    statements: Vec<DdlStatement>,
    create: bool,
) -> CoreResult<ProvisionReport> {
    let mut report = ProvisionReport::default();
    for statement in statements {
        let name = statement.object_name().to_string();
        if provider.object_exists(txn, &name).await? == create {
            report.skipped.push(name);
            continue;
        }
        provider.execute_ddl(txn, &statement).await?;
        report.executed.push(name);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{JoinKind, SetupFilter};
    use crate::schema::{ColumnSchema, Relation, TableSchema};
    use rowsync_codec::DataType;

    fn schema() -> SyncSchema {
        SyncSchema::new(vec![
            TableSchema::new(
                "Order",
                vec![
                    ColumnSchema::new("id", DataType::Integer),
                    ColumnSchema::new("customer_id", DataType::Integer),
                ],
                &["id"],
            )
            .with_relation(Relation::new("fk", &["customer_id"], "Customer", &["id"])),
            TableSchema::new(
                "Customer",
                vec![ColumnSchema::new("id", DataType::Integer)],
                &["id"],
            ),
        ])
    }

    #[test]
    fn tables_created_parents_first() {
        let setup = SyncSetup::new(["Order", "Customer"]);
        let schema = schema();
        let statements = Provisioner::new(&setup, &schema)
            .create_statements(ProvisionFlags::TABLE)
            .unwrap();
        let names: Vec<&str> = statements.iter().map(DdlStatement::object_name).collect();
        assert_eq!(names, vec!["Customer", "Order"]);
    }

    #[test]
    fn filtered_table_gets_specialised_select() {
        let setup = SyncSetup::new(["Order", "Customer"]).with_filter(
            SetupFilter::new("Order")
                .with_parameter("CustomerId", "Customer", "id")
                .with_join(JoinKind::Inner, "Customer", ("Customer", "id"), ("Order", "customer_id"))
                .with_where("Customer", "id", "CustomerId"),
        );
        let schema = schema();
        let statements = Provisioner::new(&setup, &schema)
            .create_statements(ProvisionFlags::STORED_PROCEDURES)
            .unwrap();
        assert!(statements
            .iter()
            .any(|s| s.object_name() == "Order_changes_CustomerId"));
        assert_eq!(statements.len(), 9);
    }

    #[test]
    fn drops_triggers_first() {
        let setup = SyncSetup::new(["Customer"]);
        let schema = schema();
        let statements = Provisioner::new(&setup, &schema)
            .drop_statements(ProvisionFlags::tracking())
            .unwrap();
        assert!(matches!(statements[0], DdlStatement::DropTrigger { .. }));
        assert!(statements
            .iter()
            .all(|s| !s.is_create()));
    }

    #[test]
    fn missing_schema_table_is_reported() {
        let setup = SyncSetup::new(["Invoice"]);
        let schema = schema();
        assert!(Provisioner::new(&setup, &schema)
            .create_statements(ProvisionFlags::TRACKING_TABLE)
            .is_err());
    }
}
