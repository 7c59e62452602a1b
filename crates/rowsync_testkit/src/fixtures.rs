//! Test fixtures and replica helpers.
//!
//! Provides a small sales schema, setups over it and a harness holding a
//! server store, a client store and a scratch directory for batches.

use rowsync_codec::{DataType, Value};
use rowsync_core::{
    ColumnSchema, MemoryProvider, Relation, SetupFilter, SyncParameters, SyncSchema, SyncSetup, TableSchema,
};
use std::path::PathBuf;
use tempfile::TempDir;

/// Name of the filter parameter of [`filtered_setup`].
pub const CUSTOMER_PARAMETER: &str = "CustomerId";

/// The `Customer` table: `id`, `name`, nullable `region`.
pub fn customer_table() -> TableSchema {
    TableSchema::new(
        "Customer",
        vec![
            ColumnSchema::new("id", DataType::Integer),
            ColumnSchema::new("name", DataType::Text),
            ColumnSchema::new("region", DataType::Text).nullable(),
        ],
        &["id"],
    )
}

/// The `Order` table: `id`, `customer_id` referencing `Customer`, `amount`.
pub fn order_table() -> TableSchema {
    TableSchema::new(
        "Order",
        vec![
            ColumnSchema::new("id", DataType::Integer),
            ColumnSchema::new("customer_id", DataType::Integer),
            ColumnSchema::new("amount", DataType::Integer),
        ],
        &["id"],
    )
    .with_relation(Relation::new("fk_order_customer", &["customer_id"], "Customer", &["id"]))
}

/// Schema holding `Customer` only.
pub fn customer_schema() -> SyncSchema {
    SyncSchema::new(vec![customer_table()])
}

/// Schema holding `Customer` and `Order`.
pub fn sales_schema() -> SyncSchema {
    SyncSchema::new(vec![customer_table(), order_table()])
}

/// Setup replicating `Customer`.
pub fn customer_setup() -> SyncSetup {
    SyncSetup::new(["Customer"])
}

/// Setup replicating `Customer` and `Order`.
pub fn sales_setup() -> SyncSetup {
    SyncSetup::new(["Customer", "Order"])
}

/// Setup replicating `Customer` and the orders of one customer, chosen
/// with the [`CUSTOMER_PARAMETER`] parameter.
pub fn filtered_setup() -> SyncSetup {
    sales_setup().with_filter(
        SetupFilter::new("Order")
            .with_parameter(CUSTOMER_PARAMETER, "Order", "customer_id")
            .with_where("Order", "customer_id", CUSTOMER_PARAMETER),
    )
}

/// Parameters selecting the orders of `customer_id`.
pub fn customer_parameters(customer_id: i64) -> SyncParameters {
    SyncParameters::new().with(CUSTOMER_PARAMETER, customer_id)
}

/// A `Customer` row without region.
pub fn customer(id: i64, name: &str) -> Vec<Value> {
    vec![id.into(), name.into(), Value::Null]
}

/// An `Order` row.
pub fn order(id: i64, customer_id: i64, amount: i64) -> Vec<Value> {
    vec![id.into(), customer_id.into(), amount.into()]
}

/// Creates a store holding the tables of `schema`, without any tracking.
pub async fn store_with_tables(name: &str, schema: &SyncSchema) -> MemoryProvider {
    let db = MemoryProvider::new(name);
    for table in &schema.tables {
        db.create_table(table.clone())
            .await
            .expect("Failed to create table");
    }
    db
}

/// A server store with tables, an empty client store and a scratch
/// directory, cleaned up on drop.
pub struct TestReplicas {
    /// Authoritative store.
    pub server: MemoryProvider,
    /// Client store, provisioned by the first synchronization.
    pub client: MemoryProvider,
    temp_dir: TempDir,
}

impl TestReplicas {
    /// Creates the replicas. Only the server holds the tables of `schema`.
    pub async fn new(schema: &SyncSchema) -> Self {
        Self {
            server: store_with_tables("server", schema).await,
            client: MemoryProvider::new("client"),
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Adds another empty client store.
    pub fn another_client(&self, name: &str) -> MemoryProvider {
        MemoryProvider::new(name)
    }

    /// A directory under the scratch directory, not created yet.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

/// Returns every row of `table`, or nothing if the table does not exist.
pub async fn rows_of(db: &MemoryProvider, table: &str) -> Vec<Vec<Value>> {
    db.rows(table).await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setups_are_valid() {
        assert!(customer_setup().validate().is_ok());
        assert!(sales_setup().validate().is_ok());
        assert!(filtered_setup().validate().is_ok());
        assert_ne!(
            sales_setup().fingerprint().unwrap(),
            filtered_setup().fingerprint().unwrap()
        );
    }

    #[tokio::test]
    async fn replicas_start_apart() {
        let replicas = TestReplicas::new(&sales_schema()).await;
        replicas.server.insert_row("Customer", customer(1, "A")).await.unwrap();
        assert_eq!(rows_of(&replicas.server, "Customer").await.len(), 1);
        assert!(rows_of(&replicas.client, "Customer").await.is_empty());
        assert!(!replicas.path("batches").exists());
    }
}
