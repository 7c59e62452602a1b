//! Provision, select, batch and apply across two in-memory stores.

use rowsync_codec::{DataType, Value};
use rowsync_core::{
    ApplyOptions, BatchInfo, BatchManager, ChangeApplier, ChangeRequest, ChangeTracker, ColumnSchema,
    ConflictAction, ConflictOutcome, ConflictPolicy, CoreError, Interceptors, MemoryProvider, ObjectKind,
    ProvisionFlags, Provisioner, Relation, ScopeInfo, ScopeStore, StorageProvider, SyncParameters, SyncSchema,
    SyncSetup, SyncSide, TableSchema,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn schema() -> SyncSchema {
    SyncSchema::new(vec![
        TableSchema::new(
            "Customer",
            vec![
                ColumnSchema::new("id", DataType::Integer),
                ColumnSchema::new("name", DataType::Text),
            ],
            &["id"],
        ),
        TableSchema::new(
            "Order",
            vec![
                ColumnSchema::new("id", DataType::Integer),
                ColumnSchema::new("customer_id", DataType::Integer),
            ],
            &["id"],
        )
        .with_relation(Relation::new("fk_order_customer", &["customer_id"], "Customer", &["id"])),
    ])
}

fn setup() -> SyncSetup {
    SyncSetup::new(["Customer", "Order"])
}

async fn provisioned(name: &str) -> MemoryProvider {
    let db = MemoryProvider::new(name);
    let setup = setup();
    let schema = schema();
    let mut txn = db.begin().await.unwrap();
    Provisioner::new(&setup, &schema)
        .provision(&db, &mut txn, ProvisionFlags::all())
        .await
        .unwrap();
    db.commit(txn).await.unwrap();
    db
}

async fn select_all(db: &MemoryProvider, manager: &BatchManager, since: u64, exclude: Option<Uuid>) -> BatchInfo {
    let setup = setup();
    let schema = schema();
    let interceptors = Interceptors::new();
    let parameters = SyncParameters::new();
    let request = ChangeRequest {
        setup: &setup,
        schema: &schema,
        side: SyncSide::Server,
        since,
        exclude_scope_id: exclude,
        parameters: &parameters,
    };
    let mut txn = db.begin().await.unwrap();
    let info = ChangeTracker::new(db, &interceptors)
        .get_changes(&mut txn, &request, manager.writer().unwrap(), &CancellationToken::new())
        .await
        .unwrap();
    db.rollback(txn).await.unwrap();
    info
}

fn options(sender: Uuid) -> ApplyOptions {
    ApplyOptions {
        side: SyncSide::Client,
        local_scope_id: Uuid::new_v4(),
        sender_scope_id: sender,
        last_sync_timestamp: 0,
        policy: ConflictPolicy::ServerWins,
        check_constraints: true,
        reinitialize: false,
        escalate_conflict_abort: false,
    }
}

#[tokio::test]
async fn provision_deprovision_round_trip() {
    let db = MemoryProvider::new("db");
    let setup = setup();
    let schema = schema();
    let provisioner = Provisioner::new(&setup, &schema);

    let mut txn = db.begin().await.unwrap();
    let first = provisioner.provision(&db, &mut txn, ProvisionFlags::all()).await.unwrap();
    let again = provisioner.provision(&db, &mut txn, ProvisionFlags::all()).await.unwrap();
    db.commit(txn).await.unwrap();
    assert!(again.executed.is_empty());
    assert_eq!(again.skipped.len(), first.executed.len());
    let catalog = db.catalog().await;

    let mut txn = db.begin().await.unwrap();
    provisioner.deprovision(&db, &mut txn, ProvisionFlags::tracking()).await.unwrap();
    db.commit(txn).await.unwrap();
    assert!(db.catalog().await.iter().all(|(_, kind)| *kind == ObjectKind::Table));

    let mut txn = db.begin().await.unwrap();
    provisioner.provision(&db, &mut txn, ProvisionFlags::tracking()).await.unwrap();
    db.commit(txn).await.unwrap();
    assert_eq!(db.catalog().await, catalog);
    assert_eq!(
        db.describe("Order_delete_trigger").await.as_deref(),
        Some("trigger delete on Order")
    );
}

#[tokio::test]
async fn changes_flow_parents_first_and_apply_idempotently() {
    let server = provisioned("server").await;
    let client = provisioned("client").await;
    server.insert_row("Customer", vec![1i64.into(), "A".into()]).await.unwrap();
    server.insert_row("Order", vec![10i64.into(), 1i64.into()]).await.unwrap();
    server.insert_row("Customer", vec![2i64.into(), "B".into()]).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let manager = BatchManager::new(dir.path(), 2);
    let batch = select_all(&server, &manager, 0, None).await;
    assert_eq!(batch.row_count, 3);
    assert_eq!(batch.timestamp, 3);
    let first = batch.read_part(0).unwrap();
    assert_eq!(first.tables[0].name, "Customer");

    let setup = setup();
    let schema = schema();
    let interceptors = Interceptors::new();
    let applier = ChangeApplier::new(&client, &interceptors, &setup, &schema);
    let sender = Uuid::new_v4();
    let cancel = CancellationToken::new();

    let report = applier.apply(&batch, &options(sender), None, &cancel).await.unwrap();
    assert_eq!(report.applied, 3);
    assert_eq!(report.parts, 2);
    let rows_once = client.rows("Customer").await.unwrap();

    let again = applier.apply(&batch, &options(sender), None, &cancel).await.unwrap();
    assert_eq!(again.applied, 3);
    assert!(again.resolved.is_empty());
    assert_eq!(client.rows("Customer").await.unwrap(), rows_once);
    assert_eq!(client.rows("Order").await.unwrap().len(), 1);
}

#[tokio::test]
async fn watermark_is_saved_with_last_part() {
    let server = provisioned("server").await;
    let client = provisioned("client").await;
    for id in 0..5i64 {
        server.insert_row("Customer", vec![id.into(), format!("c{id}").into()]).await.unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let batch = select_all(&server, &BatchManager::new(dir.path(), 2), 0, None).await;
    let counts: Vec<usize> = batch.parts.iter().map(|p| p.row_count).collect();
    assert_eq!(counts, vec![2, 2, 1]);

    let setup = setup();
    let schema = schema();
    let store = ScopeStore::new(&setup.naming);
    let mut scope = ScopeInfo::new("default", setup.clone(), schema.clone()).unwrap();
    scope.last_server_sync_timestamp = Some(batch.timestamp);

    let interceptors = Interceptors::new();
    let applier = ChangeApplier::new(&client, &interceptors, &setup, &schema);
    applier
        .apply(&batch, &options(Uuid::new_v4()), Some((&store, &scope)), &CancellationToken::new())
        .await
        .unwrap();

    let mut txn = client.begin().await.unwrap();
    let saved = store.load_scope(&client, &mut txn, "default").await.unwrap().unwrap();
    client.rollback(txn).await.unwrap();
    assert_eq!(saved.last_server_sync_timestamp, Some(5));
    assert_eq!(client.rows("Customer").await.unwrap().len(), 5);
}

#[tokio::test]
async fn cancellation_stops_between_parts() {
    let server = provisioned("server").await;
    let client = provisioned("client").await;
    for id in 0..4i64 {
        server.insert_row("Customer", vec![id.into(), "x".into()]).await.unwrap();
    }
    let dir = tempfile::tempdir().unwrap();
    let batch = select_all(&server, &BatchManager::new(dir.path(), 2), 0, None).await;

    let setup = setup();
    let schema = schema();
    let interceptors = Interceptors::new();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    interceptors.on_table_changes_applied(move |_| token.cancel());

    let err = ChangeApplier::new(&client, &interceptors, &setup, &schema)
        .apply(&batch, &options(Uuid::new_v4()), None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(client.rows("Customer").await.unwrap().len(), 2);
}

#[tokio::test]
async fn escalated_abort_rolls_back_the_part() {
    let server = provisioned("server").await;
    let client = provisioned("client").await;
    server.insert_row("Customer", vec![1i64.into(), "server".into()]).await.unwrap();
    server.insert_row("Customer", vec![2i64.into(), "server".into()]).await.unwrap();
    client.insert_row("Customer", vec![1i64.into(), "client".into()]).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let batch = select_all(&server, &BatchManager::new(dir.path(), 0), 0, None).await;

    let setup = setup();
    let schema = schema();
    let interceptors = Interceptors::new();
    interceptors.on_conflict(|_| Some(ConflictAction::Abort));
    let applier = ChangeApplier::new(&client, &interceptors, &setup, &schema);
    let cancel = CancellationToken::new();

    let report = applier.apply(&batch, &options(Uuid::new_v4()), None, &cancel).await.unwrap();
    assert_eq!(report.resolved[0].outcome, ConflictOutcome::Rollback);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(client.rows("Customer").await.unwrap().len(), 2);

    let fresh = provisioned("fresh").await;
    fresh.insert_row("Customer", vec![1i64.into(), "fresh".into()]).await.unwrap();
    let mut escalate = options(Uuid::new_v4());
    escalate.escalate_conflict_abort = true;
    let err = ChangeApplier::new(&fresh, &interceptors, &setup, &schema)
        .apply(&batch, &escalate, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConflictAborted { .. }));
    assert_eq!(
        fresh.rows("Customer").await.unwrap(),
        vec![vec![Value::Integer(1), Value::Text("fresh".into())]]
    );
}

#[tokio::test]
async fn reinitialize_resets_tables_first() {
    let server = provisioned("server").await;
    let client = provisioned("client").await;
    server.insert_row("Customer", vec![1i64.into(), "A".into()]).await.unwrap();
    client.insert_row("Customer", vec![7i64.into(), "local only".into()]).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let batch = select_all(&server, &BatchManager::new(dir.path(), 10), 0, None).await;
    let setup = setup();
    let schema = schema();
    let interceptors = Interceptors::new();
    let mut reinit = options(Uuid::new_v4());
    reinit.reinitialize = true;
    ChangeApplier::new(&client, &interceptors, &setup, &schema)
        .apply(&batch, &reinit, None, &CancellationToken::new())
        .await
        .unwrap();

    let rows = client.rows("Customer").await.unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(1), Value::Text("A".into())]]);
    assert!(client.tracking_row("Customer", &[7i64.into()]).await.is_none());
}
