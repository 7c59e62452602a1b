//! Runs between a client agent and the web server, in process and over TCP.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use rowsync_codec::Value;
use rowsync_core::{MemoryProvider, SnapshotStore, SyncParameters};
use rowsync_sync_engine::{
    LocalOrchestrator, LoopbackClient, OutdatedAction, ReqwestClient, RetryPolicy, SyncAgent, SyncError, SyncOptions,
    WebClientConfig, WebClientOrchestrator,
};
use rowsync_sync_protocol::{endpoints, EnsureScopeRequest, EnsureScopeResponse, Message, SyncType};
use rowsync_sync_server::{router, serve_on, ServerConfig, WebServerOrchestrator, CBOR_CONTENT_TYPE};
use rowsync_testkit::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const SCOPE: &str = "sales";

type Server = Arc<WebServerOrchestrator<MemoryProvider>>;
type LoopbackAgent = SyncAgent<MemoryProvider, WebClientOrchestrator<LoopbackClient<Server>>>;

fn config(replicas: &TestReplicas) -> ServerConfig {
    ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)), replicas.path("sessions")).with_batch_size(2)
}

fn web_server(replicas: &TestReplicas, config: ServerConfig) -> Server {
    Arc::new(WebServerOrchestrator::new(config).with_scope(replicas.server.clone(), SCOPE, customer_setup()))
}

fn web_config() -> WebClientConfig {
    WebClientConfig::new("http://sync.test/api")
        .with_retry(RetryPolicy::attempts(2).with_first_delay(Duration::from_millis(1)).with_jitter(false))
}

fn loopback_agent(replicas: &TestReplicas, client: &MemoryProvider, name: &str, server: &Server) -> LoopbackAgent {
    loopback_agent_with(replicas, client, name, server, |options| options)
}

fn loopback_agent_with(
    replicas: &TestReplicas,
    client: &MemoryProvider,
    name: &str,
    server: &Server,
    configure: impl FnOnce(SyncOptions) -> SyncOptions,
) -> LoopbackAgent {
    let options = configure(SyncOptions::new(SCOPE, replicas.path(name)).with_batch_size(2));
    let remote = WebClientOrchestrator::new(
        web_config(),
        LoopbackClient::new(Arc::clone(server)),
        replicas.path(&format!("{name}-downloads")),
    );
    SyncAgent::new(LocalOrchestrator::new(client.clone(), options), remote)
}

fn cbor_post(path: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, CBOR_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn router_answers_in_cbor() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let app = router(web_server(&replicas, config(&replicas)));
    let request = EnsureScopeRequest::new(Uuid::new_v4(), SCOPE);

    let response = app
        .oneshot(cbor_post(endpoints::ENSURE_SCOPE, request.encode().unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        CBOR_CONTENT_TYPE
    );
    let decoded = EnsureScopeResponse::decode(&body_bytes(response).await).unwrap();
    assert_eq!(decoded.server_scope.name, SCOPE);
    assert_eq!(decoded.server_scope.setup, customer_setup());
}

#[tokio::test]
async fn router_rejects_bad_requests() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let app = router(web_server(&replicas, config(&replicas)));

    let garbage = app
        .clone()
        .oneshot(cbor_post(endpoints::SEND_CHANGES, b"garbage".to_vec()))
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let unknown_scope = EnsureScopeRequest::new(Uuid::new_v4(), "elsewhere");
    let response = app
        .clone()
        .oneshot(cbor_post(endpoints::ENSURE_SCOPE, unknown_scope.encode().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let message = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(message.contains("elsewhere"));

    let not_found = app
        .clone()
        .oneshot(cbor_post("/sync/nothing", Vec::new()))
        .await
        .unwrap();
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

    let get = app
        .oneshot(
            Request::builder()
                .uri(endpoints::ENSURE_SCOPE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn router_enforces_the_body_limit() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let app = router(web_server(&replicas, config(&replicas).with_body_limit(64)));

    let response = app
        .oneshot(cbor_post(endpoints::SEND_CHANGES, vec![0u8; 1024]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn multi_part_runs_in_both_directions() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let server = web_server(&replicas, config(&replicas));
    let agent = loopback_agent(&replicas, &replicas.client, "client", &server);
    for id in 1..=5 {
        replicas.server.insert_row("Customer", customer(id, "Server")).await.unwrap();
    }

    let summary = agent.synchronize(SyncType::Normal).await.unwrap();
    assert_eq!(summary.total_changes_downloaded, 5);
    assert_eq!(rows_of(&replicas.client, "Customer").await.len(), 5);

    for id in 6..=8 {
        replicas.client.insert_row("Customer", customer(id, "Client")).await.unwrap();
    }
    let summary = agent.synchronize(SyncType::Normal).await.unwrap();
    assert_eq!(summary.total_changes_uploaded, 3);
    assert_eq!(summary.total_changes_downloaded, 0);
    assert_eq!(
        rows_of(&replicas.server, "Customer").await,
        rows_of(&replicas.client, "Customer").await
    );

    assert!(server.sessions().session_ids().unwrap().is_empty());
}

#[tokio::test]
async fn conflicts_are_resolved_by_the_server() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let server = web_server(&replicas, config(&replicas));
    let agent = loopback_agent(&replicas, &replicas.client, "client", &server);
    replicas.server.insert_row("Customer", customer(1, "A")).await.unwrap();
    agent.synchronize(SyncType::Normal).await.unwrap();

    let key = [Value::from(1i64)];
    replicas.client.update_row("Customer", &key, &[("name", "B".into())]).await.unwrap();
    replicas.server.update_row("Customer", &key, &[("name", "C".into())]).await.unwrap();
    let summary = agent.synchronize(SyncType::Normal).await.unwrap();

    assert_eq!(summary.conflicts, 1);
    assert_eq!(replicas.client.row("Customer", &key).await.unwrap(), Some(customer(1, "C")));
}

#[tokio::test]
async fn outdated_clients_reinitialize_over_http() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let server = web_server(&replicas, config(&replicas));
    let agent = loopback_agent(&replicas, &replicas.client, "client", &server);
    replicas.server.insert_row("Customer", customer(1, "A")).await.unwrap();
    agent.synchronize(SyncType::Normal).await.unwrap();

    replicas.server.delete_row("Customer", &[Value::from(1i64)]).await.unwrap();
    replicas.server.insert_row("Customer", customer(2, "B")).await.unwrap();
    let now = replicas
        .server
        .tracking_row("Customer", &[Value::from(2i64)])
        .await
        .unwrap()
        .timestamp;
    server.scope(SCOPE).unwrap().delete_metadata(Some(now)).await.unwrap();

    let summary = agent.synchronize(SyncType::Normal).await.unwrap();
    assert_eq!(summary.sync_type, SyncType::Reinitialize);
    assert_eq!(rows_of(&replicas.client, "Customer").await, vec![customer(2, "B")]);

    let strict = loopback_agent_with(&replicas, &replicas.client, "client", &server, |options| {
        options.with_outdated_action(OutdatedAction::Fail)
    });
    replicas.server.insert_row("Customer", customer(3, "C")).await.unwrap();
    replicas.server.delete_row("Customer", &[Value::from(3i64)]).await.unwrap();
    replicas.server.insert_row("Customer", customer(4, "D")).await.unwrap();
    let now = replicas
        .server
        .tracking_row("Customer", &[Value::from(4i64)])
        .await
        .unwrap()
        .timestamp;
    server.scope(SCOPE).unwrap().delete_metadata(Some(now)).await.unwrap();
    let result = strict.synchronize(SyncType::Normal).await;
    assert!(matches!(result, Err(SyncError::OutdatedScope { .. })));
}

#[tokio::test]
async fn new_clients_bootstrap_from_the_snapshot() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let snapshots = replicas.path("snapshots");
    let server = web_server(&replicas, config(&replicas).with_snapshot_directory(&snapshots));
    for id in 1..=3 {
        replicas.server.insert_row("Customer", customer(id, "N")).await.unwrap();
    }
    server
        .scope(SCOPE)
        .unwrap()
        .create_snapshot(&SyncParameters::new())
        .await
        .unwrap();
    replicas.server.insert_row("Customer", customer(4, "Late")).await.unwrap();

    let client = replicas.another_client("fresh");
    let agent = loopback_agent(&replicas, &client, "fresh", &server);
    let summary = agent.synchronize(SyncType::Normal).await.unwrap();
    assert!(summary.from_snapshot);
    assert_eq!(rows_of(&client, "Customer").await.len(), 3);

    let summary = agent.synchronize(SyncType::Normal).await.unwrap();
    assert!(!summary.from_snapshot);
    assert_eq!(rows_of(&client, "Customer").await, rows_of(&replicas.server, "Customer").await);
    assert_eq!(SnapshotStore::new(&snapshots).list().unwrap().len(), 1);
}

#[tokio::test]
async fn clients_share_one_server() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let server = web_server(&replicas, config(&replicas));
    let second = replicas.another_client("second");
    let first_agent = loopback_agent(&replicas, &replicas.client, "first", &server);
    let second_agent = loopback_agent(&replicas, &second, "second", &server);

    replicas.client.insert_row("Customer", customer(1, "First")).await.unwrap();
    first_agent.synchronize(SyncType::Normal).await.unwrap();
    second.create_table(customer_table()).await.unwrap();
    second.insert_row("Customer", customer(2, "Second")).await.unwrap();

    let (a, b) = tokio::join!(
        second_agent.synchronize(SyncType::Normal),
        first_agent.synchronize(SyncType::Normal)
    );
    a.unwrap();
    b.unwrap();
    first_agent.synchronize(SyncType::Normal).await.unwrap();

    let expected = vec![customer(1, "First"), customer(2, "Second")];
    assert_eq!(rows_of(&replicas.server, "Customer").await, expected);
    assert_eq!(rows_of(&replicas.client, "Customer").await, expected);
    assert_eq!(rows_of(&second, "Customer").await, expected);
    assert_eq!(server.scope(SCOPE).unwrap().client_scopes().await.unwrap().len(), 2);
}

#[tokio::test]
async fn sync_over_tcp_with_reqwest() {
    let replicas = TestReplicas::new(&customer_schema()).await;
    let server = web_server(&replicas, config(&replicas));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(serve_on(Arc::clone(&server), listener));

    let remote = WebClientOrchestrator::new(
        WebClientConfig::new(format!("http://{addr}")).with_timeout(Duration::from_secs(10)),
        ReqwestClient::new(Duration::from_secs(10)).unwrap(),
        replicas.path("downloads"),
    );
    let agent = SyncAgent::new(
        LocalOrchestrator::new(replicas.client.clone(), SyncOptions::new(SCOPE, replicas.path("client"))),
        remote,
    );
    for id in 1..=3 {
        replicas.server.insert_row("Customer", customer(id, "Tcp")).await.unwrap();
    }
    replicas.server.delete_row("Customer", &[Value::from(2i64)]).await.unwrap();

    let summary = agent.synchronize(SyncType::Normal).await.unwrap();
    assert_eq!(rows_of(&replicas.client, "Customer").await, vec![customer(1, "Tcp"), customer(3, "Tcp")]);
    assert_eq!(summary.total_changes_downloaded, 3);
    assert!(agent.remote().transport().last_error().is_none());

    let wrong_scope = SyncAgent::new(
        LocalOrchestrator::new(
            replicas.another_client("lost"),
            SyncOptions::new("missing", replicas.path("lost")),
        ),
        WebClientOrchestrator::new(
            WebClientConfig::new(format!("http://{addr}")),
            ReqwestClient::new(Duration::from_secs(10)).unwrap(),
            replicas.path("lost-downloads"),
        ),
    );
    let err = wrong_scope.synchronize(SyncType::Normal).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("missing"));

    task.abort();
}
