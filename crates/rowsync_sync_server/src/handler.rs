//! Request handling for the sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::{Session, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use rowsync_core::{write_part, BatchManager, StorageProvider, SyncSetup};
use rowsync_sync_engine::{
    ExchangeOutcome, LoopbackServer, Orchestrator, RemoteOrchestrator, SyncContext, SyncError, SyncOptions,
    SyncResult,
};
use rowsync_sync_protocol::{
    endpoints, DownloadSummary, EndSessionRequest, EndSessionResponse, EnsureScopeRequest, EnsureScopeResponse,
    GetMoreChangesRequest, GetMoreChangesResponse, Message, PartPayload, SendChangesRequest, SendChangesResponse,
    SyncStatus, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

/// Server side of the HTTP protocol.
///
/// Serves any number of named scopes, each backed by a
/// [`RemoteOrchestrator`]. Requests of a run are tied together by their
/// session id only; the state between them lives in a [`SessionStore`].
#[derive(Debug)]
pub struct WebServerOrchestrator<P> {
    config: ServerConfig,
    scopes: HashMap<String, Arc<RemoteOrchestrator<P>>>,
    sessions: SessionStore,
}

impl<P: StorageProvider> WebServerOrchestrator<P> {
    /// Creates a server without scopes.
    pub fn new(config: ServerConfig) -> Self {
        let sessions = SessionStore::new(&config.session_directory, config.session_expiry);
        Self {
            config,
            scopes: HashMap::new(),
            sessions,
        }
    }

    /// Serves the scope of `remote`, replacing a scope of the same name.
    pub fn with_orchestrator(mut self, remote: RemoteOrchestrator<P>) -> Self {
        self.scopes
            .insert(remote.scope_name().to_string(), Arc::new(remote));
        self
    }

    /// Serves `scope_name` over `setup`, with batch size and snapshots taken
    /// from the server configuration.
    pub fn with_scope(self, provider: P, scope_name: &str, setup: SyncSetup) -> Self {
        let mut options = SyncOptions::new(scope_name, self.config.session_directory.join("batches"))
            .with_batch_size(self.config.batch_size);
        if let Some(snapshots) = &self.config.snapshot_directory {
            options = options.with_snapshot_directory(snapshots);
        }
        self.with_orchestrator(RemoteOrchestrator::new(provider, setup, options))
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Session directory.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Orchestrator of a served scope.
    pub fn scope(&self, name: &str) -> ServerResult<&Arc<RemoteOrchestrator<P>>> {
        self.scopes
            .get(name)
            .ok_or_else(|| ServerError::UnknownScope(name.to_string()))
    }

    /// Names of the served scopes, sorted.
    pub fn scope_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scopes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Deletes sessions idle for longer than the configured expiry.
    pub fn purge_expired_sessions(&self) -> ServerResult<usize> {
        self.sessions.purge_expired(Utc::now())
    }

    /// Decodes a request body for `path`, handles it and encodes the response.
    pub async fn handle(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        match path {
            endpoints::ENSURE_SCOPE => encode(self.ensure_scope(EnsureScopeRequest::decode(body)?).await?),
            endpoints::SEND_CHANGES => encode(self.send_changes(SendChangesRequest::decode(body)?).await?),
            endpoints::GET_MORE_CHANGES => {
                encode(self.get_more_changes(GetMoreChangesRequest::decode(body)?).await?)
            }
            endpoints::END_SESSION => encode(self.end_session(EndSessionRequest::decode(body)?).await?),
            other => Err(ServerError::InvalidRequest(format!("unknown endpoint {other}"))),
        }
    }

    /// Returns the server scope, provisioning it on first use.
    pub async fn ensure_scope(&self, request: EnsureScopeRequest) -> ServerResult<EnsureScopeResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::InvalidRequest(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                request.protocol_version
            )));
        }
        let remote = self.scope(&request.scope_name)?;
        let server_scope = remote.ensure_scope().await?;
        tracing::debug!(session = %request.session_id, scope = %server_scope.name, "scope ensured");
        Ok(EnsureScopeResponse { server_scope })
    }

    /// Receives one upload part. The final one triggers the exchange.
    pub async fn send_changes(&self, request: SendChangesRequest) -> ServerResult<SendChangesResponse> {
        let remote = self.scope(&request.scope_name)?;
        check_upload_position(&request)?;
        let id = request.session_id;
        let _guard = self.sessions.lock(id).await;
        let mut session = self.sessions.open(id, &request.scope_name)?;

        if let Some(response) = &session.response {
            if request.is_last {
                tracing::debug!(session = %id, "replaying final response");
                return self.attach_first_part(response.clone(), &session);
            }
            return Err(ServerError::InvalidRequest(format!("session {id} already exchanged")));
        }

        let upload_directory = self.sessions.upload_directory(id);
        if let Some(payload) = &request.part {
            if payload.info.index != request.batch_index {
                return Err(ServerError::InvalidRequest(format!(
                    "part {} sent as request {}",
                    payload.info.index, request.batch_index
                )));
            }
            let mut part = write_part(&upload_directory, request.batch_index, &payload.set)?;
            if part.row_count != payload.info.row_count {
                return Err(ServerError::InvalidRequest(format!(
                    "part {} holds {} rows, client announced {}",
                    request.batch_index, part.row_count, payload.info.row_count
                )));
            }
            part.is_last = request.is_last;
            session.record_upload(part);
        }

        if !request.is_last {
            self.sessions.save(id, &session)?;
            return Ok(SendChangesResponse::ack(id));
        }

        let expected = if request.part.is_none() && session.upload.is_empty() {
            0
        } else {
            request.batch_count
        };
        let upload = session.upload_batch(&upload_directory, request.client_timestamp, expected)?;
        let ctx = SyncContext::new(request.scope_name.clone(), request.sync_type)
            .with_session_id(id)
            .with_parameters(request.parameters.clone());
        let downloads = BatchManager::new(self.sessions.download_root(id), remote.options().batch_size);

        let outcome = remote
            .exchange_with(&request.client_scope, &upload, &downloads, &ctx)
            .await?;
        if upload_directory.exists() {
            if let Err(e) = fs::remove_dir_all(&upload_directory) {
                tracing::warn!(session = %id, error = %e, "failed to delete upload");
            }
        }

        let changes = match outcome {
            ExchangeOutcome::Changes(changes) => changes,
            ExchangeOutcome::Outdated => {
                self.sessions.save(id, &session)?;
                return Ok(SendChangesResponse::outdated(id));
            }
        };
        let response = SendChangesResponse {
            session_id: id,
            status: SyncStatus::Ok,
            server_timestamp: changes.server_timestamp,
            applied: changes.upload_applied,
            failed: changes.upload_failed,
            conflicts: changes.conflicts,
            download: Some(DownloadSummary {
                batch_count: changes.download.part_count(),
                row_count: changes.download.row_count,
                from_snapshot: changes.from_snapshot,
            }),
            part: None,
        };
        session.download = Some(changes.download.directory.clone());
        session.response = Some(response.clone());
        self.sessions.save(id, &session)?;

        tracing::info!(
            session = %id,
            scope = %request.scope_name,
            uploaded = upload.row_count,
            downloaded = changes.download.row_count,
            parts = changes.download.part_count(),
            from_snapshot = changes.from_snapshot,
            "changes exchanged"
        );
        self.attach_first_part(response, &session)
    }

    /// Returns one part of the download of a session.
    pub async fn get_more_changes(&self, request: GetMoreChangesRequest) -> ServerResult<GetMoreChangesResponse> {
        self.scope(&request.scope_name)?;
        let id = request.session_id;
        let _guard = self.sessions.lock(id).await;
        let session = self
            .sessions
            .load(id)?
            .filter(|s| s.scope_name == request.scope_name)
            .ok_or(ServerError::UnknownSession(id))?;
        let download = session.download_batch(id)?;
        let info = download.parts.get(request.batch_index).cloned().ok_or_else(|| {
            ServerError::InvalidRequest(format!(
                "part {} requested, download has {}",
                request.batch_index,
                download.part_count()
            ))
        })?;
        let set = download.read_part(request.batch_index)?;
        Ok(GetMoreChangesResponse {
            session_id: id,
            part: PartPayload { info, set },
        })
    }

    /// Deletes a session. Ending an unknown session succeeds.
    pub async fn end_session(&self, request: EndSessionRequest) -> ServerResult<EndSessionResponse> {
        let id = request.session_id;
        let guard = self.sessions.lock(id).await;
        let removed = self.sessions.remove(id)?;
        drop(guard);
        tracing::debug!(session = %id, scope = %request.scope_name, removed, "session ended");
        Ok(EndSessionResponse { session_id: id })
    }

    fn attach_first_part(&self, mut response: SendChangesResponse, session: &Session) -> ServerResult<SendChangesResponse> {
        let parts = response.download.as_ref().map_or(0, |d| d.batch_count);
        if parts > 0 {
            let download = session.download_batch(response.session_id)?;
            let set = download.read_part(0)?;
            response.part = Some(PartPayload {
                info: download.parts[0].clone(),
                set,
            });
        }
        Ok(response)
    }
}

fn check_upload_position(request: &SendChangesRequest) -> ServerResult<()> {
    if request.batch_count == 0 || request.batch_index >= request.batch_count {
        return Err(ServerError::InvalidRequest(format!(
            "request {} of {}",
            request.batch_index, request.batch_count
        )));
    }
    if request.is_last != (request.batch_index + 1 == request.batch_count) {
        return Err(ServerError::InvalidRequest(format!(
            "request {} of {} has a wrong last flag",
            request.batch_index, request.batch_count
        )));
    }
    if request.part.is_none() && request.batch_count != 1 {
        return Err(ServerError::InvalidRequest("upload request without a part".into()));
    }
    Ok(())
}

fn encode<M: Message>(message: M) -> ServerResult<Vec<u8>> {
    message
        .encode()
        .map_err(|e| ServerError::Internal(format!("failed to encode response: {e}")))
}

#[async_trait]
impl<P: StorageProvider> LoopbackServer for WebServerOrchestrator<P> {
    async fn handle_post(&self, path: &str, body: &[u8]) -> SyncResult<Vec<u8>> {
        self.handle(path, body).await.map_err(|e| {
            if e.is_client_error() {
                SyncError::http_permanent(e.to_string())
            } else {
                SyncError::ServerFailed(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{BatchManager, MemoryProvider, ScopeInfo, SyncParameters, SyncSet};
    use rowsync_sync_protocol::SyncType;
    use rowsync_testkit::prelude::*;
    use std::net::SocketAddr;

    async fn server(replicas: &TestReplicas) -> WebServerOrchestrator<MemoryProvider> {
        let config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)), replicas.path("sessions"))
            .with_batch_size(2);
        WebServerOrchestrator::new(config).with_scope(replicas.server.clone(), "sales", customer_setup())
    }

    async fn client_scope(server: &WebServerOrchestrator<MemoryProvider>) -> ScopeInfo {
        let server_scope = server
            .ensure_scope(EnsureScopeRequest::new(Uuid::new_v4(), "sales"))
            .await
            .unwrap()
            .server_scope;
        ScopeInfo::new("sales", server_scope.setup, server_scope.schema).unwrap()
    }

    fn upload_request(session_id: Uuid, client_scope: &ScopeInfo) -> SendChangesRequest {
        SendChangesRequest {
            session_id,
            scope_name: "sales".into(),
            sync_type: SyncType::Normal,
            client_scope: client_scope.clone(),
            parameters: SyncParameters::new(),
            batch_index: 0,
            batch_count: 1,
            is_last: true,
            part: None,
            client_timestamp: 0,
        }
    }

    #[tokio::test]
    async fn unknown_scope_is_a_client_error() {
        let replicas = TestReplicas::new(&customer_schema()).await;
        let server = server(&replicas).await;
        let err = server
            .ensure_scope(EnsureScopeRequest::new(Uuid::new_v4(), "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::UnknownScope(_)));
        assert!(err.is_client_error());
        assert_eq!(server.scope_names(), vec!["sales"]);
    }

    #[tokio::test]
    async fn protocol_version_is_checked() {
        let replicas = TestReplicas::new(&customer_schema()).await;
        let server = server(&replicas).await;
        let mut request = EnsureScopeRequest::new(Uuid::new_v4(), "sales");
        request.protocol_version = 99;
        let err = server.ensure_scope(request).await.unwrap_err();
        assert!(err.to_string().contains("99"));
    }

    #[tokio::test]
    async fn garbage_body_is_rejected() {
        let replicas = TestReplicas::new(&customer_schema()).await;
        let server = server(&replicas).await;
        let err = server.handle(endpoints::SEND_CHANGES, b"not cbor").await.unwrap_err();
        assert!(err.is_client_error());
        let err = server.handle("/sync/unknown", &[]).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn final_request_is_replayed_from_the_session() {
        let replicas = TestReplicas::new(&customer_schema()).await;
        let server = server(&replicas).await;
        for id in 1..=3 {
            replicas.server.insert_row("Customer", customer(id, "N")).await.unwrap();
        }
        let scope = client_scope(&server).await;
        let session_id = Uuid::new_v4();

        let first = server.send_changes(upload_request(session_id, &scope)).await.unwrap();
        let summary = first.download.clone().unwrap();
        assert_eq!(summary.batch_count, 2);
        assert_eq!(summary.row_count, 3);
        assert_eq!(first.part.as_ref().unwrap().info.row_count, 2);

        let again = server.send_changes(upload_request(session_id, &scope)).await.unwrap();
        assert_eq!(again, first);

        let second = server
            .get_more_changes(GetMoreChangesRequest {
                session_id,
                scope_name: "sales".into(),
                batch_index: 1,
            })
            .await
            .unwrap();
        assert_eq!(second.part.set.row_count(), 1);
        assert!(second.part.info.is_last);

        let out_of_range = server
            .get_more_changes(GetMoreChangesRequest {
                session_id,
                scope_name: "sales".into(),
                batch_index: 2,
            })
            .await;
        assert!(matches!(out_of_range, Err(ServerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn multi_part_upload_is_applied_once_complete() {
        let replicas = TestReplicas::new(&customer_schema()).await;
        let server = server(&replicas).await;
        let scope = client_scope(&server).await;
        let session_id = Uuid::new_v4();

        let mut set = SyncSet::new();
        let table = rowsync_core::SyncTable::new(
            "Customer",
            vec!["id".into(), "name".into(), "region".into()],
            vec!["id".into()],
        );
        for id in 1..=3 {
            set.push(
                &table,
                rowsync_core::SyncRow::upsert(rowsync_core::RowState::Inserted, customer(id, "Up")),
            );
        }
        let upload = BatchManager::new(replicas.path("client"), 2)
            .create_batch(set, 5)
            .unwrap();
        assert_eq!(upload.part_count(), 2);

        for index in 0..2 {
            let mut request = upload_request(session_id, &scope);
            request.batch_index = index;
            request.batch_count = 2;
            request.is_last = index == 1;
            request.client_timestamp = upload.timestamp;
            request.part = Some(PartPayload {
                info: upload.parts[index].clone(),
                set: upload.read_part(index).unwrap(),
            });
            let response = server.send_changes(request).await.unwrap();
            if index == 0 {
                assert!(response.download.is_none());
                assert!(rows_of(&replicas.server, "Customer").await.is_empty());
            } else {
                assert_eq!(response.applied, 3);
            }
        }
        assert_eq!(rows_of(&replicas.server, "Customer").await.len(), 3);

        server
            .end_session(EndSessionRequest {
                session_id,
                scope_name: "sales".into(),
            })
            .await
            .unwrap();
        assert!(server.sessions().session_ids().unwrap().is_empty());
        let missing = server
            .get_more_changes(GetMoreChangesRequest {
                session_id,
                scope_name: "sales".into(),
                batch_index: 0,
            })
            .await;
        assert!(matches!(missing, Err(ServerError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn inconsistent_positions_are_rejected() {
        let replicas = TestReplicas::new(&customer_schema()).await;
        let server = server(&replicas).await;
        let scope = client_scope(&server).await;

        let mut request = upload_request(Uuid::new_v4(), &scope);
        request.batch_count = 2;
        let err = server.send_changes(request).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));

        let mut request = upload_request(Uuid::new_v4(), &scope);
        request.batch_index = 3;
        assert!(server.send_changes(request).await.is_err());
    }
}
