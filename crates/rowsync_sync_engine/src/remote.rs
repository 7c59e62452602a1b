//! The server-side orchestrator.
//!
//! The server owns the setup. Its scope is provisioned on the first request
//! and every client keeps a history record holding the server watermark it
//! was last handed.

use crate::config::SyncOptions;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{ApplyRequest, ChangesQuery, Orchestrator, OrchestratorCore};
use crate::peer::{ExchangeOutcome, RemotePeer, ServerChanges};
use crate::progress::SyncStage;
use async_trait::async_trait;
use chrono::Utc;
use rowsync_core::{
    ApplyReport, BatchInfo, BatchManager, ClientScopeHistory, CoreError, CoreResult, Interceptors, NamingOptions,
    ProvisionFlags, ProvisionReport, Provisioner, ScopeInfo, ScopeStore, SnapshotStore, StorageProvider,
    SyncParameters, SyncSchema, SyncSetup, SyncSide,
};
use tokio_util::sync::CancellationToken;

/// Drives the authoritative store.
#[derive(Debug)]
pub struct RemoteOrchestrator<P> {
    core: OrchestratorCore<P>,
    setup: SyncSetup,
    snapshots: Option<SnapshotStore>,
}

impl<P: StorageProvider> RemoteOrchestrator<P> {
    /// Creates an orchestrator serving `setup` from `provider`.
    pub fn new(provider: P, setup: SyncSetup, options: SyncOptions) -> Self {
        let snapshots = options.snapshot_directory.clone().map(SnapshotStore::new);
        Self {
            core: OrchestratorCore::new(provider, options, SyncSide::Server),
            setup,
            snapshots,
        }
    }

    /// The underlying provider.
    pub fn provider(&self) -> &P {
        &self.core.provider
    }

    /// The setup served.
    pub fn setup(&self) -> &SyncSetup {
        &self.setup
    }

    /// Scope name served.
    pub fn scope_name(&self) -> &str {
        &self.core.options.scope_name
    }

    /// Loads the server scope, provisioning tracking infrastructure on first
    /// use and after a setup change. Replicated tables must already exist.
    pub async fn ensure_scope(&self) -> SyncResult<ScopeInfo> {
        self.setup.validate()?;
        let mut txn = self.core.provider.begin().await?;
        let result = self.ensure_scope_in(&mut txn).await;
        self.core.finish(txn, result).await
    }

    async fn ensure_scope_in(&self, txn: &mut P::Transaction) -> CoreResult<ScopeInfo> {
        let provider = &self.core.provider;
        let store = ScopeStore::new(&self.setup.naming);
        let existing = if store.is_provisioned(provider, txn).await? {
            store.load_scope(provider, txn, self.scope_name()).await?
        } else {
            None
        };
        let fingerprint = self.setup.fingerprint()?;

        match existing {
            Some(scope) if scope.setup_hash == fingerprint => Ok(scope),
            existing => {
                let schema = provider.get_schema(txn, &self.setup).await?;
                Provisioner::new(&self.setup, &schema)
                    .provision(provider, txn, ProvisionFlags::tracking())
                    .await?;
                let scope = match existing {
                    Some(mut scope) => {
                        scope.migrate(self.setup.clone(), schema)?;
                        tracing::info!(scope = %scope.name, setup = %scope.setup_hash, "server scope migrated");
                        scope
                    }
                    None => {
                        let scope = ScopeInfo::new(self.scope_name(), self.setup.clone(), schema)?;
                        tracing::info!(scope = %scope.name, id = %scope.id, "server scope created");
                        scope
                    }
                };
                store.save_scope(provider, txn, &scope).await?;
                Ok(scope)
            }
        }
    }

    /// Applies a client upload and prepares the client download under
    /// `download`.
    ///
    /// Nothing is applied for an outdated client. A new client with nothing
    /// to upload is served the snapshot of its setup and parameters when one
    /// exists.
    pub async fn exchange_with(
        &self,
        client: &ScopeInfo,
        upload: &BatchInfo,
        download: &BatchManager,
        ctx: &SyncContext,
    ) -> SyncResult<ExchangeOutcome> {
        if ctx.scope_name != self.scope_name() {
            return Err(CoreError::invalid_operation(format!("scope {} is not served here", ctx.scope_name)).into());
        }
        let server = self.ensure_scope().await?;
        if client.setup_hash != server.setup_hash {
            return Err(SyncError::SetupMismatch {
                scope: server.name.clone(),
                client: client.setup_hash.clone(),
                server: server.setup_hash.clone(),
            });
        }

        let reinitialize = ctx.sync_type.is_reinitialize();
        let base = client.last_server_sync_timestamp.unwrap_or(0);
        if !reinitialize {
            if let Some(last) = client.last_server_sync_timestamp {
                let floor = self.core.min_valid_timestamp().await?;
                if last < floor {
                    tracing::warn!(
                        scope = %server.name,
                        client = %client.id,
                        last_server_sync = last,
                        floor,
                        "client scope outdated"
                    );
                    return Ok(ExchangeOutcome::Outdated);
                }
            }
        }

        ctx.report(35, SyncStage::ChangesApplying, SyncSide::Server, "applying client changes");
        let applied = self
            .core
            .apply(
                &server,
                upload,
                ApplyRequest {
                    sender_scope_id: client.id,
                    last_sync_timestamp: base,
                    reinitialize: false,
                    watermark: None,
                },
                ctx,
            )
            .await?;

        ctx.report(45, SyncStage::ChangesSelecting, SyncSide::Server, "selecting server changes");
        let snapshot = if client.is_new() && !reinitialize && upload.is_empty() {
            self.find_snapshot(&server, &ctx.parameters)?
        } else {
            None
        };
        let (batch, from_snapshot) = match snapshot {
            Some(batch) => {
                tracing::info!(scope = %server.name, client = %client.id, rows = batch.row_count, "serving snapshot");
                (batch, true)
            }
            None => {
                let query = if reinitialize {
                    ChangesQuery::default()
                } else {
                    ChangesQuery {
                        since: base,
                        exclude_scope_id: Some(client.id),
                    }
                };
                (self.core.select_into(&server, query, download, ctx).await?, false)
            }
        };

        self.save_history(&server, client, batch.timestamp, &ctx.parameters)
            .await?;

        Ok(ExchangeOutcome::Changes(ServerChanges {
            server_timestamp: batch.timestamp,
            upload_applied: applied.applied,
            upload_failed: applied.failed.len(),
            conflicts: applied.resolved,
            download: batch,
            from_snapshot,
            download_owned: !from_snapshot,
        }))
    }

    fn find_snapshot(&self, server: &ScopeInfo, parameters: &SyncParameters) -> SyncResult<Option<BatchInfo>> {
        match &self.snapshots {
            Some(store) => Ok(store.find(&server.name, &server.setup_hash, parameters)?),
            None => Ok(None),
        }
    }

    async fn save_history(
        &self,
        server: &ScopeInfo,
        client: &ScopeInfo,
        timestamp: u64,
        parameters: &SyncParameters,
    ) -> SyncResult<()> {
        let mut history = ClientScopeHistory::new(&server.name, client.id);
        history.last_sync_timestamp = timestamp;
        history.last_sync_at = Utc::now();
        if !parameters.is_empty() {
            history.parameters_hash = Some(parameters.fingerprint()?);
        }
        let mut scope = server.clone();
        // A snapshot timestamp may be older than the last exchange.
        scope.last_sync_timestamp = Some(server.last_sync_timestamp.map_or(timestamp, |last| last.max(timestamp)));
        scope.last_sync_at = Some(history.last_sync_at);

        let store = ScopeStore::new(&server.setup.naming);
        let mut txn = self.core.provider.begin().await?;
        let result = async {
            store
                .save_client_history(&self.core.provider, &mut txn, &history)
                .await?;
            store.save_scope(&self.core.provider, &mut txn, &scope).await
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// History records of every client of the scope.
    pub async fn client_scopes(&self) -> SyncResult<Vec<ClientScopeHistory>> {
        let store = ScopeStore::new(&self.setup.naming);
        let mut txn = self.core.provider.begin().await?;
        let result = store
            .list_client_scopes(&self.core.provider, &mut txn, self.scope_name())
            .await;
        self.core.discard(txn, result).await
    }

    /// Purges tombstones tracked at or below `older_than` and raises the
    /// retained-history floor to it. Without a bound, the oldest watermark
    /// handed to a known client is used; with no known client nothing is
    /// purged. Clients whose watermark falls below the floor are outdated
    /// from then on. Returns the number of purged tracking rows.
    pub async fn delete_metadata(&self, older_than: Option<u64>) -> SyncResult<usize> {
        let scope = self.ensure_scope().await?;
        let bound = match older_than {
            Some(bound) => bound,
            None => match self.client_scopes().await?.iter().map(|c| c.last_sync_timestamp).min() {
                Some(bound) => bound,
                None => return Ok(0),
            },
        };
        let tracking: Vec<String> = scope
            .setup
            .tables
            .iter()
            .map(|t| scope.setup.naming.tracking_table_name(&t.name))
            .collect();

        let mut txn = self.core.provider.begin().await?;
        let result = self
            .core
            .provider
            .delete_metadata(&mut txn, &tracking, bound)
            .await;
        let purged = self.core.finish(txn, result).await?;
        tracing::info!(scope = %scope.name, older_than = bound, purged, "metadata deleted");
        Ok(purged)
    }

    /// Creates or replaces the snapshot for `parameters`.
    pub async fn create_snapshot(&self, parameters: &SyncParameters) -> SyncResult<BatchInfo> {
        let store = self
            .snapshots
            .as_ref()
            .ok_or_else(|| SyncError::Unsupported("no snapshot directory configured".into()))?;
        let scope = self.ensure_scope().await?;
        let batch = store
            .create(
                &self.core.provider,
                &scope.name,
                &scope.setup,
                &scope.schema,
                parameters,
                self.core.options.batch_size,
                &CancellationToken::new(),
            )
            .await?;
        Ok(batch)
    }
}

#[async_trait]
impl<P: StorageProvider> RemotePeer for RemoteOrchestrator<P> {
    async fn ensure_scope(&self, _ctx: &SyncContext) -> SyncResult<ScopeInfo> {
        RemoteOrchestrator::ensure_scope(self).await
    }

    async fn exchange(
        &self,
        client_scope: &ScopeInfo,
        upload: &BatchInfo,
        ctx: &SyncContext,
    ) -> SyncResult<ExchangeOutcome> {
        self.exchange_with(client_scope, upload, &self.core.batches, ctx)
            .await
    }
}

#[async_trait]
impl<P: StorageProvider> Orchestrator for RemoteOrchestrator<P> {
    fn side(&self) -> SyncSide {
        SyncSide::Server
    }

    fn options(&self) -> &SyncOptions {
        &self.core.options
    }

    fn interceptors(&self) -> &Interceptors {
        &self.core.interceptors
    }

    async fn provision(&self, scope: &ScopeInfo, flags: ProvisionFlags) -> SyncResult<ProvisionReport> {
        self.core.provision(scope, flags).await
    }

    async fn deprovision(&self, scope: &ScopeInfo, flags: ProvisionFlags) -> SyncResult<ProvisionReport> {
        self.core.deprovision(scope, flags).await
    }

    async fn get_schema(&self, setup: &SyncSetup) -> SyncResult<SyncSchema> {
        self.core.get_schema(setup).await
    }

    async fn get_scope(&self, naming: &NamingOptions) -> SyncResult<Option<ScopeInfo>> {
        self.core.get_scope(naming).await
    }

    async fn save_scope(&self, scope: &ScopeInfo) -> SyncResult<()> {
        self.core.save_scope(scope).await
    }

    async fn get_changes(
        &self,
        scope: &ScopeInfo,
        query: ChangesQuery,
        ctx: &SyncContext,
    ) -> SyncResult<BatchInfo> {
        self.core.get_changes(scope, query, ctx).await
    }

    async fn apply_changes(
        &self,
        scope: &ScopeInfo,
        batch: &BatchInfo,
        request: ApplyRequest<'_>,
        ctx: &SyncContext,
    ) -> SyncResult<ApplyReport> {
        self.core.apply_changes(scope, batch, request, ctx).await
    }
}
