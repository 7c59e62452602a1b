//! The client-side orchestrator.

use crate::config::SyncOptions;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::orchestrator::{ApplyRequest, ChangesQuery, Orchestrator, OrchestratorCore};
use async_trait::async_trait;
use rowsync_core::{
    ApplyReport, BatchInfo, CoreResult, Interceptors, NamingOptions, ProvisionFlags, ProvisionReport, Provisioner,
    ScopeInfo, ScopeStore, StorageProvider, SyncSchema, SyncSet, SyncSetup, SyncSide,
};
use uuid::Uuid;

/// Client scope after loading.
#[derive(Debug, Clone)]
pub struct LoadedScope {
    /// The scope record.
    pub scope: ScopeInfo,
    /// True if the scope was created by this call.
    pub created: bool,
    /// True if the server setup changed since the last run and the local
    /// infrastructure was upgraded.
    pub migrated: bool,
}

/// Drives the store close to the client.
///
/// The client takes its setup and schema from the server scope: tables,
/// tracking objects and the scope record are provisioned on the first run.
#[derive(Debug)]
pub struct LocalOrchestrator<P> {
    core: OrchestratorCore<P>,
}

impl<P: StorageProvider> LocalOrchestrator<P> {
    /// Creates an orchestrator over `provider`.
    pub fn new(provider: P, options: SyncOptions) -> Self {
        Self {
            core: OrchestratorCore::new(provider, options, SyncSide::Client),
        }
    }

    /// The underlying provider.
    pub fn provider(&self) -> &P {
        &self.core.provider
    }

    /// Loads the client scope matching `server`, provisioning or upgrading
    /// the local store as needed. Runs in a single transaction.
    pub async fn ensure_scope(&self, server: &ScopeInfo) -> SyncResult<LoadedScope> {
        let mut txn = self.core.provider.begin().await?;
        let result = self.ensure_scope_in(&mut txn, server).await;
        let loaded = self.core.finish(txn, result).await?;
        if loaded.created {
            tracing::info!(scope = %loaded.scope.name, id = %loaded.scope.id, "client scope created");
        } else if loaded.migrated {
            tracing::info!(scope = %loaded.scope.name, setup = %loaded.scope.setup_hash, "client scope migrated");
        }
        Ok(loaded)
    }

    async fn ensure_scope_in(&self, txn: &mut P::Transaction, server: &ScopeInfo) -> CoreResult<LoadedScope> {
        let provider = &self.core.provider;
        let store = ScopeStore::new(&server.setup.naming);
        let name = &self.core.options.scope_name;
        let existing = if store.is_provisioned(provider, txn).await? {
            store.load_scope(provider, txn, name).await?
        } else {
            None
        };

        match existing {
            Some(scope) if scope.setup_hash == server.setup_hash => Ok(LoadedScope {
                scope,
                created: false,
                migrated: false,
            }),
            Some(mut scope) => {
                Provisioner::new(&server.setup, &server.schema)
                    .provision(provider, txn, ProvisionFlags::all())
                    .await?;
                scope.migrate(server.setup.clone(), server.schema.clone())?;
                store.save_scope(provider, txn, &scope).await?;
                Ok(LoadedScope {
                    scope,
                    created: false,
                    migrated: true,
                })
            }
            None => {
                Provisioner::new(&server.setup, &server.schema)
                    .provision(provider, txn, ProvisionFlags::all())
                    .await?;
                let scope = ScopeInfo::new(name.clone(), server.setup.clone(), server.schema.clone())?;
                store.save_scope(provider, txn, &scope).await?;
                Ok(LoadedScope {
                    scope,
                    created: true,
                    migrated: false,
                })
            }
        }
    }

    /// Selects the upload of a run.
    ///
    /// Changes above the local watermark are selected, except the ones
    /// written by the server. A run that does not upload gets an empty batch
    /// stamped with the current timestamp, which becomes the new local
    /// watermark.
    pub async fn select_upload(
        &self,
        scope: &ScopeInfo,
        server_scope_id: Uuid,
        ctx: &SyncContext,
    ) -> SyncResult<BatchInfo> {
        if !ctx.sync_type.uploads() {
            let timestamp = self.core.current_timestamp().await?;
            return Ok(self.core.batches.create_batch(SyncSet::new(), timestamp)?);
        }
        let query = ChangesQuery {
            since: scope.last_sync_timestamp.unwrap_or(0),
            exclude_scope_id: Some(server_scope_id),
        };
        self.core.select_into(scope, query, &self.core.batches, ctx).await
    }

    /// Applies the server download and saves `watermark` with its last part.
    ///
    /// `upload_timestamp` is the timestamp the upload was selected at: local
    /// rows tracked after it changed during the run and are conflicts.
    pub async fn apply_download(
        &self,
        scope: &ScopeInfo,
        server_scope_id: Uuid,
        download: &BatchInfo,
        upload_timestamp: u64,
        watermark: &ScopeInfo,
        ctx: &SyncContext,
    ) -> SyncResult<ApplyReport> {
        let request = ApplyRequest {
            sender_scope_id: server_scope_id,
            last_sync_timestamp: upload_timestamp,
            reinitialize: ctx.sync_type.is_reinitialize(),
            watermark: Some(watermark),
        };
        self.core.apply(scope, download, request, ctx).await
    }
}

#[async_trait]
impl<P: StorageProvider> Orchestrator for LocalOrchestrator<P> {
    fn side(&self) -> SyncSide {
        SyncSide::Client
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
