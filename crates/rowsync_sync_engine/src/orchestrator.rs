//! The orchestrator contract and its provider-backed implementation.
//!
//! [`LocalOrchestrator`](crate::LocalOrchestrator) and
//! [`RemoteOrchestrator`](crate::RemoteOrchestrator) both drive a
//! [`StorageProvider`] directly. They share one core implementing
//! [`Orchestrator`] and differ only in the side they act for and in the run
//! steps built on top.

use crate::config::SyncOptions;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use rowsync_core::{
    ApplyOptions, ApplyReport, BatchInfo, BatchManager, ChangeApplier, ChangeRequest, ChangeTracker, CoreResult,
    Interceptors, NamingOptions, ProvisionFlags, ProvisionReport, Provisioner, ScopeInfo, ScopeStore,
    StorageProvider, SyncSchema, SyncSetup, SyncSide,
};
use std::fs;
use uuid::Uuid;

/// Bounds of a change selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangesQuery {
    /// Only changes tracked above this timestamp are selected.
    pub since: u64,
    /// Changes last written by this scope are left out.
    pub exclude_scope_id: Option<Uuid>,
}

/// How a batch received from the other side is applied.
#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    /// Scope that produced the batch.
    pub sender_scope_id: Uuid,
    /// Local rows tracked above this timestamp and not written by the
    /// sender are conflicts.
    pub last_sync_timestamp: u64,
    /// Reset every table before applying.
    pub reinitialize: bool,
    /// Scope to save together with the last part.
    pub watermark: Option<&'a ScopeInfo>,
}

/// Operations every orchestrator offers on its store.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Side this orchestrator acts for.
    fn side(&self) -> SyncSide;

    /// Options of this orchestrator.
    fn options(&self) -> &SyncOptions;

    /// Interception hooks applied to every selection and application.
    fn interceptors(&self) -> &Interceptors;

    /// Creates the tracking infrastructure of `scope`.
    async fn provision(&self, scope: &ScopeInfo, flags: ProvisionFlags) -> SyncResult<ProvisionReport>;

    /// Drops the tracking infrastructure of `scope`.
    async fn deprovision(&self, scope: &ScopeInfo, flags: ProvisionFlags) -> SyncResult<ProvisionReport>;

    /// Reads the schema of the tables of `setup` from the store.
    async fn get_schema(&self, setup: &SyncSetup) -> SyncResult<SyncSchema>;

    /// Loads the scope record, or `None` if it was never saved.
    async fn get_scope(&self, naming: &NamingOptions) -> SyncResult<Option<ScopeInfo>>;

    /// Saves the scope record.
    async fn save_scope(&self, scope: &ScopeInfo) -> SyncResult<()>;

    /// Selects pending changes of `scope` into a new run batch.
    async fn get_changes(&self, scope: &ScopeInfo, query: ChangesQuery, ctx: &SyncContext)
        -> SyncResult<BatchInfo>;

    /// Applies a batch produced by the other side.
    async fn apply_changes(
        &self,
        scope: &ScopeInfo,
        batch: &BatchInfo,
        request: ApplyRequest<'_>,
        ctx: &SyncContext,
    ) -> SyncResult<ApplyReport>;
}

/// State and steps shared by the provider-backed orchestrators.
#[derive(Debug)]
pub(crate) struct OrchestratorCore<P> {
    pub(crate) provider: P,
    pub(crate) options: SyncOptions,
    pub(crate) interceptors: Interceptors,
    pub(crate) batches: BatchManager,
    pub(crate) side: SyncSide,
}

impl<P: StorageProvider> OrchestratorCore<P> {
    pub(crate) fn new(provider: P, options: SyncOptions, side: SyncSide) -> Self {
        let batches = BatchManager::new(&options.batch_directory, options.batch_size);
        Self {
            provider,
            options,
            interceptors: Interceptors::new(),
            batches,
            side,
        }
    }

    /// Commits `txn` if `result` is a success, rolls it back otherwise.
    pub(crate) async fn finish<T>(&self, txn: P::Transaction, result: CoreResult<T>) -> SyncResult<T> {
        match result {
            Ok(value) => {
                self.provider.commit(txn).await?;
                Ok(value)
            }
            Err(e) => {
                self.provider.rollback(txn).await?;
                Err(e.into())
            }
        }
    }

    /// Rolls `txn` back and returns `result`. Used by read-only steps.
    pub(crate) async fn discard<T>(&self, txn: P::Transaction, result: CoreResult<T>) -> SyncResult<T> {
        self.provider.rollback(txn).await?;
        result.map_err(SyncError::from)
    }

    pub(crate) async fn current_timestamp(&self) -> SyncResult<u64> {
        let mut txn = self.provider.begin().await?;
        let result = self.provider.current_timestamp(&mut txn).await;
        self.discard(txn, result).await
    }

    pub(crate) async fn min_valid_timestamp(&self) -> SyncResult<u64> {
        let mut txn = self.provider.begin().await?;
        let result = self.provider.min_valid_timestamp(&mut txn).await;
        self.discard(txn, result).await
    }

    /// Selects changes into a fresh batch under `batches`.
    pub(crate) async fn select_into(
        &self,
        scope: &ScopeInfo,
        query: ChangesQuery,
        batches: &BatchManager,
        ctx: &SyncContext,
    ) -> SyncResult<BatchInfo> {
        ctx.check_cancelled()?;
        let writer = batches.writer()?;
        let directory = writer.directory().to_path_buf();
        let request = ChangeRequest {
            setup: &scope.setup,
            schema: &scope.schema,
            side: self.side,
            since: query.since,
            exclude_scope_id: query.exclude_scope_id,
            parameters: &ctx.parameters,
        };

        let mut txn = self.provider.begin().await?;
        let result = ChangeTracker::new(&self.provider, &self.interceptors)
            .get_changes(&mut txn, &request, writer, ctx.cancellation())
            .await;
        let result = self.discard(txn, result).await;
        if result.is_err() && directory.exists() {
            let _ = fs::remove_dir_all(&directory);
        }
        let batch = result?;

        tracing::info!(
            side = self.side.as_str(),
            scope = %scope.name,
            since = query.since,
            rows = batch.row_count,
            parts = batch.part_count(),
            timestamp = batch.timestamp,
            "changes selected"
        );
        Ok(batch)
    }

    pub(crate) async fn apply(
        &self,
        scope: &ScopeInfo,
        batch: &BatchInfo,
        request: ApplyRequest<'_>,
        ctx: &SyncContext,
    ) -> SyncResult<ApplyReport> {
        let options = ApplyOptions {
            side: self.side,
            local_scope_id: scope.id,
            sender_scope_id: request.sender_scope_id,
            last_sync_timestamp: request.last_sync_timestamp,
            policy: self.options.conflict_policy,
            check_constraints: !self.options.disable_constraints_on_apply,
            reinitialize: request.reinitialize,
            escalate_conflict_abort: self.options.escalate_conflict_abort,
        };
        let store = ScopeStore::new(&scope.setup.naming);
        let report = ChangeApplier::new(&self.provider, &self.interceptors, &scope.setup, &scope.schema)
            .apply(
                batch,
                &options,
                request.watermark.map(|w| (&store, w)),
                ctx.cancellation(),
            )
            .await?;

        tracing::info!(
            side = self.side.as_str(),
            scope = %scope.name,
            applied = report.applied,
            conflicts = report.resolved.len(),
            failed = report.failed.len(),
            "changes applied"
        );
        for failed in &report.failed {
            tracing::debug!(table = %failed.table, reason = %failed.reason, "row not applied");
        }
        Ok(report)
    }
}

#[async_trait]
impl<P: StorageProvider> Orchestrator for OrchestratorCore<P> {
    fn side(&self) -> SyncSide {
        self.side
    }

    fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    async fn provision(&self, scope: &ScopeInfo, flags: ProvisionFlags) -> SyncResult<ProvisionReport> {
        let mut txn = self.provider.begin().await?;
        let result = Provisioner::new(&scope.setup, &scope.schema)
            .provision(&self.provider, &mut txn, flags)
            .await;
        self.finish(txn, result).await
    }

    async fn deprovision(&self, scope: &ScopeInfo, flags: ProvisionFlags) -> SyncResult<ProvisionReport> {
        let mut txn = self.provider.begin().await?;
        let result = Provisioner::new(&scope.setup, &scope.schema)
            .deprovision(&self.provider, &mut txn, flags)
            .await;
        self.finish(txn, result).await
    }

    async fn get_schema(&self, setup: &SyncSetup) -> SyncResult<SyncSchema> {
        let mut txn = self.provider.begin().await?;
        let result = self.provider.get_schema(&mut txn, setup).await;
        self.discard(txn, result).await
    }

    async fn get_scope(&self, naming: &NamingOptions) -> SyncResult<Option<ScopeInfo>> {
        let store = ScopeStore::new(naming);
        let mut txn = self.provider.begin().await?;
        let result = match store.is_provisioned(&self.provider, &mut txn).await {
            Ok(true) => {
                store
                    .load_scope(&self.provider, &mut txn, &self.options.scope_name)
                    .await
            }
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        };
        self.discard(txn, result).await
    }

    async fn save_scope(&self, scope: &ScopeInfo) -> SyncResult<()> {
        let store = ScopeStore::new(&scope.setup.naming);
        let mut txn = self.provider.begin().await?;
        let result = store.save_scope(&self.provider, &mut txn, scope).await;
        self.finish(txn, result).await
    }

    async fn get_changes(
        &self,
        scope: &ScopeInfo,
        query: ChangesQuery,
        ctx: &SyncContext,
    ) -> SyncResult<BatchInfo> {
        self.select_into(scope, query, &self.batches, ctx).await
    }

    async fn apply_changes(
        &self,
        scope: &ScopeInfo,
        batch: &BatchInfo,
        request: ApplyRequest<'_>,
        ctx: &SyncContext,
    ) -> SyncResult<ApplyReport> {
        self.apply(scope, batch, request, ctx).await
    }
}
