//! The sync agent.
//!
//! The agent never touches storage. It sequences one run over a local
//! orchestrator and a remote peer:
//!
//! 1. Load both scopes, provisioning on first use
//! 2. Select local changes above the local watermark
//! 3. Exchange them for the server changes
//! 4. Apply the download and save both watermarks with its last part
//!
//! Runs of one agent are serialized. A failed run leaves both watermarks
//! where the last successful run put them, except for a reinitialization
//! interrupted after its first part: the scope is then marked and the next
//! run reinitializes again.

use crate::config::OutdatedAction;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalOrchestrator;
use crate::orchestrator::Orchestrator;
use crate::peer::{ExchangeOutcome, RemotePeer};
use crate::progress::{Progress, SyncStage};
use crate::state::{RunState, SyncState};
use chrono::{DateTime, Utc};
use rowsync_core::{BatchInfo, ScopeInfo, StorageProvider, SyncSide};
use rowsync_sync_protocol::SyncType;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Counters of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// Session of the run that completed.
    pub session_id: Uuid,
    /// Kind of the run that completed, after any escalation.
    pub sync_type: SyncType,
    /// Rows uploaded.
    pub total_changes_uploaded: usize,
    /// Rows downloaded.
    pub total_changes_downloaded: usize,
    /// Rows that could not be applied, on either side.
    pub total_failed: usize,
    /// Conflicts resolved, on either side.
    pub conflicts: usize,
    /// True if the download was a snapshot.
    pub from_snapshot: bool,
    /// Start of the run.
    pub started_at: DateTime<Utc>,
    /// End of the run.
    pub complete_time: DateTime<Utc>,
    /// Run duration.
    pub duration: Duration,
}

enum RunOutcome {
    Completed(SyncSummary),
    Outdated,
}

/// Synchronizes one scope of a local store with a server.
#[derive(Debug)]
pub struct SyncAgent<P, R> {
    local: LocalOrchestrator<P>,
    remote: R,
    run_lock: Mutex<()>,
    state: RunState,
}

impl<P: StorageProvider, R: RemotePeer> SyncAgent<P, R> {
    /// Creates an agent.
    pub fn new(local: LocalOrchestrator<P>, remote: R) -> Self {
        Self {
            local,
            remote,
            run_lock: Mutex::new(()),
            state: RunState::new(),
        }
    }

    /// The local orchestrator.
    pub fn local(&self) -> &LocalOrchestrator<P> {
        &self.local
    }

    /// The remote peer.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// State of the current run.
    pub fn state(&self) -> SyncState {
        self.state.get()
    }

    /// Runs a synchronization without progress reporting.
    pub async fn synchronize(&self, sync_type: SyncType) -> SyncResult<SyncSummary> {
        self.synchronize_with(sync_type, Progress::none(), CancellationToken::new())
            .await
    }

    /// Runs a synchronization.
    ///
    /// An outdated client is handled per the configured
    /// [`OutdatedAction`]: either the run fails, or it is retried once as a
    /// reinitialization.
    pub async fn synchronize_with(
        &self,
        sync_type: SyncType,
        progress: Progress,
        cancel: CancellationToken,
    ) -> SyncResult<SyncSummary> {
        let _guard = self.run_lock.lock().await;
        let options = self.local.options();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut sync_type = sync_type;

        loop {
            let mut ctx = SyncContext::new(options.scope_name.clone(), sync_type)
                .with_parameters(options.parameters.clone())
                .with_progress(progress.clone())
                .with_cancellation(cancel.clone());
            tracing::info!(session = %ctx.session_id, scope = %ctx.scope_name, ?sync_type, "sync started");

            let result = self.run(&mut ctx, started_at, start).await;
            self.state.reset();
            if let Err(e) = self.remote.end_session(&ctx).await {
                tracing::warn!(session = %ctx.session_id, error = %e, "failed to end session");
            }

            match result {
                Ok(RunOutcome::Completed(summary)) => {
                    tracing::info!(
                        session = %summary.session_id,
                        scope = %ctx.scope_name,
                        uploaded = summary.total_changes_uploaded,
                        downloaded = summary.total_changes_downloaded,
                        conflicts = summary.conflicts,
                        failed = summary.total_failed,
                        duration_ms = summary.duration.as_millis() as u64,
                        "sync completed"
                    );
                    return Ok(summary);
                }
                Ok(RunOutcome::Outdated) => {
                    let retry = match options.outdated_action {
                        OutdatedAction::Fail => None,
                        OutdatedAction::Reinitialize => Some(SyncType::Reinitialize),
                        OutdatedAction::ReinitializeWithUpload => Some(SyncType::ReinitializeWithUpload),
                    };
                    match retry {
                        Some(next) if !ctx.sync_type.is_reinitialize() => {
                            tracing::warn!(scope = %ctx.scope_name, ?next, "client scope outdated, reinitializing");
                            sync_type = next;
                        }
                        _ => {
                            return Err(SyncError::OutdatedScope {
                                scope: ctx.scope_name.clone(),
                            })
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %ctx.session_id, scope = %ctx.scope_name, error = %e, "sync failed");
                    return Err(e);
                }
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut SyncContext,
        started_at: DateTime<Utc>,
        start: Instant,
    ) -> SyncResult<RunOutcome> {
        ctx.check_cancelled()?;
        ctx.report(0, SyncStage::ScopeLoading, SyncSide::Client, "loading scopes");
        let server_scope = self.remote.ensure_scope(ctx).await?;
        let loaded = self.local.ensure_scope(&server_scope).await?;
        self.state.transition(SyncState::ScopeLoaded)?;
        if loaded.scope.reinitializing && !ctx.sync_type.is_reinitialize() {
            tracing::warn!(scope = %ctx.scope_name, "previous reinitialization interrupted, reinitializing");
            ctx.sync_type = SyncType::ReinitializeWithUpload;
        }
        if loaded.migrated && ctx.sync_type == SyncType::Normal {
            tracing::info!(scope = %ctx.scope_name, "setup changed, reinitializing");
            ctx.sync_type = SyncType::ReinitializeWithUpload;
        }
        let scope = loaded.scope;

        ctx.check_cancelled()?;
        ctx.report(10, SyncStage::ChangesSelecting, SyncSide::Client, "selecting local changes");
        let upload = self.local.select_upload(&scope, server_scope.id, ctx).await?;
        self.state.transition(SyncState::ChangesComputed)?;

        let result = self
            .exchange_and_apply(ctx, &scope, server_scope.id, &upload, started_at, start)
            .await;
        self.release(upload, true);
        result
    }

    async fn exchange_and_apply(
        &self,
        ctx: &SyncContext,
        scope: &ScopeInfo,
        server_scope_id: Uuid,
        upload: &BatchInfo,
        started_at: DateTime<Utc>,
        start: Instant,
    ) -> SyncResult<RunOutcome> {
        ctx.check_cancelled()?;
        ctx.report(25, SyncStage::ChangesExchanging, SyncSide::Client, "exchanging changes");
        let changes = match self.remote.exchange(scope, upload, ctx).await? {
            ExchangeOutcome::Changes(changes) => changes,
            ExchangeOutcome::Outdated => return Ok(RunOutcome::Outdated),
        };
        self.state.transition(SyncState::ChangesExchanged)?;

        let mut watermark = scope.clone();
        watermark.last_sync_timestamp = Some(upload.timestamp);
        watermark.last_server_sync_timestamp = Some(changes.server_timestamp);
        watermark.last_sync_at = Some(Utc::now());
        watermark.last_sync_duration_ms = start.elapsed().as_millis() as u64;
        watermark.reinitializing = false;

        ctx.report(80, SyncStage::ChangesApplying, SyncSide::Client, "applying server changes");
        let applied = self
            .local
            .apply_download(scope, server_scope_id, &changes.download, upload.timestamp, &watermark, ctx)
            .await;
        let downloaded = changes.download.row_count;
        self.release(changes.download, changes.download_owned);
        let applied = applied?;
        self.state.transition(SyncState::ChangesApplied)?;

        ctx.report(95, SyncStage::ScopeSaving, SyncSide::Client, "watermarks saved");
        self.state.transition(SyncState::ScopeSaved)?;
        ctx.report(100, SyncStage::Completed, SyncSide::Client, "synchronization completed");

        Ok(RunOutcome::Completed(SyncSummary {
            session_id: ctx.session_id,
            sync_type: ctx.sync_type,
            total_changes_uploaded: upload.row_count,
            total_changes_downloaded: downloaded,
            total_failed: changes.upload_failed + applied.failed.len(),
            conflicts: changes.conflicts.len() + applied.resolved.len(),
            from_snapshot: changes.from_snapshot,
            started_at,
            complete_time: Utc::now(),
            duration: start.elapsed(),
        }))
    }

    fn release(&self, batch: BatchInfo, owned: bool) {
        if !self.local.options().cleanup_batches {
            return;
        }
        let id = batch.id;
        if let Err(e) = batch.clear(owned) {
            tracing::warn!(batch = %id, error = %e, "failed to delete batch");
        }
    }
}
