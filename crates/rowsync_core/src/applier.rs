//! Application of a batch to a store.
//!
//! Each batch part is applied in its own transaction. Cancellation is only
//! observed between parts, so a cancelled run leaves whole parts applied or
//! not at all. The scope watermark, when given, is saved in the transaction
//! of the last part, so it never advances past rows that were not committed.
//!
//! A reinitialization resets the tables in the transaction of the first
//! part. When more parts follow, that transaction also marks the scope as
//! reinitializing, so a run interrupted after it is redone from scratch.

use crate::batch::BatchInfo;
use crate::conflict::{Conflict, ConflictAction, ConflictPolicy, ConflictResolver, ResolvedConflict};
use crate::error::{CoreError, CoreResult};
use crate::interceptor::{Interceptors, TableApplied};
use crate::provider::{ApplyContext, ProcedureKind, StorageProvider};
use crate::row::{display_key, FailedRow, RowState, SyncRow, SyncSet, SyncTable};
use crate::schema::SyncSchema;
use crate::scope::{ScopeInfo, ScopeStore};
use crate::setup::{SyncSetup, SyncSide};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a batch is applied.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Side applying the batch.
    pub side: SyncSide,
    /// Scope id of the applying side.
    pub local_scope_id: Uuid,
    /// Scope id of the side that produced the batch.
    pub sender_scope_id: Uuid,
    /// Base watermark: local rows tracked above it are potential conflicts.
    pub last_sync_timestamp: u64,
    /// Automatic conflict policy.
    pub policy: ConflictPolicy,
    /// Enforce foreign keys while applying.
    pub check_constraints: bool,
    /// Reset every table of the setup before the first part.
    pub reinitialize: bool,
    /// Fail the run when a conflict hook aborts a row.
    pub escalate_conflict_abort: bool,
}

/// Result of applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Rows written or already present.
    pub applied: usize,
    /// Conflicts and how they were resolved.
    pub resolved: Vec<ResolvedConflict>,
    /// Rows that could not be applied.
    pub failed: Vec<FailedRow>,
    /// Parts applied.
    pub parts: usize,
}

/// Applies batches through a provider.
#[derive(Debug)]
pub struct ChangeApplier<'a, P> {
    provider: &'a P,
    interceptors: &'a Interceptors,
    setup: &'a SyncSetup,
    schema: &'a SyncSchema,
}

impl<'a, P: StorageProvider> ChangeApplier<'a, P> {
    /// Creates an applier for one scope.
    pub fn new(
        provider: &'a P,
        interceptors: &'a Interceptors,
        setup: &'a SyncSetup,
        schema: &'a SyncSchema,
    ) -> Self {
        Self {
            provider,
            interceptors,
            setup,
            schema,
        }
    }

    /// Applies every part of `batch`.
    ///
    /// When `watermark` is given the scope is saved with the last part, or in
    /// a transaction of its own when the batch is empty.
    pub async fn apply(
        &self,
        batch: &BatchInfo,
        options: &ApplyOptions,
        watermark: Option<(&ScopeStore, &ScopeInfo)>,
        cancel: &CancellationToken,
    ) -> CoreResult<ApplyReport> {
        let resolver = ConflictResolver::new(
            options.policy,
            options.side,
            options.local_scope_id,
            options.sender_scope_id,
        );
        let mut report = ApplyReport::default();

        if batch.parts.is_empty() {
            if options.reinitialize || watermark.is_some() {
                let mut txn = self.provider.begin().await?;
                let result = self.finish_part(&mut txn, SyncSet::new(), true, 0, options, &resolver, watermark, &mut report).await;
                self.settle(txn, result).await?;
            }
            return Ok(report);
        }

        for index in 0..batch.parts.len() {
            if cancel.is_cancelled() {
                tracing::info!(batch = %batch.id, applied_parts = index, "apply cancelled");
                return Err(CoreError::Cancelled);
            }
            let set = batch.read_part(index)?;
            let last = index + 1 == batch.parts.len();
            let mut txn = self.provider.begin().await?;
            let result = self
                .finish_part(&mut txn, set, last, index, options, &resolver, watermark, &mut report)
                .await;
            self.settle(txn, result).await?;
            report.parts += 1;
        }

        tracing::debug!(
            side = options.side.as_str(),
            applied = report.applied,
            conflicts = report.resolved.len(),
            failed = report.failed.len(),
            "batch applied"
        );
        Ok(report)
    }

    async fn settle(&self, txn: P::Transaction, result: CoreResult<()>) -> CoreResult<()> {
        match result {
            Ok(()) => self.provider.commit(txn).await,
            Err(e) => {
                self.provider.rollback(txn).await?;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_part(
        &self,
        txn: &mut P::Transaction,
        set: SyncSet,
        last: bool,
        index: usize,
        options: &ApplyOptions,
        resolver: &ConflictResolver,
        watermark: Option<(&ScopeStore, &ScopeInfo)>,
        report: &mut ApplyReport,
    ) -> CoreResult<()> {
        if index == 0 && options.reinitialize {
            self.reset_tables(txn).await?;
            if !last {
                if let Some((store, scope)) = watermark {
                    let mut pending = scope.clone();
                    pending.reinitializing = true;
                    store.save_scope(self.provider, txn, &pending).await?;
                }
            }
        }
        for table in set.tables {
            self.apply_table(txn, table, options, resolver, report).await?;
        }
        if last {
            if let Some((store, scope)) = watermark {
                store.save_scope(self.provider, txn, scope).await?;
            }
        }
        Ok(())
    }

    async fn reset_tables(&self, txn: &mut P::Transaction) -> CoreResult<()> {
        for table in self.schema.dependency_order().into_iter().rev() {
            let procedure = self.setup.procedure(&table.name, ProcedureKind::Reset);
            self.provider.reset_table(txn, &table.name, &procedure).await?;
        }
        tracing::info!(tables = self.schema.tables.len(), "tables reset for reinitialization");
        Ok(())
    }

    fn accepts(&self, table: &str, side: SyncSide) -> bool {
        match self.setup.table(table) {
            Some(t) => match side {
                SyncSide::Server => t.direction.uploads(),
                SyncSide::Client => t.direction.downloads(),
            },
            None => false,
        }
    }

    async fn apply_table(
        &self,
        txn: &mut P::Transaction,
        mut table: SyncTable,
        options: &ApplyOptions,
        resolver: &ConflictResolver,
        report: &mut ApplyReport,
    ) -> CoreResult<()> {
        let schema = self.schema.require(&table.name)?;
        if !self.accepts(&table.name, options.side) {
            tracing::warn!(table = %table.name, rows = table.len(), "rows for a table not flowing this way ignored");
            return Ok(());
        }

        self.interceptors.table_changes_applying(&mut table);
        if table.is_empty() {
            return Ok(());
        }

        let context = ApplyContext {
            sender_scope_id: options.sender_scope_id,
            last_sync_timestamp: options.last_sync_timestamp,
            write_scope_id: Some(options.sender_scope_id),
            force: false,
            check_constraints: options.check_constraints,
            update_procedure: self.setup.procedure(&table.name, ProcedureKind::Update),
            delete_procedure: self.setup.procedure(&table.name, ProcedureKind::Delete),
        };
        let outcome = self
            .provider
            .apply_rows(txn, schema, &table.columns, &table.rows, &context)
            .await?;

        let mut summary = TableApplied {
            table: table.name.clone(),
            applied: outcome.applied,
            conflicts: outcome.conflicts.len(),
            failed: outcome.failed.len(),
        };
        report.failed.extend(outcome.failed);

        for found in outcome.conflicts {
            let key = table.key_of(&found.remote);
            let conflict = Conflict {
                table: table.name.clone(),
                columns: table.columns.clone(),
                key: key.clone(),
                local: found.local,
                remote: found.remote,
                side: options.side,
            };
            let action = resolver.resolve(&conflict, self.interceptors);
            let resolution = resolver.outcome(&action);
            tracing::debug!(
                table = %table.name,
                key = %display_key(&key),
                outcome = ?resolution,
                "conflict resolved"
            );

            let forced = match action {
                ConflictAction::KeepLocal => None,
                ConflictAction::KeepRemote => Some((conflict.remote, context.write_scope_id)),
                ConflictAction::Merge(values) => {
                    let mut merged = SyncRow::upsert(RowState::Modified, values);
                    merged.update_scope_id = None;
                    Some((merged, None))
                }
                ConflictAction::Abort => {
                    if options.escalate_conflict_abort {
                        return Err(CoreError::ConflictAborted {
                            table: table.name.clone(),
                            key: display_key(&key),
                        });
                    }
                    report
                        .failed
                        .push(FailedRow::new(&table.name, key.clone(), "conflict aborted by hook"));
                    summary.failed += 1;
                    None
                }
            };

            if let Some((row, write_scope_id)) = forced {
                let forced_context = ApplyContext {
                    write_scope_id,
                    force: true,
                    ..context.clone()
                };
                let forced_outcome = self
                    .provider
                    .apply_rows(txn, schema, &table.columns, std::slice::from_ref(&row), &forced_context)
                    .await?;
                summary.failed += forced_outcome.failed.len();
                report.failed.extend(forced_outcome.failed);
            }

            report.resolved.push(ResolvedConflict {
                table: table.name.clone(),
                key,
                outcome: resolution,
            });
        }

        report.applied += summary.applied;
        self.interceptors.table_changes_applied(&summary);
        Ok(())
    }
}
