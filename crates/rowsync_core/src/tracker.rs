//! Change selection.

use crate::batch::{BatchInfo, BatchWriter};
use crate::error::{CoreError, CoreResult};
use crate::filter::SyncParameters;
use crate::interceptor::{Interceptors, TableSelecting};
use crate::provider::{SelectChanges, StorageProvider};
use crate::row::SyncTable;
use crate::schema::SyncSchema;
use crate::setup::{SyncSetup, SyncSide};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What to select.
#[derive(Debug, Clone)]
pub struct ChangeRequest<'a> {
    /// Setup of the scope.
    pub setup: &'a SyncSetup,
    /// Schema of the setup's tables.
    pub schema: &'a SyncSchema,
    /// Side selecting. Tables not flowing away from it are skipped.
    pub side: SyncSide,
    /// Only changes tracked above this timestamp are selected.
    pub since: u64,
    /// Changes last written by this scope are not echoed back.
    pub exclude_scope_id: Option<Uuid>,
    /// Filter parameter values.
    pub parameters: &'a SyncParameters,
}

/// Selects pending changes into a batch.
///
/// Upserts are selected parents first and tombstones children first, so
/// that applying the batch in order keeps foreign keys satisfiable.
#[derive(Debug)]
pub struct ChangeTracker<'a, P> {
    provider: &'a P,
    interceptors: &'a Interceptors,
}

impl<'a, P: StorageProvider> ChangeTracker<'a, P> {
    /// Creates a tracker.
    pub fn new(provider: &'a P, interceptors: &'a Interceptors) -> Self {
        Self {
            provider,
            interceptors,
        }
    }

    /// Selects every pending change of `request` into `writer`.
    ///
    /// The returned manifest carries the timestamp read in `txn` before
    /// selecting: every change at or below it was considered.
    pub async fn get_changes(
        &self,
        txn: &mut P::Transaction,
        request: &ChangeRequest<'_>,
        mut writer: BatchWriter,
        cancel: &CancellationToken,
    ) -> CoreResult<BatchInfo> {
        let timestamp = self.provider.current_timestamp(txn).await?;

        // A client only holds rows that already passed its filters.
        let mut bound = Vec::new();
        if request.side == SyncSide::Server {
            for filter in &request.setup.filters {
                bound.push(filter.bind(request.parameters, request.schema)?);
            }
        }

        let ordered = request.schema.dependency_order();
        let passes = [
            (false, ordered.clone()),
            (true, ordered.into_iter().rev().collect::<Vec<_>>()),
        ];

        for (tombstones, tables) in passes {
            for table in tables {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let Some(setup_table) = request.setup.table(&table.name) else {
                    continue;
                };
                if !request.side.selects(setup_table.direction) {
                    continue;
                }

                let mut selecting = TableSelecting {
                    table: table.name.clone(),
                    since: request.since,
                    tombstones,
                    skip: false,
                };
                self.interceptors.table_changes_selecting(&mut selecting);
                if selecting.skip {
                    tracing::debug!(table = %table.name, "selection skipped by hook");
                    continue;
                }

                let procedure = request.setup.select_procedure(&table.name);
                let rows = self
                    .provider
                    .select_changes(
                        txn,
                        &SelectChanges {
                            table,
                            procedure: &procedure,
                            filter: bound.iter().find(|b| b.filter.table == table.name),
                            since: request.since,
                            exclude_scope_id: request.exclude_scope_id,
                            tombstones,
                        },
                    )
                    .await?;

                let mut selected = SyncTable::new(
                    table.name.clone(),
                    table.column_names(),
                    table.primary_key.clone(),
                );
                selected.rows = rows;
                self.interceptors.table_changes_selected(&mut selected);

                tracing::debug!(
                    table = %table.name,
                    tombstones,
                    rows = selected.len(),
                    since = request.since,
                    "changes selected"
                );
                let template = SyncTable::new(
                    selected.name.clone(),
                    selected.columns.clone(),
                    selected.primary_key.clone(),
                );
                for row in selected.rows {
                    writer.push(&template, row)?;
                }
            }
        }

        writer.finish(timestamp)
    }
}
