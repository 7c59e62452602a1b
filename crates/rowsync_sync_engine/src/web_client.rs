//! The server reached over HTTP.
//!
//! An upload is sent one part per request. The final response carries the
//! run summary and the first download part; further parts are fetched one
//! at a time and written to a local batch directory as they arrive.

use crate::config::WebClientConfig;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpTransport};
use crate::peer::{ExchangeOutcome, RemotePeer, ServerChanges};
use crate::progress::SyncStage;
use async_trait::async_trait;
use rowsync_core::{write_part, BatchInfo, BatchManager, BatchPartInfo, ScopeInfo, SyncSide};
use rowsync_sync_protocol::{
    endpoints, DownloadSummary, EndSessionRequest, EndSessionResponse, EnsureScopeRequest, EnsureScopeResponse,
    GetMoreChangesRequest, GetMoreChangesResponse, PartPayload, SendChangesRequest, SendChangesResponse, SyncStatus,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Client-side proxy of a remote web server.
#[derive(Debug)]
pub struct WebClientOrchestrator<C: HttpClient> {
    transport: HttpTransport<C>,
    batches: BatchManager,
}

impl<C: HttpClient> WebClientOrchestrator<C> {
    /// Creates a proxy writing downloads under `batch_directory`.
    pub fn new(config: WebClientConfig, client: C, batch_directory: impl Into<PathBuf>) -> Self {
        Self {
            transport: HttpTransport::new(config, client),
            batches: BatchManager::new(batch_directory, 0),
        }
    }

    /// The HTTP transport.
    pub fn transport(&self) -> &HttpTransport<C> {
        &self.transport
    }

    async fn send_upload(
        &self,
        client_scope: &ScopeInfo,
        upload: &BatchInfo,
        ctx: &SyncContext,
    ) -> SyncResult<SendChangesResponse> {
        let batch_count = upload.part_count().max(1);
        for batch_index in 0..batch_count {
            ctx.check_cancelled()?;
            let part = if upload.parts.is_empty() {
                None
            } else {
                Some(PartPayload {
                    info: upload.parts[batch_index].clone(),
                    set: upload.read_part(batch_index)?,
                })
            };
            let is_last = batch_index + 1 == batch_count;
            let request = SendChangesRequest {
                session_id: ctx.session_id,
                scope_name: ctx.scope_name.clone(),
                sync_type: ctx.sync_type,
                client_scope: client_scope.clone(),
                parameters: ctx.parameters.clone(),
                batch_index,
                batch_count,
                is_last,
                part,
                client_timestamp: upload.timestamp,
            };
            let response: SendChangesResponse = self
                .transport
                .post_message(endpoints::SEND_CHANGES, &request)
                .await?;
            if response.session_id != ctx.session_id {
                return Err(SyncError::BadMessage(format!(
                    "response for session {} in session {}",
                    response.session_id, ctx.session_id
                )));
            }
            if is_last || response.status == SyncStatus::Outdated {
                return Ok(response);
            }
            tracing::debug!(session = %ctx.session_id, batch_index, batch_count, "upload part sent");
        }
        Err(SyncError::BadMessage("upload ended without a final response".into()))
    }

    async fn receive_download(
        &self,
        directory: &Path,
        summary: &DownloadSummary,
        first: Option<PartPayload>,
        timestamp: u64,
        ctx: &SyncContext,
    ) -> SyncResult<BatchInfo> {
        let mut batch = BatchInfo::new(directory, timestamp);
        let mut pending = first;
        for batch_index in 0..summary.batch_count {
            ctx.check_cancelled()?;
            let payload = match pending.take() {
                Some(payload) => payload,
                None => {
                    let request = GetMoreChangesRequest {
                        session_id: ctx.session_id,
                        scope_name: ctx.scope_name.clone(),
                        batch_index,
                    };
                    let response: GetMoreChangesResponse = self
                        .transport
                        .post_message(endpoints::GET_MORE_CHANGES, &request)
                        .await?;
                    response.part
                }
            };
            let part = store_part(directory, batch_index, payload)?;
            batch.row_count += part.row_count;
            batch.parts.push(part);
            ctx.report(
                (60 + 20 * (batch_index + 1) / summary.batch_count) as u8,
                SyncStage::ChangesExchanging,
                SyncSide::Client,
                format!("received part {} of {}", batch_index + 1, summary.batch_count),
            );
        }

        if batch.row_count != summary.row_count {
            return Err(SyncError::BadMessage(format!(
                "download holds {} rows, server announced {}",
                batch.row_count, summary.row_count
            )));
        }
        batch.validate()?;
        batch.save()?;
        Ok(batch)
    }
}

/// Writes a received part and checks it against its announced metadata.
fn store_part(directory: &Path, expected_index: usize, payload: PartPayload) -> SyncResult<BatchPartInfo> {
    if payload.info.index != expected_index {
        return Err(SyncError::BadMessage(format!(
            "expected part {expected_index}, received part {}",
            payload.info.index
        )));
    }
    let mut part = write_part(directory, expected_index, &payload.set)?;
    if part.row_count != payload.info.row_count {
        return Err(SyncError::BadMessage(format!(
            "part {expected_index} holds {} rows, server announced {}",
            part.row_count, payload.info.row_count
        )));
    }
    part.is_last = payload.info.is_last;
    Ok(part)
}

#[async_trait]
impl<C: HttpClient> RemotePeer for WebClientOrchestrator<C> {
    async fn ensure_scope(&self, ctx: &SyncContext) -> SyncResult<ScopeInfo> {
        let request = EnsureScopeRequest::new(ctx.session_id, ctx.scope_name.clone());
        let response: EnsureScopeResponse = self
            .transport
            .post_message(endpoints::ENSURE_SCOPE, &request)
            .await?;
        if response.server_scope.name != ctx.scope_name {
            return Err(SyncError::BadMessage(format!(
                "asked for scope {}, received {}",
                ctx.scope_name, response.server_scope.name
            )));
        }
        Ok(response.server_scope)
    }

    async fn exchange(
        &self,
        client_scope: &ScopeInfo,
        upload: &BatchInfo,
        ctx: &SyncContext,
    ) -> SyncResult<ExchangeOutcome> {
        let response = self.send_upload(client_scope, upload, ctx).await?;
        if response.status == SyncStatus::Outdated {
            return Ok(ExchangeOutcome::Outdated);
        }
        let summary = response
            .download
            .ok_or_else(|| SyncError::BadMessage("final response without a download summary".into()))?;

        let directory = self.batches.receive_directory()?;
        let received = self
            .receive_download(&directory, &summary, response.part, response.server_timestamp, ctx)
            .await;
        let download = match received {
            Ok(download) => download,
            Err(e) => {
                let _ = fs::remove_dir_all(&directory);
                return Err(e);
            }
        };

        tracing::info!(
            session = %ctx.session_id,
            parts = download.part_count(),
            rows = download.row_count,
            from_snapshot = summary.from_snapshot,
            "download received"
        );
        Ok(ExchangeOutcome::Changes(ServerChanges {
            server_timestamp: response.server_timestamp,
            upload_applied: response.applied,
            upload_failed: response.failed,
            conflicts: response.conflicts,
            download,
            from_snapshot: summary.from_snapshot,
            download_owned: true,
        }))
    }

    async fn end_session(&self, ctx: &SyncContext) -> SyncResult<()> {
        let request = EndSessionRequest {
            session_id: ctx.session_id,
            scope_name: ctx.scope_name.clone(),
        };
        let _: EndSessionResponse = self
            .transport
            .post_message(endpoints::END_SESSION, &request)
            .await?;
        Ok(())
    }
}
