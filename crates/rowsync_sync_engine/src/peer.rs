//! The server as seen by a client.

use crate::context::SyncContext;
use crate::error::SyncResult;
use async_trait::async_trait;
use rowsync_core::{BatchInfo, ResolvedConflict, ScopeInfo};
use std::sync::Arc;

/// Server answer to an upload.
#[derive(Debug, Clone)]
pub struct ServerChanges {
    /// Server watermark the client stores once the download is applied.
    pub server_timestamp: u64,
    /// Upload rows the server applied.
    pub upload_applied: usize,
    /// Upload rows the server could not apply.
    pub upload_failed: usize,
    /// Conflicts the server resolved while applying the upload.
    pub conflicts: Vec<ResolvedConflict>,
    /// Changes for the client, readable on the client side.
    pub download: BatchInfo,
    /// True if the download is a snapshot.
    pub from_snapshot: bool,
    /// True if the download directory belongs to this run and may be
    /// deleted once applied.
    pub download_owned: bool,
}

/// Result of an exchange.
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    /// The upload was applied and the download prepared.
    Changes(ServerChanges),
    /// The client watermark predates the server history. Nothing was applied.
    Outdated,
}

/// The server side of a run, in process or over HTTP.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Loads the server scope, provisioning the server on first use.
    async fn ensure_scope(&self, ctx: &SyncContext) -> SyncResult<ScopeInfo>;

    /// Sends the client upload and receives the server changes.
    async fn exchange(
        &self,
        client_scope: &ScopeInfo,
        upload: &BatchInfo,
        ctx: &SyncContext,
    ) -> SyncResult<ExchangeOutcome>;

    /// Releases whatever the server keeps for the run.
    async fn end_session(&self, _ctx: &SyncContext) -> SyncResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: RemotePeer + ?Sized> RemotePeer for Arc<T> {
    async fn ensure_scope(&self, ctx: &SyncContext) -> SyncResult<ScopeInfo> {
        (**self).ensure_scope(ctx).await
    }

    async fn exchange(
        &self,
        client_scope: &ScopeInfo,
        upload: &BatchInfo,
        ctx: &SyncContext,
    ) -> SyncResult<ExchangeOutcome> {
        (**self).exchange(client_scope, upload, ctx).await
    }

    async fn end_session(&self, ctx: &SyncContext) -> SyncResult<()> {
        (**self).end_session(ctx).await
    }
}
