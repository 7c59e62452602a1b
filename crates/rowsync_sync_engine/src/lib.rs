//! # rowsync Sync Engine
//!
//! Orchestrators and the sync agent for rowsync.
//!
//! This crate provides:
//! - The [`Orchestrator`] contract shared by both sides of a run
//! - [`LocalOrchestrator`] for the client store and [`RemoteOrchestrator`]
//!   for the authoritative server store
//! - [`WebClientOrchestrator`], a [`RemotePeer`] reached over HTTP, with the
//!   [`HttpClient`] abstraction, [`ReqwestClient`] and [`LoopbackClient`]
//! - [`SyncAgent`], which sequences a run and reports a [`SyncSummary`]
//! - Run state tracking, progress reporting and retry with backoff
//!
//! ## Architecture
//!
//! A run is **upload-then-download**:
//! 1. The client selects its changes above its local watermark
//! 2. The server applies them, then selects its changes above the client's
//!    server watermark, excluding the rows the client itself wrote
//! 3. The client applies the download and saves both watermarks with the
//!    last part
//!
//! The server resolves conflicts on the upload; the client resolves
//! conflicts on the download, with the same policy.
//!
//! ## Key Invariants
//!
//! - One run per agent at a time
//! - A failed run leaves both watermarks untouched
//! - Cancellation is observed between batch parts only
//! - Re-applying a batch has no effect beyond the first application

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod config;
mod context;
mod error;
mod http;
mod local;
mod orchestrator;
mod peer;
mod progress;
mod remote;
mod state;
mod web_client;

pub use agent::{SyncAgent, SyncSummary};
pub use config::{OutdatedAction, RetryPolicy, SyncOptions, WebClientConfig, DEFAULT_BATCH_SIZE, DEFAULT_SCOPE_NAME};
pub use context::SyncContext;
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer, ReqwestClient};
pub use local::{LoadedScope, LocalOrchestrator};
pub use orchestrator::{ApplyRequest, ChangesQuery, Orchestrator};
pub use peer::{ExchangeOutcome, RemotePeer, ServerChanges};
pub use progress::{Progress, ProgressEvent, SyncStage};
pub use remote::RemoteOrchestrator;
pub use state::{RunState, SyncState};
pub use web_client::WebClientOrchestrator;
