//! # rowsync Sync Protocol
//!
//! Wire messages exchanged between the web client and the web server.
//!
//! This crate provides:
//! - [`SyncType`] and [`SyncStatus`]
//! - Endpoint paths in [`endpoints`]
//! - Request and response bodies with CBOR encoding via [`Message`]
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod messages;
mod types;

pub use messages::{
    DownloadSummary, EndSessionRequest, EndSessionResponse, EnsureScopeRequest, EnsureScopeResponse,
    GetMoreChangesRequest, GetMoreChangesResponse, Message, PartPayload, SendChangesRequest, SendChangesResponse,
};
pub use types::{endpoints, SyncStatus, SyncType, PROTOCOL_VERSION};
