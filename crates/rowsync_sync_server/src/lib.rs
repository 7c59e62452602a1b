//! # rowsync Sync Server
//!
//! HTTP sync server for rowsync.
//!
//! This crate provides:
//! - [`WebServerOrchestrator`], serving named scopes over the sync protocol
//! - Disk-backed sessions tying the requests of one run together
//! - An axum [`router`] and the [`serve`] loop
//!
//! # Architecture
//!
//! The server keeps no run state in memory. A run is a sequence of requests
//! sharing a session id:
//! 1. `ensure-scope` returns the server scope, provisioning it on first use
//! 2. `send-changes` delivers the upload one part per request; the final
//!    request applies it and answers with the first download part
//! 3. `get-more-changes` returns the remaining download parts
//! 4. `end-session` deletes the session directory
//!
//! A retried final `send-changes` request is answered from the session
//! record, so the upload is applied once.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod session;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::WebServerOrchestrator;
pub use server::{router, serve, serve_on, CBOR_CONTENT_TYPE};
pub use session::SessionStore;
