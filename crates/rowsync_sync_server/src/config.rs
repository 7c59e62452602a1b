//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Directory holding one subdirectory per open session.
    pub session_directory: PathBuf,
    /// Directory of snapshots served to new clients. Disabled when unset.
    pub snapshot_directory: Option<PathBuf>,
    /// Maximum rows per download part.
    pub batch_size: usize,
    /// Maximum request body size in bytes.
    pub body_limit: usize,
    /// Sessions idle for longer than this are purged.
    pub session_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration keeping sessions under `session_directory`.
    pub fn new(bind_addr: SocketAddr, session_directory: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            session_directory: session_directory.into(),
            snapshot_directory: None,
            batch_size: 1000,
            body_limit: 16 * 1024 * 1024,
            session_expiry: Duration::from_secs(60 * 60),
        }
    }

    /// Enables snapshots under `directory`.
    pub fn with_snapshot_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.snapshot_directory = Some(directory.into());
        self
    }

    /// Sets the maximum rows per download part.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the maximum request body size.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Sets the session expiry.
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = expiry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::from(([127, 0, 0, 1], 8080)),
            std::env::temp_dir().join("rowsync-sessions"),
        )
    }
}
