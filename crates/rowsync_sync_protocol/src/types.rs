//! Shared protocol enums and constants.

use serde::{Deserialize, Serialize};

/// Version of the wire protocol. Bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Endpoint paths, relative to the server base URL.
pub mod endpoints {
    /// Loads or provisions the server scope.
    pub const ENSURE_SCOPE: &str = "/sync/ensure-scope";
    /// Uploads one part of the client changeset.
    pub const SEND_CHANGES: &str = "/sync/send-changes";
    /// Downloads one further part of the server changeset.
    pub const GET_MORE_CHANGES: &str = "/sync/get-more-changes";
    /// Releases the server session.
    pub const END_SESSION: &str = "/sync/end-session";
}

/// Kind of synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncType {
    /// Incremental, from the stored watermarks.
    #[default]
    Normal,
    /// Discard local data and download everything. Local edits are lost.
    Reinitialize,
    /// Upload local edits first, then discard local data and download
    /// everything.
    ReinitializeWithUpload,
}

impl SyncType {
    /// Returns true if local tables are reset and fully downloaded.
    pub fn is_reinitialize(&self) -> bool {
        !matches!(self, SyncType::Normal)
    }

    /// Returns true if local changes are uploaded.
    pub fn uploads(&self) -> bool {
        !matches!(self, SyncType::Reinitialize)
    }
}

/// Outcome of an upload, as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Changes were exchanged.
    Ok,
    /// The client watermark predates the retained history; nothing was
    /// applied and the client must reinitialize.
    Outdated,
}
