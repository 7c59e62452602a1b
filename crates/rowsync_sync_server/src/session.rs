//! Disk-backed sessions.
//!
//! Every request carries its session id; nothing about a run is kept in
//! memory between requests. A session directory holds:
//!
//! - `session.cbor`: the session record
//! - `upload/`: upload parts received so far
//! - `download/`: the download batch prepared for the client
//!
//! Once the final upload request succeeded, the record also caches the
//! response, so a retried final request is answered without applying the
//! upload twice.

use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rowsync_codec::{from_cbor, to_cbor};
use rowsync_core::{BatchInfo, BatchPartInfo};
use rowsync_sync_protocol::SendChangesResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

const SESSION_FILE: &str = "session.cbor";
const UPLOAD_DIR: &str = "upload";
const DOWNLOAD_DIR: &str = "download";

/// Record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Session {
    /// Scope the session synchronizes.
    pub(crate) scope_name: String,
    /// Last time a request touched the session.
    pub(crate) updated_at: DateTime<Utc>,
    /// Upload parts received, by index.
    pub(crate) upload: Vec<BatchPartInfo>,
    /// Directory of the download batch, which may be a shared snapshot.
    pub(crate) download: Option<PathBuf>,
    /// Final upload response, without its part.
    pub(crate) response: Option<SendChangesResponse>,
}

impl Session {
    fn new(scope_name: &str) -> Self {
        Self {
            scope_name: scope_name.to_string(),
            updated_at: Utc::now(),
            upload: Vec::new(),
            download: None,
            response: None,
        }
    }

    /// Records a received upload part, replacing a previous copy.
    pub(crate) fn record_upload(&mut self, part: BatchPartInfo) {
        self.upload.retain(|p| p.index != part.index);
        self.upload.push(part);
        self.upload.sort_by_key(|p| p.index);
    }

    /// Assembles the upload once every part arrived.
    pub(crate) fn upload_batch(&self, directory: &Path, timestamp: u64, expected: usize) -> ServerResult<BatchInfo> {
        if self.upload.len() != expected {
            return Err(ServerError::InvalidRequest(format!(
                "received {} of {expected} upload parts",
                self.upload.len()
            )));
        }
        let mut batch = BatchInfo::new(directory, timestamp);
        batch.parts = self.upload.clone();
        batch.row_count = batch.parts.iter().map(|p| p.row_count).sum();
        batch.validate()?;
        Ok(batch)
    }

    /// Loads the download batch.
    pub(crate) fn download_batch(&self, id: Uuid) -> ServerResult<BatchInfo> {
        let directory = self.download.as_deref().ok_or(ServerError::UnknownSession(id))?;
        BatchInfo::load(directory)?
            .ok_or_else(|| ServerError::Internal(format!("download of session {id} is gone")))
    }
}

/// The session directory of a server.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    expiry: Duration,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    /// Creates a store rooted at `root`, expiring sessions idle for longer
    /// than `expiry`.
    pub fn new(root: impl Into<PathBuf>, expiry: Duration) -> Self {
        Self {
            root: root.into(),
            expiry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn directory(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub(crate) fn upload_directory(&self, id: Uuid) -> PathBuf {
        self.directory(id).join(UPLOAD_DIR)
    }

    pub(crate) fn download_root(&self, id: Uuid) -> PathBuf {
        self.directory(id).join(DOWNLOAD_DIR)
    }

    /// Serializes requests of one session.
    pub(crate) async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());
        lock.lock_owned().await
    }

    /// Loads a session record.
    pub(crate) fn load(&self, id: Uuid) -> ServerResult<Option<Session>> {
        let path = self.directory(id).join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let session = from_cbor(&bytes)
            .map_err(|e| ServerError::Internal(format!("unreadable session {id}: {e}")))?;
        Ok(Some(session))
    }

    /// Loads a session record, creating it on the first request.
    pub(crate) fn open(&self, id: Uuid, scope_name: &str) -> ServerResult<Session> {
        match self.load(id)? {
            Some(session) if session.scope_name == scope_name => Ok(session),
            Some(session) => Err(ServerError::InvalidRequest(format!(
                "session {id} belongs to scope {}",
                session.scope_name
            ))),
            None => {
                let session = Session::new(scope_name);
                self.save(id, &session)?;
                tracing::debug!(session = %id, scope = scope_name, "session opened");
                Ok(session)
            }
        }
    }

    /// Saves a session record, refreshing its expiry.
    pub(crate) fn save(&self, id: Uuid, session: &Session) -> ServerResult<()> {
        let directory = self.directory(id);
        fs::create_dir_all(&directory)?;
        let mut session = session.clone();
        session.updated_at = Utc::now();
        let bytes = to_cbor(&session).map_err(|e| ServerError::Internal(e.to_string()))?;
        let temp = directory.join(format!("{SESSION_FILE}.tmp"));
        fs::write(&temp, bytes)?;
        fs::rename(&temp, directory.join(SESSION_FILE))?;
        Ok(())
    }

    /// Deletes a session. Returns false if it did not exist.
    pub(crate) fn remove(&self, id: Uuid) -> ServerResult<bool> {
        self.locks.lock().remove(&id);
        let directory = self.directory(id);
        if !directory.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&directory)?;
        Ok(true)
    }

    /// Ids of the sessions on disk.
    pub fn session_ids(&self) -> ServerResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes sessions idle since before `now` minus the expiry, and
    /// session directories without a record. Sessions serving a request
    /// are skipped. Returns the number of sessions deleted.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> ServerResult<usize> {
        let expiry = chrono::Duration::from_std(self.expiry)
            .map_err(|e| ServerError::Internal(format!("invalid session expiry: {e}")))?;
        let mut purged = 0;
        for id in self.session_ids()? {
            let lock = self.locks.lock().get(&id).cloned();
            let _guard = match &lock {
                Some(lock) => match lock.try_lock() {
                    Ok(guard) => Some(guard),
                    Err(_) => continue,
                },
                None => None,
            };
            let expired = match self.load(id) {
                Ok(Some(session)) => session.updated_at + expiry < now,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "discarding unreadable session");
                    true
                }
            };
            if expired {
                self.remove(id)?;
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "expired sessions purged");
        }
        Ok(purged)
    }
}
