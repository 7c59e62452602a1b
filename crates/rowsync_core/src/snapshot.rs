//! Long-lived initial-load batches.
//!
//! A snapshot holds every row of a setup as of its creation, in the regular
//! batch layout. Its directory name derives from the scope name, the setup
//! fingerprint and the filter parameters, so a setup change or different
//! parameters never reuse a stale snapshot.
//!
//! Creation builds the batch in a temporary directory and renames it into
//! place while holding an advisory lock, so readers never see a half-written
//! snapshot and two creators never write the same directory.

use crate::batch::{BatchInfo, BatchWriter};
use crate::error::{CoreError, CoreResult};
use crate::filter::SyncParameters;
use crate::interceptor::Interceptors;
use crate::provider::StorageProvider;
use crate::schema::SyncSchema;
use crate::setup::{SyncSetup, SyncSide};
use crate::tracker::{ChangeRequest, ChangeTracker};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HASH_PREFIX_LEN: usize = 16;

/// A snapshot found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Directory name.
    pub name: String,
    /// Batch manifest.
    pub batch: BatchInfo,
}

/// Exclusive lock on one snapshot name, released on drop.
struct SnapshotLock {
    _file: File,
}

impl SnapshotLock {
    fn acquire(root: &Path, name: &str) -> CoreResult<Self> {
        let path = root.join(format!(".{name}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked {
                path: path.display().to_string(),
            });
        }
        Ok(Self { _file: file })
    }
}

/// The snapshot directory of a server.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of the snapshot for a scope, setup and parameters.
    pub fn directory_name(scope: &str, setup_hash: &str, parameters: &SyncParameters) -> CoreResult<String> {
        let setup_part = &setup_hash[..setup_hash.len().min(HASH_PREFIX_LEN)];
        if parameters.is_empty() {
            Ok(format!("{scope}_{setup_part}"))
        } else {
            let hash = parameters.fingerprint()?;
            Ok(format!("{scope}_{setup_part}_{}", &hash[..HASH_PREFIX_LEN]))
        }
    }

    /// Loads the snapshot matching the arguments, if one exists.
    pub fn find(&self, scope: &str, setup_hash: &str, parameters: &SyncParameters) -> CoreResult<Option<BatchInfo>> {
        let name = Self::directory_name(scope, setup_hash, parameters)?;
        let directory = self.root.join(&name);
        if !directory.is_dir() {
            return Ok(None);
        }
        BatchInfo::load(&directory)
    }

    /// Selects every row of `setup` into a new snapshot, replacing any
    /// previous snapshot of the same name.
    ///
    /// The manifest timestamp is the store's timestamp at selection, from
    /// which clients bootstrapped on the snapshot resume.
    #[allow(clippy::too_many_arguments)]
    pub async fn create<P: StorageProvider>(
        &self,
        provider: &P,
        scope: &str,
        setup: &SyncSetup,
        schema: &SyncSchema,
        parameters: &SyncParameters,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> CoreResult<BatchInfo> {
        fs::create_dir_all(&self.root)?;
        let name = Self::directory_name(scope, &setup.fingerprint()?, parameters)?;
        let _lock = SnapshotLock::acquire(&self.root, &name)?;

        let staging = self.root.join(format!(".{name}.{}", Uuid::new_v4()));
        let writer = BatchWriter::new(&staging, batch_size)?;
        let interceptors = Interceptors::new();
        let tracker = ChangeTracker::new(provider, &interceptors);
        let request = ChangeRequest {
            setup,
            schema,
            side: SyncSide::Server,
            since: 0,
            exclude_scope_id: None,
            parameters,
        };

        let mut txn = provider.begin().await?;
        let selected = tracker.get_changes(&mut txn, &request, writer, cancel).await;
        provider.rollback(txn).await?;
        let mut info = match selected {
            Ok(info) => info,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        let target = self.root.join(&name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;
        info.directory = target;

        tracing::info!(
            snapshot = %name,
            rows = info.row_count,
            parts = info.part_count(),
            timestamp = info.timestamp,
            "snapshot created"
        );
        Ok(info)
    }

    /// Lists complete snapshots, sorted by name.
    pub fn list(&self) -> CoreResult<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        if !self.root.is_dir() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if let Some(batch) = BatchInfo::load(&entry.path())? {
                entries.push(SnapshotEntry { name, batch });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Deletes a snapshot by directory name.
    pub fn delete(&self, name: &str) -> CoreResult<()> {
        let _lock = SnapshotLock::acquire(&self.root, name)?;
        let directory = self.root.join(name);
        if directory.exists() {
            fs::remove_dir_all(directory)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_depend_on_parameters() {
        let hash = "0123456789abcdef0123456789abcdef";
        let plain = SnapshotStore::directory_name("default", hash, &SyncParameters::new()).unwrap();
        assert_eq!(plain, "default_0123456789abcdef");

        let eu = SyncParameters::new().with("Region", "EU");
        let us = SyncParameters::new().with("Region", "US");
        let eu_name = SnapshotStore::directory_name("default", hash, &eu).unwrap();
        assert!(eu_name.starts_with("default_0123456789abcdef_"));
        assert_ne!(eu_name, SnapshotStore::directory_name("default", hash, &us).unwrap());
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = SnapshotLock::acquire(dir.path(), "default_x").unwrap();
        assert!(matches!(
            SnapshotLock::acquire(dir.path(), "default_x"),
            Err(CoreError::Locked { .. })
        ));
        drop(first);
        assert!(SnapshotLock::acquire(dir.path(), "default_x").is_ok());
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store
            .find("default", "abc", &SyncParameters::new())
            .unwrap()
            .is_none());
        assert!(store.list().unwrap().is_empty());
    }
}
