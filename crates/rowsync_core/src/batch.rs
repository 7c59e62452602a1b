//! Disk-backed changesets.
//!
//! A batch is a directory holding numbered part files and a manifest:
//!
//! ```text
//! <root>/<batch id>/
//! ├── part_0000.batch
//! ├── part_0001.batch
//! └── batchinfo.cbor
//! ```
//!
//! Every file is written to a temporary name and renamed into place. The
//! manifest is written last, so a directory without one is an interrupted
//! write and is discarded on load.

use crate::error::{CoreError, CoreResult};
use crate::row::{SyncRow, SyncSet, SyncTable};
use chrono::{DateTime, Utc};
use rowsync_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Manifest file name.
pub const MANIFEST_FILE: &str = "batchinfo.cbor";

/// Metadata of one batch part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// File name inside the batch directory.
    pub file_name: String,
    /// Position of the part, from zero.
    pub index: usize,
    /// Row count per table segment, in part order.
    pub tables: Vec<(String, usize)>,
    /// Rows in the part.
    pub row_count: usize,
    /// True for the final part.
    pub is_last: bool,
}

impl BatchPartInfo {
    /// Describes a part holding `set`.
    pub fn describe(index: usize, set: &SyncSet) -> Self {
        Self {
            file_name: part_file_name(index),
            index,
            tables: set.tables.iter().map(|t| (t.name.clone(), t.len())).collect(),
            row_count: set.row_count(),
            is_last: false,
        }
    }
}

/// Manifest of a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Batch identity, also the directory name for run batches.
    pub id: Uuid,
    /// Directory holding the part files.
    #[serde(skip)]
    pub directory: PathBuf,
    /// Parts in order.
    pub parts: Vec<BatchPartInfo>,
    /// Total rows.
    pub row_count: usize,
    /// Timestamp the changes were selected at on the producing side.
    pub timestamp: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl BatchInfo {
    /// Creates an empty manifest for `directory`.
    pub fn new(directory: impl Into<PathBuf>, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            directory: directory.into(),
            parts: Vec::new(),
            row_count: 0,
            timestamp,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Path of a part file.
    pub fn part_path(&self, index: usize) -> PathBuf {
        self.directory.join(part_file_name(index))
    }

    /// Path of the manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_FILE)
    }

    /// Checks that the manifest is internally consistent.
    pub fn validate(&self) -> CoreResult<()> {
        let batch = self.id.to_string();
        for (position, part) in self.parts.iter().enumerate() {
            if part.index != position {
                return Err(CoreError::corrupt_batch(
                    &batch,
                    format!("part {} listed at position {position}", part.index),
                ));
            }
            if part.is_last != (position + 1 == self.parts.len()) {
                return Err(CoreError::corrupt_batch(&batch, format!("part {position} has a wrong last flag")));
            }
            let counted: usize = part.tables.iter().map(|(_, n)| n).sum();
            if counted != part.row_count {
                return Err(CoreError::corrupt_batch(
                    &batch,
                    format!("part {position} counts {counted} rows across tables, claims {}", part.row_count),
                ));
            }
        }
        let total: usize = self.parts.iter().map(|p| p.row_count).sum();
        if total != self.row_count {
            return Err(CoreError::corrupt_batch(
                &batch,
                format!("parts hold {total} rows, manifest claims {}", self.row_count),
            ));
        }
        Ok(())
    }

    /// Writes the manifest, making the batch visible to readers.
    pub fn save(&self) -> CoreResult<()> {
        write_atomic(&self.manifest_path(), &to_cbor(self)?)
    }

    /// Loads a manifest from `directory`.
    ///
    /// Returns `Ok(None)` and removes the directory when the manifest is
    /// missing.
    pub fn load(directory: &Path) -> CoreResult<Option<BatchInfo>> {
        let manifest = directory.join(MANIFEST_FILE);
        if !manifest.exists() {
            if directory.exists() {
                tracing::warn!(dir = %directory.display(), "discarding batch without manifest");
                fs::remove_dir_all(directory)?;
            }
            return Ok(None);
        }
        let bytes = fs::read(&manifest)?;
        let mut info: BatchInfo = from_cbor(&bytes).map_err(|e| {
            CoreError::corrupt_batch(directory.display().to_string(), format!("unreadable manifest: {e}"))
        })?;
        info.directory = directory.to_path_buf();
        info.validate()?;
        Ok(Some(info))
    }

    /// Reads and checks one part against the manifest.
    pub fn read_part(&self, index: usize) -> CoreResult<SyncSet> {
        let batch = self.id.to_string();
        let part = self
            .parts
            .get(index)
            .ok_or_else(|| CoreError::corrupt_batch(&batch, format!("no part {index}")))?;
        let path = self.directory.join(&part.file_name);
        let bytes = fs::read(&path).map_err(|e| {
            CoreError::corrupt_batch(&batch, format!("cannot read {}: {e}", path.display()))
        })?;
        let set: SyncSet = from_cbor(&bytes)
            .map_err(|e| CoreError::corrupt_batch(&batch, format!("unreadable part {index}: {e}")))?;
        let found: Vec<(String, usize)> = set.tables.iter().map(|t| (t.name.clone(), t.len())).collect();
        if found != part.tables {
            return Err(CoreError::corrupt_batch(
                &batch,
                format!("part {index} content does not match the manifest"),
            ));
        }
        Ok(set)
    }

    /// Iterates over the parts in order, reading one at a time.
    pub fn read_parts(&self) -> impl Iterator<Item = CoreResult<SyncSet>> + '_ {
        (0..self.parts.len()).map(move |i| self.read_part(i))
    }

    /// Forgets the batch, deleting its directory if `delete_files`.
    pub fn clear(self, delete_files: bool) -> CoreResult<()> {
        if delete_files && self.directory.exists() {
            fs::remove_dir_all(&self.directory)?;
            tracing::debug!(batch = %self.id, "batch deleted");
        }
        Ok(())
    }
}

/// File name of part `index`.
pub fn part_file_name(index: usize) -> String {
    format!("part_{index:04}.batch")
}

/// Writes a part file into `directory` and describes it.
pub fn write_part(directory: &Path, index: usize, set: &SyncSet) -> CoreResult<BatchPartInfo> {
    fs::create_dir_all(directory)?;
    let info = BatchPartInfo::describe(index, set);
    write_atomic(&directory.join(&info.file_name), &to_cbor(set)?)?;
    Ok(info)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Streams rows into size-bounded parts.
#[derive(Debug)]
pub struct BatchWriter {
    info: BatchInfo,
    batch_size: usize,
    current: SyncSet,
}

impl BatchWriter {
    /// Creates a writer for `directory`, which must not hold a batch yet.
    /// A `batch_size` of zero puts every row in one part.
    pub fn new(directory: impl Into<PathBuf>, batch_size: usize) -> CoreResult<Self> {
        let info = BatchInfo::new(directory, 0);
        fs::create_dir_all(&info.directory)?;
        Ok(Self {
            info,
            batch_size,
            current: SyncSet::new(),
        })
    }

    /// Directory being written.
    pub fn directory(&self) -> &Path {
        &self.info.directory
    }

    /// Rows written so far, including the unflushed part.
    pub fn row_count(&self) -> usize {
        self.info.row_count + self.current.row_count()
    }

    /// Appends a row, flushing the current part when it is full.
    pub fn push(&mut self, template: &SyncTable, row: SyncRow) -> CoreResult<()> {
        self.current.push(template, row);
        if self.batch_size > 0 && self.current.row_count() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<()> {
        if self.current.row_count() == 0 {
            return Ok(());
        }
        let set = std::mem::take(&mut self.current);
        let part = write_part(&self.info.directory, self.info.parts.len(), &set)?;
        self.info.row_count += part.row_count;
        self.info.parts.push(part);
        Ok(())
    }

    /// Flushes the last part and writes the manifest.
    pub fn finish(mut self, timestamp: u64) -> CoreResult<BatchInfo> {
        self.flush()?;
        if let Some(last) = self.info.parts.last_mut() {
            last.is_last = true;
        }
        self.info.timestamp = timestamp;
        self.info.save()?;
        tracing::debug!(
            batch = %self.info.id,
            parts = self.info.parts.len(),
            rows = self.info.row_count,
            "batch written"
        );
        Ok(self.info)
    }
}

/// Owns the run batch directory of one orchestrator.
#[derive(Debug, Clone)]
pub struct BatchManager {
    root: PathBuf,
    batch_size: usize,
}

impl BatchManager {
    /// Creates a manager writing under `root` with `batch_size` rows per part.
    pub fn new(root: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            root: root.into(),
            batch_size,
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rows per part.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Opens a writer on a fresh batch directory.
    pub fn writer(&self) -> CoreResult<BatchWriter> {
        BatchWriter::new(self.root.join(Uuid::new_v4().to_string()), self.batch_size)
    }

    /// Writes an in-memory changeset as a batch.
    pub fn create_batch(&self, set: SyncSet, timestamp: u64) -> CoreResult<BatchInfo> {
        let mut writer = self.writer()?;
        for table in set.tables {
            let template = SyncTable::new(table.name, table.columns, table.primary_key);
            for row in table.rows {
                writer.push(&template, row)?;
            }
        }
        writer.finish(timestamp)
    }

    /// Opens a directory for parts that arrive one by one, such as a
    /// download.
    pub fn receive_directory(&self) -> CoreResult<PathBuf> {
        let directory = self.root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&directory)?;
        Ok(directory)
    }

    /// Lists complete batches under the root. Incomplete ones are discarded.
    pub fn list(&self) -> CoreResult<Vec<BatchInfo>> {
        let mut batches = Vec::new();
        if !self.root.exists() {
            return Ok(batches);
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                if let Some(info) = BatchInfo::load(&path)? {
                    batches.push(info);
                }
            }
        }
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowState;
    use rowsync_codec::Value;

    fn customer() -> SyncTable {
        SyncTable::new("Customer", vec!["id".into()], vec!["id".into()])
    }

    fn rows(n: i64) -> SyncSet {
        let mut set = SyncSet::new();
        for id in 0..n {
            set.push(&customer(), SyncRow::upsert(RowState::Inserted, vec![Value::Integer(id)]));
        }
        set
    }

    #[test]
    fn splits_into_bounded_parts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BatchManager::new(dir.path(), 2);
        let info = manager.create_batch(rows(5), 7).unwrap();

        let counts: Vec<usize> = info.parts.iter().map(|p| p.row_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert!(info.parts[2].is_last);
        assert!(!info.parts[0].is_last);
        assert_eq!(info.timestamp, 7);

        let loaded = BatchInfo::load(&info.directory).unwrap().unwrap();
        assert_eq!(loaded, info);
        let read: usize = loaded.read_parts().map(|p| p.unwrap().row_count()).sum();
        assert_eq!(read, 5);
    }

    #[test]
    fn empty_changeset_has_no_parts() {
        let dir = tempfile::tempdir().unwrap();
        let info = BatchManager::new(dir.path(), 2).create_batch(SyncSet::new(), 0).unwrap();
        assert!(info.is_empty());
        assert_eq!(info.part_count(), 0);
        assert!(BatchInfo::load(&info.directory).unwrap().is_some());
    }

    #[test]
    fn missing_manifest_discards_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BatchManager::new(dir.path(), 2);
        let mut writer = manager.writer().unwrap();
        for row in rows(3).tables.remove(0).rows {
            writer.push(&customer(), row).unwrap();
        }
        let partial = writer.directory().to_path_buf();
        drop(writer);

        assert!(partial.join(part_file_name(0)).exists());
        assert!(BatchInfo::load(&partial).unwrap().is_none());
        assert!(!partial.exists());
    }

    #[test]
    fn tampered_part_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let info = BatchManager::new(dir.path(), 2).create_batch(rows(3), 0).unwrap();
        fs::write(info.part_path(1), to_cbor(&rows(2)).unwrap()).unwrap();
        assert!(matches!(info.read_part(1), Err(CoreError::CorruptBatch { .. })));

        let mut lying = info.clone();
        lying.row_count = 10;
        assert!(lying.validate().is_err());
    }

    #[test]
    fn clear_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let info = BatchManager::new(dir.path(), 0).create_batch(rows(3), 0).unwrap();
        assert_eq!(info.part_count(), 1);
        let path = info.directory.clone();
        info.clear(true).unwrap();
        assert!(!path.exists());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn parts_respect_batch_size(count in 0i64..40, size in 1usize..8) {
            let dir = tempfile::tempdir().unwrap();
            let info = BatchManager::new(dir.path(), size).create_batch(rows(count), 1).unwrap();

            let expected = (count as usize).div_ceil(size);
            proptest::prop_assert_eq!(info.part_count(), expected);
            proptest::prop_assert!(info.parts.iter().all(|p| p.row_count <= size));
            let last: Vec<bool> = info.parts.iter().map(|p| p.is_last).collect();
            proptest::prop_assert!(last.iter().rev().skip(1).all(|l| !l));
            proptest::prop_assert!(last.last().copied().unwrap_or(true));
            proptest::prop_assert_eq!(info.row_count, count as usize);
        }
    }
}
