//! Snapshot commands.

use rowsync_core::SnapshotStore;
use serde::Serialize;
use std::path::Path;

/// One snapshot on disk.
#[derive(Debug, Serialize)]
pub struct SnapshotSummary {
    /// Directory name: scope, setup fingerprint prefix and parameter hash.
    pub name: String,
    /// Store timestamp clients bootstrapped on it resume from.
    pub timestamp: u64,
    /// Total rows.
    pub row_count: usize,
    /// Number of parts.
    pub parts: usize,
    /// Creation time, RFC 3339.
    pub created_at: String,
}

/// Lists the snapshots under `path`.
pub fn collect(path: &Path) -> Result<Vec<SnapshotSummary>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No snapshot directory found at {:?}", path).into());
    }
    let entries = SnapshotStore::new(path).list()?;
    Ok(entries
        .into_iter()
        .map(|entry| SnapshotSummary {
            name: entry.name,
            timestamp: entry.batch.timestamp,
            row_count: entry.batch.row_count,
            parts: entry.batch.part_count(),
            created_at: entry.batch.created_at.to_rfc3339(),
        })
        .collect())
}

/// Runs `snapshot list`.
pub fn list(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snapshots = collect(path)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
        _ => {
            if snapshots.is_empty() {
                println!("No snapshots at {}", path.display());
                return Ok(());
            }
            println!("{:<40} {:>12} {:>10} {:>6}  CREATED", "NAME", "TIMESTAMP", "ROWS", "PARTS");
            for s in &snapshots {
                println!(
                    "{:<40} {:>12} {:>10} {:>6}  {}",
                    s.name, s.timestamp, s.row_count, s.parts, s.created_at
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_codec::Value;
    use rowsync_core::{BatchManager, RowState, SyncRow, SyncSet, SyncTable};
    use std::fs;
    use tempfile::TempDir;

    fn snapshot(root: &Path, name: &str, rows: i64) {
        let region = SyncTable::new("Region", vec!["id".into()], vec!["id".into()]);
        let mut set = SyncSet::new();
        for id in 0..rows {
            set.push(&region, SyncRow::upsert(RowState::Inserted, vec![Value::Integer(id)]));
        }
        let staging = root.join(".staging");
        let batch = BatchManager::new(&staging, 2).create_batch(set, 12).unwrap();
        fs::rename(&batch.directory, root.join(name)).unwrap();
        fs::remove_dir_all(staging).unwrap();
    }

    #[test]
    fn lists_snapshots_by_name() {
        let dir = TempDir::new().unwrap();
        snapshot(dir.path(), "sales_0123456789abcdef", 3);
        snapshot(dir.path(), "default_0123456789abcdef", 1);
        fs::write(dir.path().join(".default_0123456789abcdef.lock"), b"").unwrap();

        let snapshots = collect(dir.path()).unwrap();
        let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["default_0123456789abcdef", "sales_0123456789abcdef"]);
        assert_eq!(snapshots[1].row_count, 3);
        assert_eq!(snapshots[1].parts, 2);
        assert_eq!(snapshots[1].timestamp, 12);
    }

    #[test]
    fn empty_and_missing_roots() {
        let dir = TempDir::new().unwrap();
        assert!(collect(dir.path()).unwrap().is_empty());
        assert!(collect(&dir.path().join("nowhere")).is_err());
    }
}
