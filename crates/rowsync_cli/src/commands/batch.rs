//! Batch commands.
//!
//! A path is either one batch directory (it holds a manifest) or a root
//! holding batch directories. Directories without a manifest are reported as
//! incomplete and left in place.

use rowsync_core::{BatchInfo, RowState, MANIFEST_FILE};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Summary of one batch.
#[derive(Debug, Serialize)]
pub struct BatchSummary {
    /// Batch id.
    pub id: String,
    /// Batch directory.
    pub directory: String,
    /// Creation time, RFC 3339.
    pub created_at: String,
    /// Store timestamp the batch was selected at.
    pub timestamp: u64,
    /// Total rows.
    pub row_count: usize,
    /// Parts in order.
    pub parts: Vec<PartSummary>,
}

/// Summary of one part.
#[derive(Debug, Serialize)]
pub struct PartSummary {
    /// Part index.
    pub index: usize,
    /// File name within the batch directory.
    pub file_name: String,
    /// Rows in the part.
    pub row_count: usize,
    /// Whether this is the final part.
    pub is_last: bool,
    /// Rows per table.
    pub tables: Vec<TableCount>,
}

/// Row count of one table in a part.
#[derive(Debug, Serialize)]
pub struct TableCount {
    /// Table name.
    pub name: String,
    /// Rows.
    pub rows: usize,
}

/// Batch inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Inspected path.
    pub path: String,
    /// Batches with a readable manifest.
    pub batches: Vec<BatchSummary>,
    /// Directories without a manifest.
    pub incomplete: Vec<String>,
    /// Manifests that failed to load.
    pub errors: Vec<String>,
}

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Batches checked.
    pub batches_checked: usize,
    /// Parts read.
    pub parts_checked: usize,
    /// Rows read.
    pub rows_checked: usize,
    /// Upserted rows among them.
    pub upserts: usize,
    /// Deleted rows among them.
    pub deletes: usize,
    /// Parts that could not be read or did not match their manifest.
    pub corrupt_parts: usize,
    /// Directories without a manifest.
    pub incomplete: Vec<String>,
    /// Errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Whether every batch read back cleanly.
    pub fn is_ok(&self) -> bool {
        self.corrupt_parts == 0 && self.errors.is_empty()
    }
}

impl From<&BatchInfo> for BatchSummary {
    fn from(info: &BatchInfo) -> Self {
        Self {
            id: info.id.to_string(),
            directory: info.directory.display().to_string(),
            created_at: info.created_at.to_rfc3339(),
            timestamp: info.timestamp,
            row_count: info.row_count,
            parts: info
                .parts
                .iter()
                .map(|p| PartSummary {
                    index: p.index,
                    file_name: p.file_name.clone(),
                    row_count: p.row_count,
                    is_last: p.is_last,
                    tables: p
                        .tables
                        .iter()
                        .map(|(name, rows)| TableCount {
                            name: name.clone(),
                            rows: *rows,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// What a scan found in one directory.
enum Found {
    Batch(BatchInfo),
    Incomplete(PathBuf),
    Unreadable(PathBuf, String),
}

/// Finds the batches at `path` without modifying anything.
fn scan(path: &Path) -> Result<Vec<Found>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No directory found at {:?}", path).into());
    }
    if path.join(MANIFEST_FILE).exists() {
        return Ok(vec![load(path)]);
    }

    let mut directories = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry.file_type()?.is_dir() && !hidden {
            directories.push(entry.path());
        }
    }
    directories.sort();
    tracing::debug!(path = %path.display(), directories = directories.len(), "scanning batch root");

    Ok(directories
        .into_iter()
        .map(|dir| {
            if dir.join(MANIFEST_FILE).exists() {
                load(&dir)
            } else {
                Found::Incomplete(dir)
            }
        })
        .collect())
}

// Only called on directories holding a manifest, which `BatchInfo::load`
// never deletes.
fn load(directory: &Path) -> Found {
    match BatchInfo::load(directory) {
        Ok(Some(info)) => Found::Batch(info),
        Ok(None) => Found::Incomplete(directory.to_path_buf()),
        Err(e) => Found::Unreadable(directory.to_path_buf(), e.to_string()),
    }
}

/// Collects the batches at `path`.
pub fn collect_inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut result = InspectResult {
        path: path.display().to_string(),
        batches: Vec::new(),
        incomplete: Vec::new(),
        errors: Vec::new(),
    };
    for found in scan(path)? {
        match found {
            Found::Batch(info) => result.batches.push(BatchSummary::from(&info)),
            Found::Incomplete(dir) => result.incomplete.push(dir.display().to_string()),
            Found::Unreadable(dir, e) => result.errors.push(format!("{}: {e}", dir.display())),
        }
    }
    result.batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(result)
}

/// Runs `batch inspect`.
pub fn inspect(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect_inspect(path)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_inspect(&result);
        }
    }
    Ok(())
}

fn print_inspect(result: &InspectResult) {
    println!("Batches at {}", result.path);
    println!();
    if result.batches.is_empty() {
        println!("No complete batches");
    }
    for batch in &result.batches {
        println!("Batch {}", batch.id);
        println!("  Directory:  {}", batch.directory);
        println!("  Created:    {}", batch.created_at);
        println!("  Timestamp:  {}", batch.timestamp);
        println!("  Rows:       {}", batch.row_count);
        println!("  Parts:      {}", batch.parts.len());
        for part in &batch.parts {
            let tables: Vec<String> = part.tables.iter().map(|t| format!("{}={}", t.name, t.rows)).collect();
            println!(
                "    [{}] {} {} rows{} ({})",
                part.index,
                part.file_name,
                part.row_count,
                if part.is_last { ", last" } else { "" },
                tables.join(", ")
            );
        }
        println!();
    }
    for dir in &result.incomplete {
        println!("Incomplete (no manifest): {dir}");
    }
    for error in &result.errors {
        println!("Unreadable: {error}");
    }
}

/// Reads every part of every batch at `path`.
pub fn collect_verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    for found in scan(path)? {
        match found {
            Found::Batch(info) => {
                result.batches_checked += 1;
                verify_batch(&info, &mut result);
            }
            Found::Incomplete(dir) => result.incomplete.push(dir.display().to_string()),
            Found::Unreadable(dir, e) => result.errors.push(format!("{}: {e}", dir.display())),
        }
    }
    Ok(result)
}

fn verify_batch(info: &BatchInfo, result: &mut VerifyResult) {
    let mut rows = 0;
    for (index, part) in info.read_parts().enumerate() {
        result.parts_checked += 1;
        match part {
            Ok(set) => {
                for row in set.tables.iter().flat_map(|t| &t.rows) {
                    match row.state {
                        RowState::Deleted => result.deletes += 1,
                        RowState::Inserted | RowState::Modified => result.upserts += 1,
                    }
                }
                let count = set.row_count();
                if count != info.parts[index].row_count {
                    result.corrupt_parts += 1;
                    result.errors.push(format!(
                        "batch {} part {index}: {count} rows, manifest says {}",
                        info.id, info.parts[index].row_count
                    ));
                }
                rows += count;
            }
            Err(e) => {
                result.corrupt_parts += 1;
                result.errors.push(e.to_string());
            }
        }
    }
    result.rows_checked += rows;
    tracing::debug!(batch = %info.id, rows, "batch verified");
}

/// Runs `batch verify`.
pub fn verify(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect_verify(path)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Verifying batches at {:?}", path);
            println!();
            println!("  Batches checked: {}", result.batches_checked);
            println!("  Parts checked:   {}", result.parts_checked);
            println!("  Rows checked:    {} ({} upserts, {} deletes)", result.rows_checked, result.upserts, result.deletes);
            println!("  Corrupt parts:   {}", result.corrupt_parts);
            for dir in &result.incomplete {
                println!("  Incomplete (no manifest): {dir}");
            }
            if !result.errors.is_empty() {
                println!("  Errors:");
                for error in &result.errors {
                    println!("    - {}", error);
                }
            }
            println!();
            if result.is_ok() {
                println!("✓ Batch verification passed");
            } else {
                println!("✗ Batch verification failed");
            }
        }
    }
    if result.is_ok() {
        Ok(())
    } else {
        Err("Verification failed".into())
    }
}
