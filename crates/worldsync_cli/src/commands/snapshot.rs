//! Snapshot command implementation.

use serde::Serialize;
use std::path::Path;
use tracing::info;
use worldsync_core::{Snapshot, SnapshotBuilder};

/// Snapshot summary.
#[derive(Debug, Serialize)]
pub struct SnapshotReport {
    /// Scanned directory.
    pub path: String,
    /// Snapshot id (hex).
    pub id: String,
    /// Number of files.
    pub files: usize,
    /// Distinct blobs.
    pub blobs: usize,
    /// Total size in bytes.
    pub total_bytes: u64,
    /// One entry per file, in path order.
    pub entries: Vec<EntryReport>,
}

/// One file of a snapshot.
#[derive(Debug, Serialize)]
pub struct EntryReport {
    /// Relative path with `/` separators.
    pub path: String,
    /// Content hash (hex).
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
}

impl SnapshotReport {
    fn new(path: &Path, snapshot: &Snapshot) -> Self {
        Self {
            path: path.display().to_string(),
            id: snapshot.id().to_hex(),
            files: snapshot.manifest().len(),
            blobs: snapshot.blobs().len(),
            total_bytes: snapshot.total_bytes(),
            entries: snapshot
                .manifest()
                .iter()
                .map(|(path, entry)| EntryReport {
                    path: path.to_string(),
                    hash: entry.hash.to_hex(),
                    size: entry.size,
                })
                .collect(),
        }
    }
}

/// Runs the snapshot command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!(path = %path.display(), "building snapshot");
    let snapshot = SnapshotBuilder::new().build(path)?;
    let report = SnapshotReport::new(path, &snapshot);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &SnapshotReport) {
    println!("Snapshot of {}", report.path);
    println!("  Id:     {}", report.id);
    println!("  Files:  {} ({} distinct blobs)", report.files, report.blobs);
    println!("  Size:   {}", format_bytes(report.total_bytes));
    println!();
    for entry in &report.entries {
        println!("  {}  {:>10}  {}", &entry.hash[..12], entry.size, entry.path);
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
