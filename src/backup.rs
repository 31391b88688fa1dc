//! Point-in-time copies of the database.
//!
//! Copies are taken through SQLite's online backup API from the live
//! connection, so they are consistent even while the app keeps running.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use rusqlite::{Connection, DatabaseName};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::PosResult;

const BACKUP_LOG_FILE: &str = "backup_logs.txt";

/// Result of the best-effort backup that follows a till close.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BackupStatus {
    Saved { path: PathBuf },
    Failed { error: String },
    Skipped,
}

fn unique_backup_path(dir: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let first = dir.join(format!("barcancha_{stamp}.db"));
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|n| dir.join(format!("barcancha_{stamp}_{n}.db")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Copy the database into `backup_dir` as `barcancha_{YYYYmmdd_HHMMSS}.db`
/// and append the outcome to `backup_logs.txt` in the same directory.
pub fn backup_database(db: &DbState, backup_dir: &Path) -> PosResult<PathBuf> {
    std::fs::create_dir_all(backup_dir)?;
    let dest = unique_backup_path(backup_dir);

    let result = {
        let conn = db.conn.lock()?;
        copy_to(&conn, &dest)
    };

    match &result {
        Ok(()) => {
            info!(path = %dest.display(), "Database backup created");
            append_log(backup_dir, &format!("backup created: {}", dest.display()));
        }
        Err(e) => {
            warn!(path = %dest.display(), "Database backup failed: {e}");
            append_log(backup_dir, &format!("backup failed: {e}"));
            let _ = std::fs::remove_file(&dest);
        }
    }
    result.map(|_| dest)
}

fn copy_to(conn: &Connection, dest: &Path) -> PosResult<()> {
    conn.backup(DatabaseName::Main, dest, None)?;
    // Leave a single self-contained file behind.
    let copy = Connection::open(dest)?;
    copy.execute_batch("PRAGMA journal_mode=DELETE;")?;
    Ok(())
}

fn append_log(backup_dir: &Path, line: &str) {
    let path = backup_dir.join(BACKUP_LOG_FILE);
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{} - {line}", Local::now().format("%Y-%m-%dT%H:%M:%S")));
    if let Err(e) = written {
        warn!(path = %path.display(), "Could not write backup log: {e}");
    }
}

/// Backups in `backup_dir`, newest first.
pub fn list_backups(backup_dir: &Path) -> PosResult<Vec<PathBuf>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(backup_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("barcancha_") && n.ends_with(".db"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files.reverse();
    Ok(files)
}
