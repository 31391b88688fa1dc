//! Structured logging: console plus a daily rolling file under `logs/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of rotated log files to keep.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos";

/// Install the global subscriber. Console output goes to stderr so stdout
/// stays clean for command results.
pub fn init(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,buffet_pos_lib=debug"));

    prune_old_logs(log_dir);
    fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        // Dropping the guard flushes and stops the writer thread; the process
        // owns it until exit.
        std::mem::forget(guard);
    }
}

/// Remove rotated log files beyond [`MAX_LOG_FILES`], newest kept. Returns
/// how many were deleted.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with("pos."))
                .unwrap_or(false)
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first; dated names break ties.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=12 {
            fs::write(dir.path().join(format!("pos.2025-03-{day:02}")), "x").unwrap();
        }
        fs::write(dir.path().join("backup_logs.txt"), "keep").unwrap();

        assert_eq!(prune_old_logs(dir.path()), 2);

        assert!(!dir.path().join("pos.2025-03-01").exists());
        assert!(!dir.path().join("pos.2025-03-02").exists());
        assert!(dir.path().join("pos.2025-03-12").exists());
        assert!(dir.path().join("backup_logs.txt").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 11);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_old_logs(&dir.path().join("logs")), 0);
    }
}
