//! Logging setup for the POS core.
//!
//! Console output plus a daily rolling file in the configured log directory.
//! Old `pos.*` files beyond the retention count are pruned before the
//! appender starts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{PosConfig, DEFAULT_LOG_FILTER};

/// Install the global tracing subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// as long as the process runs.
pub fn init_logging(config: &PosConfig) -> Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_new(&config.log_filter)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .map_err(|e| format!("log filter: {e}"))?;

    prune_old_logs(&config.log_dir, config.max_log_files);
    fs::create_dir_all(&config.log_dir).map_err(|e| format!("create log dir: {e}"))?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("install subscriber: {e}"))?;

    Ok(guard)
}

/// Prune old log files, keeping only the most recent `keep`.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with("pos."))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
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
    fn test_prune_keeps_newest_pos_logs() {
        let dir = std::env::temp_dir().join(format!("table_pos_logs_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        for day in 1..=4 {
            fs::write(dir.join(format!("pos.2026-01-0{day}")), "x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        fs::write(dir.join("unrelated.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(&dir, 2), 2);
        assert!(dir.join("pos.2026-01-04").exists());
        assert!(dir.join("pos.2026-01-03").exists());
        assert!(!dir.join("pos.2026-01-01").exists());
        assert!(dir.join("unrelated.txt").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_init_logging_writes_rolling_file() {
        let dir = std::env::temp_dir().join(format!("table_pos_init_logging_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let config = PosConfig {
            log_dir: dir.clone(),
            ..PosConfig::default()
        };

        let guard = init_logging(&config).expect("install subscriber");
        tracing::info!(component = "diagnostics", "logging ready");
        drop(guard);

        assert!(dir.is_dir());
        let has_log = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("pos."));
        assert!(has_log);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = std::env::temp_dir().join("table_pos_logs_missing_dir");
        assert_eq!(prune_old_logs(&dir, 1), 0);
    }
}
