use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::LoggingConfig;
use crate::fs::log_dir;
use crate::targets::SUBSYSTEMS;

const MAX_LOG_BYTES: u64 = 200 * 1024 * 1024;

struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Deletes rolled log files older than `keep_days`, then the oldest files until
/// the directory is under the size cap.
pub fn run_retention(root: &Path, cfg: &LoggingConfig) -> Result<()> {
    prune(&log_dir(root), cfg.keep_days, MAX_LOG_BYTES)
}

fn prune(log_root: &Path, keep_days: u64, max_bytes: u64) -> Result<()> {
    let mut entries = collect_log_files(log_root)?;

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(keep_days.saturating_mul(24 * 60 * 60)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    entries.retain(|entry| {
        if entry.modified < cutoff {
            if let Err(err) = fs::remove_file(&entry.path) {
                tracing::warn!("Failed to remove old log {}: {}", entry.path.display(), err);
                true
            } else {
                false
            }
        } else {
            true
        }
    });

    let mut total_size: u64 = entries.iter().map(|e| e.size).sum();
    if total_size > max_bytes {
        entries.sort_by_key(|e| e.modified);
        for entry in entries {
            if total_size <= max_bytes {
                break;
            }
            if let Err(err) = fs::remove_file(&entry.path) {
                tracing::warn!(
                    "Failed to remove log {} during size cap cleanup: {}",
                    entry.path.display(),
                    err
                );
                continue;
            }
            total_size = total_size.saturating_sub(entry.size);
        }
    }

    Ok(())
}

fn collect_log_files(log_root: &Path) -> Result<Vec<LogFile>> {
    let mut files = Vec::new();
    if !log_root.exists() {
        return Ok(files);
    }

    let entries =
        fs::read_dir(log_root).with_context(|| format!("reading {}", log_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterating {}", log_root.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };

        if !is_log_name(name) {
            continue;
        }

        let metadata = fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push(LogFile {
            path,
            modified,
            size: metadata.len(),
        });
    }

    Ok(files)
}

fn is_log_name(name: &str) -> bool {
    name.starts_with("rfdeckd.log")
        || name.starts_with("rfdeckctl.log")
        || SUBSYSTEMS
            .iter()
            .any(|(_, file)| name.starts_with(file))
}
