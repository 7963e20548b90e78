//! Size-based rotation of the daemon's log files.
//!
//! `daemon.log` becomes `daemon.log.1`, older copies shift up by one and the
//! copy past `keep` is deleted. A fresh empty file takes the original name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    /// 10 MiB, five backups.
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log` when it has reached `max_bytes`. Returns whether it did;
    /// a missing file is not an error.
    pub fn rotate(&self, log: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes {
            return Ok(false);
        }

        let oldest = backup_path(log, self.keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.keep).rev() {
            let from = backup_path(log, n);
            if from.exists() {
                fs::rename(&from, backup_path(log, n + 1))?;
            }
        }
        fs::rename(log, backup_path(log, 1))?;
        fs::File::create(log)?;
        Ok(true)
    }
}

/// Rotate `daemon.log` and `daemon-err.log` under `home`. Failures are logged
/// per file and never stop the daemon.
pub fn rotate_logs(home: &Path, policy: RotationPolicy) {
    let logs = [
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
    ];
    for log in &logs {
        match policy.rotate(log) {
            Ok(true) => tracing::info!(path = %log.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
        }
    }
}

/// `daemon.log` → `daemon.log.<n>`.
pub fn backup_path(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}
