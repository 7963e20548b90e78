//! `ob.pid`: written when the daemon starts, removed when it exits.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{io_err, DaemonError};

/// Holds the PID file for as long as the daemon runs; removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    ///
    /// A file naming a live process is an error; one left behind by a dead
    /// process is replaced.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        if let Some(pid) = read_pid(path)? {
            if pid != std::process::id() && process_alive(pid) {
                return Err(DaemonError::AlreadyRunning { pid });
            }
            tracing::warn!(pid, path = %path.display(), "replacing stale pid file");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(|e| io_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove pid file");
            }
        }
    }
}

/// Pid recorded in `path`, if the file exists and holds a number.
pub fn read_pid(path: &Path) -> Result<Option<u32>, DaemonError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Remove a PID file whose process is gone. Returns whether one was removed.
pub fn remove_stale(path: &Path) -> Result<bool, DaemonError> {
    match read_pid(path)? {
        Some(pid) if process_alive(pid) => Ok(false),
        Some(_) => {
            fs::remove_file(path).map_err(|e| io_err(path, e))?;
            Ok(true)
        }
        None if path.exists() => {
            fs::remove_file(path).map_err(|e| io_err(path, e))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
