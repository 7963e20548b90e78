//! Domain types shared by the engine, the daemon and the CLI.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Absolute path of the vault working copy.
///
/// Also the key of the per-vault single-flight guard, so two values naming the
/// same directory must compare equal: construct it from a canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultPath(pub PathBuf);

impl VaultPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

impl From<PathBuf> for VaultPath {
    fn from(p: PathBuf) -> Self {
        Self(p)
    }
}

impl From<&Path> for VaultPath {
    fn from(p: &Path) -> Self {
        Self(p.to_path_buf())
    }
}

/// The single remote branch a vault tracks (`origin` / `main` by default).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub remote: String,
    pub branch: String,
}

impl RemoteRef {
    pub fn new(remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    /// Remote-tracking ref name, e.g. `origin/main`.
    pub fn tracking(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }
}

impl Default for RemoteRef {
    fn default() -> Self {
        Self::new("origin", "main")
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tracking())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
