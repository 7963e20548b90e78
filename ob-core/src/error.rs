//! Error types for ob-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading, saving or validating configuration.
///
/// These are fatal at daemon startup and never raised mid-cycle.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.config/ob/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// No config file yet; `ob start <vault>` writes one.
    #[error("config not found at {path}; run `ob start <vault-path>` first")]
    NotFound { path: PathBuf },

    /// The configured vault directory is missing or unreadable.
    #[error("vault path {path} is not a readable directory")]
    VaultMissing { path: PathBuf },

    /// The vault directory exists but has no `.git` metadata.
    #[error("vault path {path} is not a git working copy")]
    NotARepository { path: PathBuf },
}
