//! Persisted daemon configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.config/ob/
//!   config.yaml   (mode 0600, written by `ob start <vault>`)
//! ```
//!
//! # API pattern
//!
//! Every function touching the filesystem has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! The loaded value is immutable for the lifetime of a daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{RemoteRef, VaultPath};

/// Environment variable that overrides the stored vault path.
pub const VAULT_PATH_ENV: &str = "VAULT_PATH";

pub const DEFAULT_SETTLE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 12 * 60 * 60;
pub const DEFAULT_SQUASH_THRESHOLD: u64 = 25;

// ---------------------------------------------------------------------------
// 1. Types
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub vault_path: PathBuf,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Timer periods and the scheduled squash threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Period of the commit-only "local settle" trigger.
    #[serde(default = "default_settle_interval")]
    pub settle_interval_secs: u64,
    /// Period of the full fetch/merge/commit/squash/push trigger.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Local commits that must accumulate before a scheduled cycle pushes.
    #[serde(default = "default_squash_threshold")]
    pub squash_threshold: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            settle_interval_secs: DEFAULT_SETTLE_INTERVAL_SECS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            squash_threshold: DEFAULT_SQUASH_THRESHOLD,
        }
    }
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_settle_interval() -> u64 {
    DEFAULT_SETTLE_INTERVAL_SECS
}

fn default_reconcile_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

fn default_squash_threshold() -> u64 {
    DEFAULT_SQUASH_THRESHOLD
}

impl Config {
    /// A config for `vault_path` with every other field at its default.
    pub fn new(vault_path: impl Into<PathBuf>) -> Self {
        Self {
            vault_path: vault_path.into(),
            remote: default_remote(),
            branch: default_branch(),
            sync: SyncSettings::default(),
        }
    }

    pub fn vault(&self) -> VaultPath {
        VaultPath(self.vault_path.clone())
    }

    pub fn remote_ref(&self) -> RemoteRef {
        RemoteRef::new(self.remote.clone(), self.branch.clone())
    }

    /// Apply `VAULT_PATH` from the process environment, if set and non-empty.
    pub fn with_env_overrides(self) -> Self {
        self.with_vault_override(std::env::var_os(VAULT_PATH_ENV).map(PathBuf::from))
    }

    fn with_vault_override(mut self, vault: Option<PathBuf>) -> Self {
        if let Some(path) = vault.filter(|p| !p.as_os_str().is_empty()) {
            self.vault_path = path;
        }
        self
    }

    /// Check the vault is a readable git working copy and canonicalize its path.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let path = self.vault_path.clone();
        let canonical = path
            .canonicalize()
            .map_err(|_| ConfigError::VaultMissing { path: path.clone() })?;
        if !canonical.is_dir() {
            return Err(ConfigError::VaultMissing { path });
        }
        if !canonical.join(".git").exists() {
            return Err(ConfigError::NotARepository { path: canonical });
        }
        self.vault_path = canonical;
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.config/ob/`. Pure, no I/O.
pub fn config_dir_at(home: &Path) -> PathBuf {
    home.join(".config").join("ob")
}

/// `<home>/.config/ob/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    config_dir_at(home).join("config.yaml")
}

/// Create `<home>/.config/ob/` (mode `0700`) if it does not yet exist.
pub fn ensure_config_dir_at(home: &Path) -> Result<PathBuf, ConfigError> {
    let dir = config_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load `config.yaml` from under `home`.
///
/// Returns `ConfigError::NotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save `config` to `<home>/.config/ob/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<PathBuf, ConfigError> {
    ensure_config_dir_at(home)?;
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &Config) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 5. Helpers
// ---------------------------------------------------------------------------

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_daemon_schedule() {
        let cfg = Config::new("/vault");
        assert_eq!(cfg.remote_ref().tracking(), "origin/main");
        assert_eq!(cfg.sync.settle_interval_secs, 60);
        assert_eq!(cfg.sync.reconcile_interval_secs, 43_200);
        assert_eq!(cfg.sync.squash_threshold, 25);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("vault_path: /notes\n").expect("parse");
        assert_eq!(cfg, Config::new("/notes"));
    }

    #[test]
    fn vault_override_replaces_path_only_when_non_empty() {
        let cfg = Config::new("/stored");
        let kept = cfg.clone().with_vault_override(Some(PathBuf::new()));
        assert_eq!(kept.vault_path, PathBuf::from("/stored"));
        let replaced = cfg.with_vault_override(Some(PathBuf::from("/from-env")));
        assert_eq!(replaced.vault_path, PathBuf::from("/from-env"));
    }

    #[test]
    fn validate_rejects_directory_without_git() {
        let dir = TempDir::new().unwrap();
        let err = Config::new(dir.path()).validate().unwrap_err();
        assert!(matches!(err, ConfigError::NotARepository { .. }), "got: {err}");
    }

    #[test]
    fn validate_canonicalizes_repository_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let nested = dir.path().join(".").join(".git").join("..");
        let cfg = Config::new(nested).validate().expect("valid");
        assert_eq!(cfg.vault_path, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(ConfigError::HomeNotFound.to_string().contains("home directory"));
    }
}
