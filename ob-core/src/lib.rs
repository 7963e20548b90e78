//! ob core library: domain types and persisted configuration.
//!
//! Public API surface:
//! - [`types`]: vault / remote newtypes
//! - [`error`]: [`ConfigError`]
//! - [`config`]: load / save / validate

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, SyncSettings};
pub use error::ConfigError;
pub use types::{RemoteRef, VaultPath};
