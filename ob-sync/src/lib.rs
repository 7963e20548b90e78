//! # ob-sync
//!
//! Reconciliation of one git-backed vault with its remote.
//!
//! [`Engine`] runs the cycles (`settle`, `reconcile`, `compact`) over any
//! [`VcsClient`]; [`GitCli`] is the production client that shells out to
//! `git` through [`runner::run_command`].

pub mod client;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod message;
pub mod repository;
pub mod runner;

pub use client::{GitCli, LogSpan, PushMode, VcsClient};
pub use engine::{
    CompactReport, CycleKind, CycleReport, Engine, EngineConfig, PushOutcome, VaultStatus,
};
pub use error::{CycleError, CyclePhase, SyncError};
pub use repository::{Divergence, Repository};
