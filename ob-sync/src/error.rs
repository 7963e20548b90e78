//! Error types for ob-sync.

use std::fmt;

use thiserror::Error;

/// All errors that can arise from a version-control operation or from
/// interpreting its output.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The external command ran and exited nonzero. `stderr` is verbatim.
    #[error("`{program} {}` failed: {}", .args.join(" "), .stderr.trim())]
    Command {
        program: String,
        args: Vec<String>,
        stderr: String,
    },

    /// The external command could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command succeeded but its output was not what we expected.
    #[error("could not parse {what} from output {output:?}")]
    Parse { what: &'static str, output: String },

    /// On-demand compaction asked for more history than exists.
    #[error("cannot squash {requested} commits; repository only has {available} commits")]
    InvalidSquash { requested: u64, available: u64 },
}

/// Step of a reconciliation cycle, recorded when a cycle aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Merging,
    Committing,
    SquashEvaluating,
    Pushing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Fetching => "fetching",
            CyclePhase::Merging => "merging",
            CyclePhase::Committing => "committing",
            CyclePhase::SquashEvaluating => "squash evaluation",
            CyclePhase::Pushing => "pushing",
        };
        f.write_str(name)
    }
}

/// A cycle that ended early. The remaining steps were not run.
#[derive(Debug, Error)]
#[error("cycle aborted while {phase}: {source}")]
pub struct CycleError {
    pub phase: CyclePhase,
    #[source]
    pub source: SyncError,
}

impl CycleError {
    pub fn new(phase: CyclePhase, source: SyncError) -> Self {
        Self { phase, source }
    }
}
