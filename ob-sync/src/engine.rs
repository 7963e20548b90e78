//! Reconciliation engine.
//!
//! ## Full cycle (`reconcile`)
//!
//! 1. Fetch the tracked branch.
//! 2. Merge, only when the remote has commits `HEAD` lacks. **Remote wins**:
//!    uncommitted local edits to paths the remote also changed are thrown
//!    away before `merge -X theirs`, and conflicting hunks take the remote
//!    side. Conflicts `-X theirs` cannot settle (modify/delete) are resolved
//!    to the remote tree and the merge is committed; if that fails the merge
//!    is aborted so no later commit can conclude it. Nothing of the discarded
//!    edits is kept anywhere.
//! 3. Commit pending changes as `Auto commit by ob`.
//! 4. Count commits ahead. Below the threshold the cycle stops without
//!    pushing. Otherwise soft-reset to the remote tip and commit one squash
//!    marker whose count sums the markers it replaces.
//! 5. Push, never forced: the rewritten commits were never shared.
//!
//! `compact` rewrites already-pushed history and is the only path that pushes
//! with `--force`.
//!
//! Any failure ends the cycle where it happened. Nothing is rolled back; the
//! next trigger starts again from step 1.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use ob_core::{Config, RemoteRef, VaultPath};

use crate::client::{PushMode, VcsClient};
use crate::error::{CycleError, CyclePhase, SyncError};
use crate::message::{auto_commit_message, represented_commits, squash_message};
use crate::repository::Repository;

// ---------------------------------------------------------------------------
// Configuration and reports
// ---------------------------------------------------------------------------

/// Everything the engine needs to know, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub vault: VaultPath,
    pub remote: RemoteRef,
    /// Threshold used by scheduled full cycles.
    pub squash_threshold: u64,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            vault: config.vault(),
            remote: config.remote_ref(),
            squash_threshold: config.sync.squash_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// Commit-only.
    Settle,
    /// Fetch, merge, commit, squash evaluation, push.
    Reconcile,
}

/// What step 4/5 decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PushOutcome {
    /// The cycle kind does not evaluate pushing.
    NotEvaluated,
    /// Nothing local to share.
    UpToDate,
    /// Fewer local commits than the threshold; kept for a later cycle.
    Deferred { ahead: u64, threshold: u64 },
    /// Local commits cancel out against the remote tip; `HEAD` now equals it.
    Empty,
    /// One squash marker standing for `represented` commits was pushed.
    Pushed { represented: u64, forced: bool },
}

/// Result of one successful cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Remote commits integrated by the merge step.
    pub merged: u64,
    /// Local paths whose edits lost to the remote, uncommitted or conflicted.
    pub discarded: Vec<String>,
    pub committed: bool,
    pub push: PushOutcome,
}

impl CycleReport {
    fn new(kind: CycleKind) -> Self {
        Self {
            kind,
            merged: 0,
            discarded: Vec::new(),
            committed: false,
            push: PushOutcome::NotEvaluated,
        }
    }
}

/// Result of on-demand compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    /// The threshold-0 cycle that shared pending work first.
    pub flush: CycleReport,
    /// Commits replaced by the new marker.
    pub replaced: u64,
    /// Original commits the new marker stands for.
    pub represented: u64,
}

/// Read-only projection for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStatus {
    pub vault: VaultPath,
    pub remote: String,
    pub dirty: bool,
    pub ahead: u64,
    pub last_local_commit: DateTime<Utc>,
    pub last_remote_commit: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<C> {
    client: C,
    config: EngineConfig,
}

impl<C: VcsClient> Engine<C> {
    pub fn new(client: C, config: EngineConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn repo(&self) -> Repository<'_, C> {
        Repository::new(&self.client, &self.config.remote)
    }

    /// Commit-only cycle for the short-period trigger.
    pub fn settle(&self) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::new(CycleKind::Settle);
        report.committed = self
            .commit_pending()
            .map_err(at(CyclePhase::Committing))?;
        Ok(report)
    }

    /// Full cycle. `threshold` is the configured value for scheduled cycles
    /// and 0 for manual ones.
    pub fn reconcile(&self, threshold: u64) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::new(CycleKind::Reconcile);
        let remote = &self.config.remote;

        self.client
            .fetch(&remote.remote, &remote.branch)
            .map_err(at(CyclePhase::Fetching))?;

        let behind = self
            .repo()
            .commits_behind()
            .map_err(at(CyclePhase::Merging))?;
        if behind > 0 {
            report.discarded = self
                .merge_remote_wins()
                .map_err(at(CyclePhase::Merging))?;
            report.merged = behind;
            tracing::info!("merged {} remote commit(s) from {}", behind, remote);
        }

        report.committed = self
            .commit_pending()
            .map_err(at(CyclePhase::Committing))?;

        report.push = self.squash_and_push(threshold)?;
        Ok(report)
    }

    /// Replace the last `commits` commits of already-pushed history with one
    /// squash marker and force-push it.
    ///
    /// Pending work is shared first by a threshold-0 cycle, so the rewritten
    /// range always sits on top of everything the remote has.
    pub fn compact(&self, commits: u64) -> Result<CompactReport, CycleError> {
        if commits == 0 {
            return Err(CycleError::new(
                CyclePhase::SquashEvaluating,
                SyncError::InvalidSquash {
                    requested: 0,
                    available: 0,
                },
            ));
        }

        let flush = self.reconcile(0)?;

        // One extra entry proves `HEAD~commits` exists.
        let mut lines = self
            .repo()
            .recent_log(commits + 1)
            .map_err(at(CyclePhase::SquashEvaluating))?;
        let available = lines.len() as u64;
        if available <= commits {
            return Err(CycleError::new(
                CyclePhase::SquashEvaluating,
                SyncError::InvalidSquash {
                    requested: commits,
                    available,
                },
            ));
        }
        lines.truncate(commits as usize);
        let represented = represented_commits(&lines);

        self.client
            .reset_soft(&format!("HEAD~{commits}"))
            .map_err(at(CyclePhase::SquashEvaluating))?;
        self.client
            .commit(&squash_message(represented))
            .map_err(at(CyclePhase::SquashEvaluating))?;

        let remote = &self.config.remote;
        self.client
            .push(&remote.remote, &remote.branch, PushMode::Force)
            .map_err(at(CyclePhase::Pushing))?;

        tracing::info!(
            "squashed {} commit(s) representing {} total commit(s) into one",
            commits,
            represented
        );
        Ok(CompactReport {
            flush,
            replaced: commits,
            represented,
        })
    }

    /// Dirty flag, commits ahead and tip timestamps, without fetching.
    pub fn status(&self) -> Result<VaultStatus, SyncError> {
        let repo = self.repo();
        let tracking = self.config.remote.tracking();
        Ok(VaultStatus {
            vault: self.config.vault.clone(),
            remote: tracking.clone(),
            dirty: repo.has_local_changes()?,
            ahead: repo.commits_ahead()?,
            last_local_commit: repo.last_commit_time("HEAD")?,
            last_remote_commit: repo.last_commit_time(&tracking)?,
        })
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Returns the discarded paths.
    fn merge_remote_wins(&self) -> Result<Vec<String>, SyncError> {
        let repo = self.repo();
        let tracking = self.config.remote.tracking();
        let incoming: HashSet<String> = repo.incoming_paths()?.into_iter().collect();

        let mut discarded: Vec<String> = repo
            .changed_paths()?
            .into_iter()
            .filter(|path| incoming.contains(path))
            .collect();
        discarded.sort();
        discarded.dedup();

        if !discarded.is_empty() {
            tracing::warn!(
                "remote wins: discarding uncommitted local changes to {}",
                discarded.join(", ")
            );
            self.client.restore(&discarded)?;
        }

        if let Err(err) = self.client.merge_theirs(&tracking) {
            discarded.extend(self.resolve_toward_remote(&tracking, err)?);
            discarded.sort();
            discarded.dedup();
        }
        Ok(discarded)
    }

    /// Finish a merge that stopped on conflicts by taking `tracking`'s side
    /// of every unmerged path. A merge git refused to start is returned as
    /// `merge_err`; one that cannot be finished is aborted.
    fn resolve_toward_remote(
        &self,
        tracking: &str,
        merge_err: SyncError,
    ) -> Result<Vec<String>, SyncError> {
        let unmerged = match self.client.unmerged_paths() {
            Ok(paths) if paths.is_empty() => return Err(merge_err),
            Ok(paths) => paths,
            Err(err) => return Err(self.abort_merge(err)),
        };

        tracing::warn!(
            "remote wins: resolving conflicted {} to {}",
            unmerged.join(", "),
            tracking
        );
        self.client
            .take_theirs(tracking, &unmerged)
            .and_then(|()| self.client.conclude_merge())
            .map_err(|err| self.abort_merge(err))?;
        Ok(unmerged)
    }

    fn abort_merge(&self, cause: SyncError) -> SyncError {
        if let Err(err) = self.client.merge_abort() {
            tracing::error!("failed to abort merge in {}: {}", self.config.vault, err);
        }
        cause
    }

    fn commit_pending(&self) -> Result<bool, SyncError> {
        if !self.repo().has_local_changes()? {
            return Ok(false);
        }
        self.client.add_all()?;
        self.client.commit(auto_commit_message())?;
        tracing::info!("changes committed in {}", self.config.vault);
        Ok(true)
    }

    fn squash_and_push(&self, threshold: u64) -> Result<PushOutcome, CycleError> {
        let repo = self.repo();
        let remote = &self.config.remote;

        let ahead = repo
            .commits_ahead()
            .map_err(at(CyclePhase::SquashEvaluating))?;
        if ahead == 0 {
            return Ok(PushOutcome::UpToDate);
        }
        if ahead < threshold {
            tracing::debug!("{} local commit(s), deferring push until {}", ahead, threshold);
            return Ok(PushOutcome::Deferred { ahead, threshold });
        }

        let represented = repo
            .unpushed_log()
            .map(|lines| represented_commits(&lines))
            .map_err(at(CyclePhase::SquashEvaluating))?;
        self.client
            .reset_soft(&remote.tracking())
            .map_err(at(CyclePhase::SquashEvaluating))?;

        let staged = self
            .client
            .staged_paths()
            .map_err(at(CyclePhase::SquashEvaluating))?;
        if staged.is_empty() {
            tracing::info!("{} local commit(s) cancel out against {}", ahead, remote);
            return Ok(PushOutcome::Empty);
        }

        self.client
            .commit(&squash_message(represented))
            .map_err(at(CyclePhase::SquashEvaluating))?;
        self.client
            .push(&remote.remote, &remote.branch, PushMode::Plain)
            .map_err(at(CyclePhase::Pushing))?;

        tracing::info!("sync to remote successful ({} commit(s) squashed)", represented);
        Ok(PushOutcome::Pushed {
            represented,
            forced: false,
        })
    }
}

fn at(phase: CyclePhase) -> impl Fn(SyncError) -> CycleError {
    move |source| CycleError::new(phase, source)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::fake::FakeVcs;

    fn engine() -> Engine<FakeVcs> {
        Engine::new(
            FakeVcs::new("/vault"),
            EngineConfig {
                vault: VaultPath::from(PathBuf::from("/vault")),
                remote: RemoteRef::default(),
                squash_threshold: 25,
            },
        )
    }

    fn commit_file(fake: &FakeVcs, path: &str, content: &str, message: &str) {
        fake.write(path, content);
        fake.user_commit(message);
    }

    #[test]
    fn clean_vault_cycles_change_nothing() {
        let engine = engine();
        for _ in 0..2 {
            let report = engine.reconcile(25).unwrap();
            assert_eq!(report.merged, 0);
            assert!(!report.committed);
            assert_eq!(report.push, PushOutcome::UpToDate);
        }
        let calls = engine.client().calls();
        assert!(!calls.iter().any(|c| c == "commit" || c.starts_with("push")));
        assert_eq!(engine.client().remote_log(), vec!["initial"]);
    }

    #[test]
    fn settle_commits_without_touching_the_remote() {
        let engine = engine();
        engine.client().write("notes/today.md", "draft\n");

        let report = engine.settle().unwrap();
        assert_eq!(report.kind, CycleKind::Settle);
        assert!(report.committed);
        assert_eq!(engine.client().local_log()[0], "Auto commit by ob");
        assert!(!engine.client().dirty());

        let calls = engine.client().calls();
        assert!(!calls.iter().any(|c| c == "fetch" || c.starts_with("push")));

        assert!(!engine.settle().unwrap().committed);
    }

    #[test]
    fn scheduled_cycle_below_threshold_defers_push() {
        let engine = engine();
        engine.client().write("notes/today.md", "draft\n");

        let report = engine.reconcile(25).unwrap();
        assert!(report.committed);
        assert_eq!(
            report.push,
            PushOutcome::Deferred {
                ahead: 1,
                threshold: 25
            }
        );
        assert_eq!(engine.client().ahead(), 1);
        assert_eq!(engine.client().remote_log(), vec!["initial"]);
    }

    #[test]
    fn scheduled_cycle_at_threshold_pushes_one_marker() {
        let engine = engine();
        for i in 0..25 {
            commit_file(engine.client(), "log.md", &format!("{i}\n"), "edit");
        }

        let report = engine.reconcile(25).unwrap();
        assert_eq!(
            report.push,
            PushOutcome::Pushed {
                represented: 25,
                forced: false
            }
        );
        assert_eq!(
            engine.client().remote_log(),
            vec!["Squashed 25 commits by ob", "initial"]
        );
        assert_eq!(engine.client().ahead(), 0);
    }

    #[test]
    fn manual_threshold_pushes_what_scheduled_defers() {
        let engine = engine();
        for i in 0..3 {
            commit_file(engine.client(), "log.md", &format!("{i}\n"), "edit");
        }

        assert_eq!(
            engine.reconcile(25).unwrap().push,
            PushOutcome::Deferred {
                ahead: 3,
                threshold: 25
            }
        );

        let report = engine.reconcile(0).unwrap();
        assert_eq!(
            report.push,
            PushOutcome::Pushed {
                represented: 3,
                forced: false
            }
        );
        let calls = engine.client().calls();
        assert!(calls.iter().any(|c| c == "push"));
        assert!(!calls.iter().any(|c| c == "push --force"));
    }

    #[test]
    fn scheduled_squash_sums_existing_markers() {
        let engine = engine();
        commit_file(engine.client(), "a.md", "a\n", "Squashed 7 commits by ob");
        commit_file(engine.client(), "b.md", "b\n", "one");
        commit_file(engine.client(), "c.md", "c\n", "two");
        commit_file(engine.client(), "d.md", "d\n", "three");

        let report = engine.reconcile(0).unwrap();
        assert_eq!(
            report.push,
            PushOutcome::Pushed {
                represented: 10,
                forced: false
            }
        );
        assert_eq!(engine.client().remote_log()[0], "Squashed 10 commits by ob");
    }

    #[test]
    fn remote_wins_over_uncommitted_edits_to_the_same_path() {
        let engine = engine();
        let fake = engine.client();
        fake.remote_commit("notes/shared.md", "remote\n", "edit elsewhere");
        fake.write("notes/shared.md", "local\n");
        fake.write("notes/mine.md", "mine\n");

        let report = engine.reconcile(25).unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.discarded, vec!["notes/shared.md".to_string()]);
        assert!(report.committed);
        assert_eq!(fake.read("notes/shared.md").as_deref(), Some("remote\n"));
        assert_eq!(fake.read("notes/mine.md").as_deref(), Some("mine\n"));
        assert_eq!(fake.behind(), 0);
    }

    #[test]
    fn diverged_history_is_merged_then_squashed_on_top_of_remote() {
        let engine = engine();
        let fake = engine.client();
        commit_file(fake, "local.md", "l\n", "local edit");
        fake.remote_commit("remote.md", "r\n", "remote edit");

        let report = engine.reconcile(0).unwrap();
        assert_eq!(report.merged, 1);
        assert!(matches!(report.push, PushOutcome::Pushed { forced: false, .. }));
        assert_eq!(fake.ahead(), 0);
        assert_eq!(fake.behind(), 0);
        assert_eq!(fake.remote_log()[1], "remote edit");
        assert_eq!(fake.read("remote.md").as_deref(), Some("r\n"));
        assert_eq!(fake.read("local.md").as_deref(), Some("l\n"));
    }

    #[test]
    fn commits_that_cancel_out_push_nothing() {
        let engine = engine();
        commit_file(engine.client(), "README.md", "changed\n", "change");
        commit_file(engine.client(), "README.md", "vault\n", "change back");

        let report = engine.reconcile(0).unwrap();
        assert_eq!(report.push, PushOutcome::Empty);
        assert_eq!(engine.client().ahead(), 0);
        assert!(!engine.client().calls().iter().any(|c| c.starts_with("push")));
    }

    #[test]
    fn fetch_failure_aborts_before_anything_else() {
        let engine = engine();
        engine.client().write("notes/today.md", "draft\n");
        engine.client().fail_next("fetch", "fatal: unable to access remote");

        let err = engine.reconcile(25).unwrap_err();
        assert_eq!(err.phase, CyclePhase::Fetching);
        assert!(err.to_string().contains("unable to access remote"));
        assert_eq!(engine.client().calls(), vec!["fetch"]);
        assert!(engine.client().dirty());
    }

    #[test]
    fn conflicted_merge_is_resolved_to_the_remote_side() {
        let engine = engine();
        let fake = engine.client();
        commit_file(fake, "README.md", "local edit\n", "edit readme");
        fake.remote_delete("README.md", "peer deletes readme");
        fake.conflict_next_merge(&["README.md"]);

        let report = engine.reconcile(25).unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.discarded, vec!["README.md".to_string()]);
        assert!(!report.committed);
        assert_eq!(fake.read("README.md"), None);
        assert!(!fake.merge_in_progress());
        assert!(!fake.calls().iter().any(|c| c == "merge --abort"));

        // The half-merge is gone, so settle has nothing to conclude and the
        // local edit never reaches the remote.
        assert!(!engine.settle().unwrap().committed);
        assert_eq!(engine.reconcile(0).unwrap().push, PushOutcome::Empty);
        assert_eq!(fake.remote_log(), vec!["peer deletes readme", "initial"]);
    }

    #[test]
    fn unresolvable_merge_is_aborted_before_settle_can_commit_it() {
        let engine = engine();
        let fake = engine.client();
        commit_file(fake, "README.md", "local edit\n", "edit readme");
        fake.remote_delete("README.md", "peer deletes readme");
        fake.conflict_next_merge(&["README.md"]);
        fake.fail_next("checkout --theirs", "error: pathspec did not match");

        let err = engine.reconcile(25).unwrap_err();
        assert_eq!(err.phase, CyclePhase::Merging);
        assert!(fake.calls().iter().any(|c| c == "merge --abort"));
        assert!(!fake.merge_in_progress());
        assert!(!engine.settle().unwrap().committed);
        assert_eq!(fake.local_log(), vec!["edit readme", "initial"]);
    }

    #[test]
    fn refused_merge_is_reported_without_abort() {
        let engine = engine();
        let fake = engine.client();
        fake.remote_commit("b.md", "b\n", "remote");
        fake.fail_next("merge", "fatal: refusing to merge unrelated histories");

        let err = engine.reconcile(25).unwrap_err();
        assert_eq!(err.phase, CyclePhase::Merging);
        assert!(err.to_string().contains("unrelated histories"));
        assert!(!fake.calls().iter().any(|c| c == "merge --abort"));
    }

    #[test]
    fn failed_push_is_retried_by_the_next_cycle() {
        let engine = engine();
        commit_file(engine.client(), "a.md", "a\n", "edit");
        engine.client().fail_next("push", "! [rejected] main -> main");

        let err = engine.reconcile(0).unwrap_err();
        assert_eq!(err.phase, CyclePhase::Pushing);
        assert_eq!(engine.client().local_log()[0], "Squashed 1 commits by ob");

        let report = engine.reconcile(0).unwrap();
        assert_eq!(
            report.push,
            PushOutcome::Pushed {
                represented: 1,
                forced: false
            }
        );
        assert_eq!(
            engine.client().remote_log(),
            vec!["Squashed 1 commits by ob", "initial"]
        );
    }

    #[test]
    fn compact_sums_markers_and_force_pushes() {
        let engine = engine();
        let fake = engine.client();
        commit_file(fake, "a.md", "a\n", "Squashed 7 commits by ob");
        engine.reconcile(0).unwrap();
        commit_file(fake, "b.md", "b\n", "one");
        commit_file(fake, "c.md", "c\n", "two");
        commit_file(fake, "d.md", "d\n", "three");
        engine.reconcile(0).unwrap();
        assert_eq!(
            fake.remote_log(),
            vec![
                "Squashed 3 commits by ob",
                "Squashed 7 commits by ob",
                "initial"
            ]
        );
        fake.clear_calls();

        let report = engine.compact(2).unwrap();
        assert_eq!(report.flush.push, PushOutcome::UpToDate);
        assert_eq!(report.replaced, 2);
        assert_eq!(report.represented, 10);
        assert_eq!(
            fake.remote_log(),
            vec!["Squashed 10 commits by ob", "initial"]
        );
        assert!(fake.calls().iter().any(|c| c == "push --force"));
    }

    #[test]
    fn compact_integrates_remote_work_before_rewriting() {
        let engine = engine();
        let fake = engine.client();
        fake.remote_commit("remote.md", "r\n", "remote edit");

        let report = engine.compact(1).unwrap();
        assert_eq!(report.flush.merged, 1);
        assert_eq!(report.represented, 1);
        assert_eq!(fake.remote_log(), vec!["Squashed 1 commits by ob", "initial"]);
        assert_eq!(fake.read("remote.md").as_deref(), Some("r\n"));
    }

    #[test]
    fn compact_rejects_more_than_history_holds() {
        let engine = engine();
        for requested in [1, 5] {
            let err = engine.compact(requested).unwrap_err();
            assert_eq!(err.phase, CyclePhase::SquashEvaluating);
            assert!(matches!(
                err.source,
                SyncError::InvalidSquash { available: 1, .. }
            ));
        }
        let calls = engine.client().calls();
        assert!(!calls.iter().any(|c| c == "reset" || c.starts_with("push")));
    }

    #[test]
    fn compact_of_zero_is_rejected_without_running_git() {
        let engine = engine();
        let err = engine.compact(0).unwrap_err();
        assert!(matches!(
            err.source,
            SyncError::InvalidSquash { requested: 0, .. }
        ));
        assert!(engine.client().calls().is_empty());
    }

    #[test]
    fn status_reports_without_fetching() {
        let engine = engine();
        engine.client().remote_commit("remote.md", "r\n", "unfetched");
        engine.client().write("notes/today.md", "draft\n");

        let status = engine.status().unwrap();
        assert!(status.dirty);
        assert_eq!(status.ahead, 0);
        assert_eq!(status.remote, "origin/main");
        assert_eq!(status.last_local_commit, status.last_remote_commit);

        engine.client().user_commit("local");
        let status = engine.status().unwrap();
        assert!(!status.dirty);
        assert_eq!(status.ahead, 1);
        assert!(status.last_local_commit > status.last_remote_commit);
        assert!(!engine.client().calls().iter().any(|c| c == "fetch"));
    }
}
