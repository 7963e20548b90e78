//! Read-only queries over a vault, built on a [`VcsClient`].

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use ob_core::RemoteRef;

use crate::client::{LogSpan, VcsClient};
use crate::error::SyncError;

/// Local-only and remote-only commit counts relative to the tracked branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Divergence {
    pub ahead: u64,
    pub behind: u64,
}

/// Repository state of one vault as seen through `client`.
///
/// Nothing is cached: every call asks the working copy again. Errors from the
/// client pass through unchanged.
pub struct Repository<'a, C: ?Sized> {
    client: &'a C,
    remote: &'a RemoteRef,
}

impl<'a, C: VcsClient + ?Sized> Repository<'a, C> {
    pub fn new(client: &'a C, remote: &'a RemoteRef) -> Self {
        Self { client, remote }
    }

    /// Any uncommitted tracked or untracked change.
    pub fn has_local_changes(&self) -> Result<bool, SyncError> {
        Ok(!self.changed_paths()?.is_empty())
    }

    /// Paths named by the porcelain status, exactly as stored in the tree.
    pub fn changed_paths(&self) -> Result<Vec<String>, SyncError> {
        Ok(self
            .client
            .status()?
            .iter()
            .filter_map(|entry| entry.get(3..))
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Commits on `HEAD` that the remote-tracking branch lacks.
    pub fn commits_ahead(&self) -> Result<u64, SyncError> {
        self.count(&format!("{}..HEAD", self.remote.tracking()))
    }

    /// Commits on the remote-tracking branch that `HEAD` lacks. Only as fresh
    /// as the last fetch.
    pub fn commits_behind(&self) -> Result<u64, SyncError> {
        self.count(&format!("HEAD..{}", self.remote.tracking()))
    }

    pub fn divergence(&self) -> Result<Divergence, SyncError> {
        Ok(Divergence {
            ahead: self.commits_ahead()?,
            behind: self.commits_behind()?,
        })
    }

    /// Paths the remote side changed since it forked from `HEAD`.
    pub fn incoming_paths(&self) -> Result<Vec<String>, SyncError> {
        self.client
            .diff_names(&format!("HEAD...{}", self.remote.tracking()))
    }

    /// Oneline log of commits not yet on the remote, newest first.
    pub fn unpushed_log(&self) -> Result<Vec<String>, SyncError> {
        self.client.log_oneline(&LogSpan::Range(format!(
            "{}..HEAD",
            self.remote.tracking()
        )))
    }

    /// Oneline log of the last `n` commits on `HEAD`, newest first.
    pub fn recent_log(&self, n: u64) -> Result<Vec<String>, SyncError> {
        self.client.log_oneline(&LogSpan::Last(n))
    }

    /// Commit time of the tip of `reference`.
    pub fn last_commit_time(&self, reference: &str) -> Result<DateTime<Utc>, SyncError> {
        let lines = self.client.log_timestamp(reference)?;
        let first = lines.first().ok_or_else(|| SyncError::Parse {
            what: "commit timestamp",
            output: String::new(),
        })?;
        let seconds: i64 = first.trim().parse().map_err(|_| SyncError::Parse {
            what: "commit timestamp",
            output: first.clone(),
        })?;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| SyncError::Parse {
                what: "commit timestamp",
                output: first.clone(),
            })
    }

    fn count(&self, range: &str) -> Result<u64, SyncError> {
        let lines = self.client.rev_list_count(range)?;
        let first = lines.first().map(|l| l.trim()).unwrap_or("");
        first.parse().map_err(|_| SyncError::Parse {
            what: "commit count",
            output: lines.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeVcs;

    #[test]
    fn divergence_counts_both_sides_after_fetch() {
        let fake = FakeVcs::new("/vault");
        let remote = RemoteRef::default();
        fake.write("a.md", "a\n");
        fake.user_commit("local one");
        fake.remote_commit("b.md", "b\n", "remote one");
        fake.remote_commit("c.md", "c\n", "remote two");

        let repo = Repository::new(&fake, &remote);
        assert_eq!(repo.divergence().unwrap(), Divergence { ahead: 1, behind: 0 });

        fake.fetch("origin", "main").unwrap();
        assert_eq!(repo.divergence().unwrap(), Divergence { ahead: 1, behind: 2 });
        let mut incoming = repo.incoming_paths().unwrap();
        incoming.sort();
        assert_eq!(incoming, vec!["b.md", "c.md"]);
    }

    #[test]
    fn changed_paths_lists_tracked_and_untracked() {
        let fake = FakeVcs::new("/vault");
        let remote = RemoteRef::default();
        let repo = Repository::new(&fake, &remote);
        assert!(!repo.has_local_changes().unwrap());

        fake.write("README.md", "edited\n");
        fake.write("new note.md", "x\n");
        assert!(repo.has_local_changes().unwrap());
        assert_eq!(repo.changed_paths().unwrap(), vec!["README.md", "new note.md"]);
    }

    #[test]
    fn last_commit_time_reads_commit_seconds() {
        let fake = FakeVcs::new("/vault");
        let remote = RemoteRef::default();
        let at = Repository::new(&fake, &remote).last_commit_time("HEAD").unwrap();
        assert_eq!(at.timestamp(), 1_700_000_060);
    }

    #[test]
    fn client_errors_pass_through() {
        let fake = FakeVcs::new("/vault");
        let remote = RemoteRef::default();
        fake.fail_next("rev-list", "fatal: bad revision");
        let err = Repository::new(&fake, &remote).commits_ahead().unwrap_err();
        match err {
            SyncError::Command { stderr, .. } => assert_eq!(stderr, "fatal: bad revision"),
            other => panic!("expected Command error, got {other:?}"),
        }
    }

    #[test]
    fn status_entries_are_taken_verbatim() {
        let fake = FakeVcs::new("/vault");
        let remote = RemoteRef::default();
        fake.write("old -> new.md", "x\n");
        fake.write("café \"draft\".md", "y\n");
        assert_eq!(
            Repository::new(&fake, &remote).changed_paths().unwrap(),
            vec!["café \"draft\".md", "old -> new.md"]
        );
    }
}
