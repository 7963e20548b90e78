//! Version-control capability used by the engine.
//!
//! [`GitCli`] shells out to `git -C <vault> …` through [`run_command`]; tests
//! substitute the in-memory `FakeVcs`. Methods return raw output lines and
//! leave interpretation to [`crate::repository::Repository`].
//!
//! Path listings are read with `-z` and paths are passed back with
//! `--literal-pathspecs`, so a name git would C-quote or treat as a glob
//! round-trips unchanged.

use std::path::{Path, PathBuf};

use ob_core::VaultPath;

use crate::error::SyncError;
use crate::runner::{run_command, run_command_nul};

/// Whether a push may rewrite history the remote has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    Plain,
    Force,
}

/// Which commits a oneline log should list (newest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSpan {
    /// `git log --oneline <range>`, e.g. `origin/main..HEAD`.
    Range(String),
    /// The last `n` commits on `HEAD`'s first-parent chain, the same commits
    /// `HEAD~n` steps over.
    Last(u64),
}

/// One method per subcommand family the engine needs.
pub trait VcsClient: Send + Sync {
    /// Working copy this client operates on.
    fn vault(&self) -> &Path;

    fn fetch(&self, remote: &str, branch: &str) -> Result<(), SyncError>;

    /// Porcelain status, one `XY <path>` entry per change. Renames are
    /// reported as a deletion plus an addition. Takes no optional locks, so
    /// it never blocks a concurrent writer.
    fn status(&self) -> Result<Vec<String>, SyncError>;

    /// Stage every tracked and untracked change.
    fn add_all(&self) -> Result<(), SyncError>;

    fn commit(&self, message: &str) -> Result<(), SyncError>;

    fn push(&self, remote: &str, branch: &str, mode: PushMode) -> Result<(), SyncError>;

    /// `<abbrev-hash> <subject>` lines.
    fn log_oneline(&self, span: &LogSpan) -> Result<Vec<String>, SyncError>;

    /// Committer timestamp (unix seconds) of the tip of `reference`.
    fn log_timestamp(&self, reference: &str) -> Result<Vec<String>, SyncError>;

    /// `git rev-list --count <range>`.
    fn rev_list_count(&self, range: &str) -> Result<Vec<String>, SyncError>;

    /// Move `HEAD` to `target`, keeping index and worktree.
    fn reset_soft(&self, target: &str) -> Result<(), SyncError>;

    /// Paths whose index entry differs from `HEAD`.
    fn staged_paths(&self) -> Result<Vec<String>, SyncError>;

    /// Paths changed in `range` (`git diff --name-only <range>`).
    fn diff_names(&self, range: &str) -> Result<Vec<String>, SyncError>;

    /// Throw away local changes to `paths`, returning them to their `HEAD`
    /// content (untracked paths are deleted).
    fn restore(&self, paths: &[String]) -> Result<(), SyncError>;

    /// Merge `reference` into `HEAD`; conflicting hunks take the incoming side.
    fn merge_theirs(&self, reference: &str) -> Result<(), SyncError>;

    /// Paths a failed merge left unmerged.
    fn unmerged_paths(&self) -> Result<Vec<String>, SyncError>;

    /// Resolve `paths` to their content at `reference`; paths `reference`
    /// lacks are deleted.
    fn take_theirs(&self, reference: &str, paths: &[String]) -> Result<(), SyncError>;

    /// Commit the merge in progress with its prepared message.
    fn conclude_merge(&self) -> Result<(), SyncError>;

    fn merge_abort(&self) -> Result<(), SyncError>;
}

/// [`VcsClient`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    vault: PathBuf,
}

impl GitCli {
    pub fn new(vault: &VaultPath) -> Self {
        Self::with_program("git", vault)
    }

    pub fn with_program(program: impl Into<String>, vault: &VaultPath) -> Self {
        Self {
            program: program.into(),
            vault: vault.as_path().to_path_buf(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<Vec<String>, SyncError> {
        let vault = self.vault.to_string_lossy();
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        full.push("-C");
        full.push(vault.as_ref());
        full.extend_from_slice(args);
        run_command(&self.program, &full)
    }

    fn git_z(&self, args: &[&str]) -> Result<Vec<String>, SyncError> {
        let vault = self.vault.to_string_lossy();
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        full.push("-C");
        full.push(vault.as_ref());
        full.extend_from_slice(args);
        run_command_nul(&self.program, &full)
    }
}

impl VcsClient for GitCli {
    fn vault(&self) -> &Path {
        &self.vault
    }

    fn fetch(&self, remote: &str, branch: &str) -> Result<(), SyncError> {
        self.git(&["fetch", remote, branch]).map(|_| ())
    }

    fn status(&self) -> Result<Vec<String>, SyncError> {
        self.git_z(&[
            "--no-optional-locks",
            "status",
            "--porcelain",
            "-z",
            "--untracked-files=all",
            "--no-renames",
        ])
    }

    fn add_all(&self) -> Result<(), SyncError> {
        self.git(&["add", "-A"]).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<(), SyncError> {
        self.git(&["commit", "-m", message]).map(|_| ())
    }

    fn push(&self, remote: &str, branch: &str, mode: PushMode) -> Result<(), SyncError> {
        match mode {
            PushMode::Plain => self.git(&["push", remote, branch]),
            PushMode::Force => self.git(&["push", "--force", remote, branch]),
        }
        .map(|_| ())
    }

    fn log_oneline(&self, span: &LogSpan) -> Result<Vec<String>, SyncError> {
        match span {
            LogSpan::Range(range) => self.git(&["log", "--oneline", range]),
            LogSpan::Last(n) => {
                let count = format!("-{n}");
                self.git(&["log", "--oneline", "--first-parent", &count])
            }
        }
    }

    fn log_timestamp(&self, reference: &str) -> Result<Vec<String>, SyncError> {
        self.git(&["log", "-1", "--format=%ct", reference])
    }

    fn rev_list_count(&self, range: &str) -> Result<Vec<String>, SyncError> {
        self.git(&["rev-list", "--count", range])
    }

    fn reset_soft(&self, target: &str) -> Result<(), SyncError> {
        self.git(&["reset", "--soft", target]).map(|_| ())
    }

    fn staged_paths(&self) -> Result<Vec<String>, SyncError> {
        self.git_z(&["diff", "--cached", "--name-only", "-z"])
    }

    fn diff_names(&self, range: &str) -> Result<Vec<String>, SyncError> {
        self.git_z(&["diff", "--name-only", "-z", range])
    }

    fn restore(&self, paths: &[String]) -> Result<(), SyncError> {
        if paths.is_empty() {
            return Ok(());
        }
        // Paths known to HEAD go back to it; whatever is left untracked is removed.
        let tracked = self.tracked_at("HEAD", paths)?;
        if !tracked.is_empty() {
            self.git_with_paths(&["checkout", "HEAD", "--"], &tracked)?;
        }
        let added: Vec<String> = paths
            .iter()
            .filter(|p| !tracked.contains(p))
            .cloned()
            .collect();
        if !added.is_empty() {
            self.git_with_paths(&["rm", "-r", "-q", "--cached", "--ignore-unmatch", "--"], &added)?;
        }
        self.git_with_paths(&["clean", "-f", "-q", "--"], paths)
            .map(|_| ())
    }

    fn merge_theirs(&self, reference: &str) -> Result<(), SyncError> {
        self.git(&["merge", "-X", "theirs", "--no-edit", reference])
            .map(|_| ())
    }

    fn unmerged_paths(&self) -> Result<Vec<String>, SyncError> {
        self.git_z(&["diff", "--name-only", "-z", "--diff-filter=U"])
    }

    fn take_theirs(&self, reference: &str, paths: &[String]) -> Result<(), SyncError> {
        if paths.is_empty() {
            return Ok(());
        }
        let present = self.tracked_at(reference, paths)?;
        if !present.is_empty() {
            self.git_with_paths(&["checkout", reference, "--"], &present)?;
        }
        let deleted: Vec<String> = paths
            .iter()
            .filter(|p| !present.contains(p))
            .cloned()
            .collect();
        if !deleted.is_empty() {
            self.git_with_paths(&["rm", "-f", "-q", "--ignore-unmatch", "--"], &deleted)?;
        }
        Ok(())
    }

    fn conclude_merge(&self) -> Result<(), SyncError> {
        self.git(&["commit", "--no-edit"]).map(|_| ())
    }

    fn merge_abort(&self) -> Result<(), SyncError> {
        self.git(&["merge", "--abort"]).map(|_| ())
    }
}

impl GitCli {
    fn git_with_paths(&self, args: &[&str], paths: &[String]) -> Result<Vec<String>, SyncError> {
        self.git(&with_paths(args, paths))
    }

    /// Which of `paths` exist in the tree of `reference`.
    fn tracked_at(&self, reference: &str, paths: &[String]) -> Result<Vec<String>, SyncError> {
        self.git_z(&with_paths(&["ls-tree", "-r", "-z", "--name-only", reference, "--"], paths))
    }
}

/// `args` followed by `paths`, with pathspec magic and globbing disabled.
fn with_paths<'a>(args: &[&'a str], paths: &'a [String]) -> Vec<&'a str> {
    let mut full: Vec<&str> = Vec::with_capacity(args.len() + paths.len() + 1);
    full.push("--literal-pathspecs");
    full.extend_from_slice(args);
    full.extend(paths.iter().map(String::as_str));
    full
}
