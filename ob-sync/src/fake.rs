//! In-memory [`VcsClient`] for tests.
//!
//! Models one vault with a linear local history, the remote branch, the
//! remote-tracking ref (refreshed only by `fetch`), an index and a worktree.
//! Every client call is recorded by name so tests can assert which commands a
//! cycle ran. "Remote side" helpers such as [`FakeVcs::remote_commit`] are not
//! recorded.
//!
//! Merge is simplified: any path the remote changed takes the remote content
//! as a whole file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use crate::client::{LogSpan, PushMode, VcsClient};
use crate::error::SyncError;

type Tree = BTreeMap<String, String>;

const EPOCH: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
struct FakeCommit {
    id: u64,
    message: String,
    tree: Tree,
}

#[derive(Debug)]
struct State {
    next_id: u64,
    remote: Vec<FakeCommit>,
    tracking: Vec<FakeCommit>,
    head: Vec<FakeCommit>,
    index: Tree,
    worktree: Tree,
    calls: Vec<String>,
    failures: HashMap<String, String>,
    /// Paths the next `merge` leaves conflicted.
    conflict_next: Option<Vec<String>>,
    /// Incoming commits of a merge stopped on conflicts.
    merging: Option<Vec<FakeCommit>>,
    unmerged: Vec<String>,
}

pub struct FakeVcs {
    vault: PathBuf,
    state: Mutex<State>,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

/// Test-side handle of a gated `fetch`.
pub struct FetchGate {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl FetchGate {
    /// Block until a cycle is parked inside `fetch`.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(5))
            .expect("no cycle reached fetch");
    }

    /// Let the parked `fetch` return.
    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

impl FakeVcs {
    /// A vault whose only commit is already on the remote.
    pub fn new(vault: impl Into<PathBuf>) -> Self {
        let tree: Tree = [("README.md".to_string(), "vault\n".to_string())]
            .into_iter()
            .collect();
        let root = FakeCommit {
            id: 1,
            message: "initial".to_string(),
            tree: tree.clone(),
        };
        Self {
            vault: vault.into(),
            state: Mutex::new(State {
                next_id: 2,
                remote: vec![root.clone()],
                tracking: vec![root.clone()],
                head: vec![root],
                index: tree.clone(),
                worktree: tree,
                calls: Vec::new(),
                failures: HashMap::new(),
                conflict_next: None,
                merging: None,
                unmerged: Vec::new(),
            }),
            gate: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake vcs state poisoned")
    }

    // -----------------------------------------------------------------------
    // Test setup and inspection (not recorded)
    // -----------------------------------------------------------------------

    /// Edit a file in the worktree.
    pub fn write(&self, path: &str, content: &str) {
        self.lock()
            .worktree
            .insert(path.to_string(), content.to_string());
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.lock().worktree.get(path).cloned()
    }

    /// A user commit of everything in the worktree.
    pub fn user_commit(&self, message: &str) {
        let mut state = self.lock();
        state.index = state.worktree.clone();
        let tree = state.index.clone();
        state.append_head(message, tree);
    }

    /// A commit made elsewhere and pushed to the remote.
    pub fn remote_commit(&self, path: &str, content: &str, message: &str) {
        let mut state = self.lock();
        let mut tree = state.remote.last().map(|c| c.tree.clone()).unwrap_or_default();
        tree.insert(path.to_string(), content.to_string());
        let id = state.take_id();
        state.remote.push(FakeCommit {
            id,
            message: message.to_string(),
            tree,
        });
    }

    /// A commit made elsewhere that deletes `path`.
    pub fn remote_delete(&self, path: &str, message: &str) {
        let mut state = self.lock();
        let mut tree = state.remote.last().map(|c| c.tree.clone()).unwrap_or_default();
        tree.remove(path);
        let id = state.take_id();
        state.remote.push(FakeCommit {
            id,
            message: message.to_string(),
            tree,
        });
    }

    /// Make the next `merge` stop with `paths` unmerged, the way git does on
    /// a modify/delete conflict. Conflicted paths keep their local content.
    pub fn conflict_next_merge(&self, paths: &[&str]) {
        self.lock().conflict_next = Some(paths.iter().map(|p| p.to_string()).collect());
    }

    pub fn merge_in_progress(&self) -> bool {
        self.lock().merging.is_some()
    }

    /// Make the next call of `op` (e.g. `"push"`) fail with `stderr`.
    pub fn fail_next(&self, op: &str, stderr: &str) {
        self.lock()
            .failures
            .insert(op.to_string(), stderr.to_string());
    }

    /// Park the next `fetch` until the returned gate is released.
    pub fn gate_fetch(&self) -> FetchGate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().expect("gate poisoned") = Some((entered_tx, release_rx));
        FetchGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn dirty(&self) -> bool {
        let state = self.lock();
        let head = state.head_tree();
        state.index != head || state.worktree != head
    }

    /// Local commits the remote lacks.
    pub fn ahead(&self) -> u64 {
        let state = self.lock();
        missing_from(&state.head, &state.remote).len() as u64
    }

    /// Remote commits `HEAD` lacks.
    pub fn behind(&self) -> u64 {
        let state = self.lock();
        missing_from(&state.remote, &state.head).len() as u64
    }

    /// Local subjects, newest first.
    pub fn local_log(&self) -> Vec<String> {
        self.lock().head.iter().rev().map(|c| c.message.clone()).collect()
    }

    /// Remote subjects, newest first.
    pub fn remote_log(&self) -> Vec<String> {
        self.lock().remote.iter().rev().map(|c| c.message.clone()).collect()
    }

    fn record(&self, op: &str) -> Result<std::sync::MutexGuard<'_, State>, SyncError> {
        let mut state = self.lock();
        state.calls.push(op.to_string());
        if let Some(stderr) = state.failures.remove(op) {
            return Err(failure(op, &stderr));
        }
        Ok(state)
    }
}

impl State {
    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn head_tree(&self) -> Tree {
        self.head.last().map(|c| c.tree.clone()).unwrap_or_default()
    }

    fn append_head(&mut self, message: &str, tree: Tree) {
        let id = self.take_id();
        self.head.push(FakeCommit {
            id,
            message: message.to_string(),
            tree,
        });
    }

    fn resolve(&self, reference: &str) -> Result<&[FakeCommit], SyncError> {
        match reference {
            "HEAD" => Ok(&self.head),
            r if r.contains('/') => Ok(&self.tracking),
            other => Err(failure("rev-parse", &format!("unknown revision '{other}'"))),
        }
    }

    /// Commits of `b` not in `a` for an `a..b` range, oldest first.
    fn range(&self, range: &str) -> Result<Vec<FakeCommit>, SyncError> {
        match range.split_once("..") {
            Some((a, b)) => Ok(missing_from(self.resolve(b)?, self.resolve(a)?)),
            None => Ok(self.resolve(range)?.to_vec()),
        }
    }

    /// Tree of the newest tracking commit `HEAD` also has.
    fn merge_base_tree(&self) -> Tree {
        let local: HashSet<u64> = self.head.iter().map(|c| c.id).collect();
        self.tracking
            .iter()
            .rev()
            .find(|c| local.contains(&c.id))
            .map(|c| c.tree.clone())
            .unwrap_or_default()
    }

    fn incoming(&self) -> Vec<String> {
        let base = self.merge_base_tree();
        let theirs = self.tracking.last().map(|c| c.tree.clone()).unwrap_or_default();
        changed_between(&base, &theirs)
    }
}

fn missing_from(from: &[FakeCommit], other: &[FakeCommit]) -> Vec<FakeCommit> {
    let ids: HashSet<u64> = other.iter().map(|c| c.id).collect();
    from.iter().filter(|c| !ids.contains(&c.id)).cloned().collect()
}

fn changed_between(a: &Tree, b: &Tree) -> Vec<String> {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter()
        .filter(|k| a.get(*k) != b.get(*k))
        .cloned()
        .collect()
}

fn set_path(tree: &mut Tree, path: &str, value: Option<&String>) {
    match value {
        Some(v) => {
            tree.insert(path.to_string(), v.clone());
        }
        None => {
            tree.remove(path);
        }
    }
}

fn oneline(commit: &FakeCommit) -> String {
    format!("{:07x} {}", commit.id, commit.message)
}

fn failure(op: &str, stderr: &str) -> SyncError {
    SyncError::Command {
        program: "git".to_string(),
        args: vec![op.to_string()],
        stderr: stderr.to_string(),
    }
}

impl VcsClient for FakeVcs {
    fn vault(&self) -> &Path {
        &self.vault
    }

    fn fetch(&self, _remote: &str, _branch: &str) -> Result<(), SyncError> {
        drop(self.record("fetch")?);
        let gate = self.gate.lock().expect("gate poisoned").take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        let mut state = self.lock();
        state.tracking = state.remote.clone();
        Ok(())
    }

    fn status(&self) -> Result<Vec<String>, SyncError> {
        let state = self.record("status")?;
        let head = state.head_tree();
        let paths: BTreeSet<&String> = head
            .keys()
            .chain(state.index.keys())
            .chain(state.worktree.keys())
            .collect();
        let mut lines = Vec::new();
        for path in paths {
            let (h, i, w) = (head.get(path), state.index.get(path), state.worktree.get(path));
            if h.is_none() && i.is_none() {
                lines.push(format!("?? {path}"));
                continue;
            }
            let x = match (h, i) {
                (None, Some(_)) => 'A',
                (Some(_), None) => 'D',
                (a, b) if a != b => 'M',
                _ => ' ',
            };
            let y = match (i, w) {
                (Some(_), None) => 'D',
                (a, b) if a != b => 'M',
                _ => ' ',
            };
            if x != ' ' || y != ' ' {
                lines.push(format!("{x}{y} {path}"));
            }
        }
        Ok(lines)
    }

    fn add_all(&self) -> Result<(), SyncError> {
        let mut state = self.record("add")?;
        state.index = state.worktree.clone();
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<(), SyncError> {
        let mut state = self.record("commit")?;
        if state.index == state.head_tree() {
            return Err(failure("commit", "nothing to commit, working tree clean"));
        }
        let tree = state.index.clone();
        state.append_head(message, tree);
        Ok(())
    }

    fn push(&self, _remote: &str, _branch: &str, mode: PushMode) -> Result<(), SyncError> {
        let op = match mode {
            PushMode::Plain => "push",
            PushMode::Force => "push --force",
        };
        let mut state = self.record(op)?;
        if mode == PushMode::Plain && !missing_from(&state.remote, &state.head).is_empty() {
            return Err(failure(op, "! [rejected] main -> main (non-fast-forward)"));
        }
        state.remote = state.head.clone();
        state.tracking = state.head.clone();
        Ok(())
    }

    fn log_oneline(&self, span: &LogSpan) -> Result<Vec<String>, SyncError> {
        let state = self.record("log")?;
        let commits = match span {
            LogSpan::Range(range) => state.range(range)?,
            LogSpan::Last(n) => {
                let skip = state.head.len().saturating_sub(*n as usize);
                state.head[skip..].to_vec()
            }
        };
        Ok(commits.iter().rev().map(oneline).collect())
    }

    fn log_timestamp(&self, reference: &str) -> Result<Vec<String>, SyncError> {
        let state = self.record("log -1")?;
        Ok(state
            .resolve(reference)?
            .last()
            .map(|c| (EPOCH + c.id as i64 * 60).to_string())
            .into_iter()
            .collect())
    }

    fn rev_list_count(&self, range: &str) -> Result<Vec<String>, SyncError> {
        let state = self.record("rev-list")?;
        Ok(vec![state.range(range)?.len().to_string()])
    }

    fn reset_soft(&self, target: &str) -> Result<(), SyncError> {
        let mut state = self.record("reset")?;
        if let Some(n) = target.strip_prefix("HEAD~") {
            let n: usize = n
                .parse()
                .map_err(|_| failure("reset", &format!("bad revision '{target}'")))?;
            if n >= state.head.len() {
                return Err(failure("reset", &format!("ambiguous argument '{target}'")));
            }
            let keep = state.head.len() - n;
            state.head.truncate(keep);
        } else {
            let target = state.resolve(target)?.to_vec();
            state.head = target;
        }
        Ok(())
    }

    fn staged_paths(&self) -> Result<Vec<String>, SyncError> {
        let state = self.record("diff --cached")?;
        Ok(changed_between(&state.head_tree(), &state.index))
    }

    fn diff_names(&self, range: &str) -> Result<Vec<String>, SyncError> {
        let state = self.record("diff")?;
        if !range.contains("...") {
            return Err(failure("diff", &format!("unsupported range '{range}'")));
        }
        Ok(state.incoming())
    }

    fn restore(&self, paths: &[String]) -> Result<(), SyncError> {
        let mut state = self.record("restore")?;
        let head = state.head_tree();
        for path in paths {
            set_path(&mut state.index, path, head.get(path));
            set_path(&mut state.worktree, path, head.get(path));
        }
        Ok(())
    }

    fn merge_theirs(&self, _reference: &str) -> Result<(), SyncError> {
        let mut state = self.record("merge")?;
        let new_commits = missing_from(&state.tracking, &state.head);
        if new_commits.is_empty() {
            return Ok(());
        }

        let head = state.head_tree();
        let incoming = state.incoming();
        let blocked: Vec<&String> = incoming
            .iter()
            .filter(|p| state.index.get(*p) != head.get(*p) || state.worktree.get(*p) != head.get(*p))
            .collect();
        if !blocked.is_empty() {
            return Err(failure(
                "merge",
                "error: Your local changes to the following files would be overwritten by merge",
            ));
        }

        let theirs = state.tracking.last().map(|c| c.tree.clone()).unwrap_or_default();
        let conflicted = state.conflict_next.take().unwrap_or_default();
        let fast_forward = missing_from(&state.head, &state.tracking).is_empty();
        let mut merged = head;
        for path in incoming.iter().filter(|p| !conflicted.contains(p)) {
            set_path(&mut merged, path, theirs.get(path));
            set_path(&mut state.index, path, theirs.get(path));
            set_path(&mut state.worktree, path, theirs.get(path));
        }

        if !conflicted.is_empty() {
            state.merging = Some(new_commits);
            state.unmerged = conflicted;
            return Err(failure(
                "merge",
                "CONFLICT (modify/delete): Automatic merge failed; fix conflicts and then commit the result.",
            ));
        }

        if fast_forward {
            state.head = state.tracking.clone();
        } else {
            state.head.extend(new_commits);
            state.append_head("Merge remote-tracking branch 'origin/main'", merged);
        }
        Ok(())
    }

    fn unmerged_paths(&self) -> Result<Vec<String>, SyncError> {
        let state = self.record("diff --diff-filter=U")?;
        Ok(state.unmerged.clone())
    }

    fn take_theirs(&self, _reference: &str, paths: &[String]) -> Result<(), SyncError> {
        let mut state = self.record("checkout --theirs")?;
        let theirs = state.tracking.last().map(|c| c.tree.clone()).unwrap_or_default();
        for path in paths {
            set_path(&mut state.index, path, theirs.get(path));
            set_path(&mut state.worktree, path, theirs.get(path));
        }
        state.unmerged.retain(|p| !paths.contains(p));
        Ok(())
    }

    fn conclude_merge(&self) -> Result<(), SyncError> {
        let mut state = self.record("commit --no-edit")?;
        if !state.unmerged.is_empty() {
            return Err(failure("commit", "Committing is not possible because you have unmerged files."));
        }
        let Some(incoming) = state.merging.take() else {
            return Err(failure("commit", "no merge in progress"));
        };
        let tree = state.index.clone();
        state.head.extend(incoming);
        state.append_head("Merge remote-tracking branch 'origin/main'", tree);
        Ok(())
    }

    fn merge_abort(&self) -> Result<(), SyncError> {
        let mut state = self.record("merge --abort")?;
        if state.merging.take().is_none() {
            return Err(failure("merge", "fatal: There is no merge to abort (MERGE_HEAD missing)."));
        }
        state.unmerged.clear();
        let head = state.head_tree();
        state.index = head.clone();
        state.worktree = head;
        Ok(())
    }
}
