//! Cycles against real `git`: a bare remote plus two working copies, `peer`
//! standing in for another machine and `vault` being the one the engine runs on.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use ob_core::{RemoteRef, VaultPath};
use ob_sync::{CyclePhase, Engine, EngineConfig, GitCli, PushOutcome, Repository};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("git must be installed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn configure(dir: &Path) {
    git(dir, &["config", "user.name", "Vault Tester"]);
    git(dir, &["config", "user.email", "tester@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

struct World {
    _tmp: TempDir,
    remote: PathBuf,
    peer: PathBuf,
    vault: PathBuf,
}

impl World {
    fn new() -> Self {
        init_logging();
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let peer = tmp.path().join("peer");
        let vault = tmp.path().join("vault");

        git(tmp.path(), &["init", "--bare", "-q", remote.to_str().unwrap()]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git(tmp.path(), &["clone", "-q", remote.to_str().unwrap(), peer.to_str().unwrap()]);
        configure(&peer);
        git(&peer, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        fs::write(peer.join("notes.md"), "seed\n").unwrap();
        git(&peer, &["add", "-A"]);
        git(&peer, &["commit", "-q", "-m", "initial"]);
        git(&peer, &["push", "-q", "origin", "main"]);

        git(tmp.path(), &["clone", "-q", remote.to_str().unwrap(), vault.to_str().unwrap()]);
        configure(&vault);

        Self {
            _tmp: tmp,
            remote,
            peer,
            vault,
        }
    }

    fn engine(&self) -> Engine<GitCli> {
        let vault = VaultPath::from(self.vault.clone());
        Engine::new(
            GitCli::new(&vault),
            EngineConfig {
                vault,
                remote: RemoteRef::default(),
                squash_threshold: 25,
            },
        )
    }

    fn commit_in_vault(&self, file: &str, content: &str, message: &str) {
        fs::write(self.vault.join(file), content).unwrap();
        git(&self.vault, &["add", "-A"]);
        git(&self.vault, &["commit", "-q", "-m", message]);
    }

    fn remote_subjects(&self) -> Vec<String> {
        git(&self.remote, &["log", "--format=%s", "main"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[test]
fn remote_edit_wins_over_uncommitted_local_edit() {
    let world = World::new();
    fs::write(world.peer.join("notes.md"), "from peer\n").unwrap();
    git(&world.peer, &["commit", "-q", "-am", "peer edit"]);
    git(&world.peer, &["push", "-q", "origin", "main"]);

    fs::write(world.vault.join("notes.md"), "local draft\n").unwrap();
    fs::write(world.vault.join("other.md"), "kept\n").unwrap();

    let report = world.engine().reconcile(25).unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.discarded, vec!["notes.md".to_string()]);
    assert!(report.committed);
    assert_eq!(
        fs::read_to_string(world.vault.join("notes.md")).unwrap(),
        "from peer\n"
    );
    assert_eq!(
        fs::read_to_string(world.vault.join("other.md")).unwrap(),
        "kept\n"
    );
    assert_eq!(git(&world.vault, &["log", "-1", "--format=%s"]), "Auto commit by ob");
}

#[test]
fn remote_wins_for_non_ascii_file_names() {
    let world = World::new();
    fs::write(world.peer.join("café.md"), "seed\n").unwrap();
    git(&world.peer, &["add", "-A"]);
    git(&world.peer, &["commit", "-q", "-m", "peer adds café"]);
    git(&world.peer, &["push", "-q", "origin", "main"]);
    let engine = world.engine();
    engine.reconcile(25).unwrap();

    fs::write(world.peer.join("café.md"), "from peer\n").unwrap();
    git(&world.peer, &["commit", "-q", "-am", "peer edit"]);
    git(&world.peer, &["push", "-q", "origin", "main"]);
    fs::write(world.vault.join("café.md"), "local draft\n").unwrap();

    let report = engine.reconcile(25).unwrap();
    assert_eq!(report.discarded, vec!["café.md".to_string()]);
    assert_eq!(
        fs::read_to_string(world.vault.join("café.md")).unwrap(),
        "from peer\n"
    );
}

#[test]
fn changed_paths_are_not_c_quoted() {
    let world = World::new();
    fs::write(world.vault.join("café.md"), "x\n").unwrap();
    fs::write(world.vault.join("a \"quoted\" name.md"), "y\n").unwrap();
    fs::write(world.vault.join("[draft].md"), "z\n").unwrap();

    let engine = world.engine();
    let remote = engine.config().remote.clone();
    let mut paths = Repository::new(engine.client(), &remote)
        .changed_paths()
        .unwrap();
    paths.sort();
    assert_eq!(paths, vec!["[draft].md", "a \"quoted\" name.md", "café.md"]);
}

#[test]
fn remote_delete_beats_committed_local_edit() {
    let world = World::new();
    world.commit_in_vault("notes.md", "local edit\n", "edit notes");
    git(&world.peer, &["rm", "-q", "notes.md"]);
    git(&world.peer, &["commit", "-q", "-m", "peer deletes"]);
    git(&world.peer, &["push", "-q", "origin", "main"]);
    let engine = world.engine();

    let report = engine.reconcile(25).unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.discarded, vec!["notes.md".to_string()]);
    assert!(!world.vault.join("notes.md").exists());
    assert!(!world.vault.join(".git/MERGE_HEAD").exists());

    assert!(!engine.settle().unwrap().committed);
    assert_eq!(engine.reconcile(0).unwrap().push, PushOutcome::Empty);
    assert_eq!(world.remote_subjects(), vec!["peer deletes", "initial"]);
    assert!(!world.vault.join("notes.md").exists());
}

#[test]
fn untracked_file_colliding_with_remote_file_is_replaced() {
    let world = World::new();
    fs::create_dir_all(world.peer.join("daily")).unwrap();
    fs::write(world.peer.join("daily/today.md"), "peer\n").unwrap();
    git(&world.peer, &["add", "-A"]);
    git(&world.peer, &["commit", "-q", "-m", "peer adds note"]);
    git(&world.peer, &["push", "-q", "origin", "main"]);

    fs::create_dir_all(world.vault.join("daily")).unwrap();
    fs::write(world.vault.join("daily/today.md"), "mine\n").unwrap();

    let report = world.engine().reconcile(25).unwrap();
    assert_eq!(report.discarded, vec!["daily/today.md".to_string()]);
    assert!(!report.committed);
    assert_eq!(
        fs::read_to_string(world.vault.join("daily/today.md")).unwrap(),
        "peer\n"
    );
}

#[test]
fn threshold_decides_between_deferring_and_pushing() {
    let world = World::new();
    for i in 0..3 {
        world.commit_in_vault("log.md", &format!("{i}\n"), "edit");
    }
    let engine = world.engine();

    assert_eq!(
        engine.reconcile(25).unwrap().push,
        PushOutcome::Deferred {
            ahead: 3,
            threshold: 25
        }
    );
    assert_eq!(world.remote_subjects(), vec!["initial"]);

    assert_eq!(
        engine.reconcile(0).unwrap().push,
        PushOutcome::Pushed {
            represented: 3,
            forced: false
        }
    );
    assert_eq!(
        world.remote_subjects(),
        vec!["Squashed 3 commits by ob", "initial"]
    );
}

#[test]
fn compaction_sums_pushed_markers_and_rewrites_remote() {
    let world = World::new();
    let engine = world.engine();
    world.commit_in_vault("a.md", "a\n", "Squashed 7 commits by ob");
    engine.reconcile(0).unwrap();
    world.commit_in_vault("b.md", "b\n", "one");
    world.commit_in_vault("c.md", "c\n", "two");
    world.commit_in_vault("d.md", "d\n", "three");
    engine.reconcile(0).unwrap();

    let report = engine.compact(2).unwrap();
    assert_eq!(report.represented, 10);
    assert_eq!(
        world.remote_subjects(),
        vec!["Squashed 10 commits by ob", "initial"]
    );
    assert!(world.vault.join("d.md").exists());
}

#[test]
fn status_reads_without_fetching() {
    let world = World::new();
    world.commit_in_vault("a.md", "a\n", "local");
    fs::write(world.vault.join("b.md"), "b\n").unwrap();

    let status = world.engine().status().unwrap();
    assert!(status.dirty);
    assert_eq!(status.ahead, 1);
    assert_eq!(status.remote, "origin/main");
    assert!(status.last_local_commit >= status.last_remote_commit);
}

#[test]
fn unreachable_remote_aborts_in_fetch() {
    let world = World::new();
    git(&world.vault, &["remote", "set-url", "origin", "/nonexistent/remote.git"]);
    fs::write(world.vault.join("draft.md"), "x\n").unwrap();

    let err = world.engine().reconcile(25).unwrap_err();
    assert_eq!(err.phase, CyclePhase::Fetching);
    assert!(!git(&world.vault, &["status", "--porcelain"]).is_empty());
}
