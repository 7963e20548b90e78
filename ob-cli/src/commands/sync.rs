//! `ob sync` and `ob squash`: user-requested cycles.
//!
//! Both go through the daemon when it is running, so they queue behind its
//! single-flight guard like any other trigger. Without a daemon the cycle runs
//! in this process.

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use ob_core::config::load_at;
use ob_daemon::{init_tracing, request_squash, request_sync, DaemonError, Scheduler};
use ob_daemon::{Trigger, TriggerOutcome};
use ob_sync::{Engine, EngineConfig, GitCli};

use super::home_dir;

/// Arguments for `ob sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Emit the cycle report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let report = match request_sync(&home) {
            Ok(report) => report,
            Err(DaemonError::DaemonNotRunning { .. }) => run_in_process(Trigger::Manual)?,
            Err(DaemonError::Protocol(message)) => bail!("sync failed: {message}"),
            Err(err) => return Err(err).context("failed to reach daemon"),
        };

        if self.json {
            print_json(&report)?;
        } else {
            println!("{}", "Manual sync completed".green().bold());
            print_cycle(&report);
        }
        Ok(())
    }
}

/// Arguments for `ob squash`.
#[derive(Args, Debug)]
pub struct SquashArgs {
    /// Number of most recent commits to replace with one.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    pub commits: u64,

    /// Emit the compaction report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SquashArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let report = match request_squash(&home, self.commits) {
            Ok(report) => report,
            Err(DaemonError::DaemonNotRunning { .. }) => run_in_process(Trigger::Compact {
                commits: self.commits,
            })?,
            Err(DaemonError::Protocol(message)) => bail!("squash failed: {message}"),
            Err(err) => return Err(err).context("failed to reach daemon"),
        };

        if self.json {
            return print_json(&report);
        }
        print_cycle(&report["flush"]);
        println!(
            "{} squashed {} commit(s) standing for {} commit(s) and force-pushed",
            "✓".green().bold(),
            report["replaced"],
            report["represented"],
        );
        Ok(())
    }
}

fn run_in_process(trigger: Trigger) -> Result<Value> {
    init_tracing(None);
    let home = home_dir()?;
    let config = load_at(&home)?
        .with_env_overrides()
        .validate()
        .context("invalid vault configuration")?;
    let engine = Engine::new(GitCli::new(&config.vault()), EngineConfig::from(&config));

    match Scheduler::new(engine).run_now(trigger) {
        TriggerOutcome::Skipped => bail!("a cycle is already running for this vault"),
        TriggerOutcome::Failed { error, .. } => Err(anyhow!(error)),
        outcome => serde_json::to_value(&outcome).context("failed to encode cycle report"),
    }
}

fn print_json(report: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(report).context("failed to render report JSON")?
    );
    Ok(())
}

/// One line per thing the cycle did.
fn print_cycle(report: &Value) {
    let merged = report["merged"].as_u64().unwrap_or(0);
    if merged > 0 {
        println!("  merged {merged} remote commit(s)");
    }
    if let Some(paths) = report["discarded"].as_array().filter(|p| !p.is_empty()) {
        let names: Vec<&str> = paths.iter().filter_map(Value::as_str).collect();
        println!(
            "  {} remote won over local edits to {}",
            "!".yellow().bold(),
            names.join(", ")
        );
    }
    if report["committed"].as_bool().unwrap_or(false) {
        println!("  committed pending changes");
    }
    let push = &report["push"];
    match push["result"].as_str() {
        Some("pushed") => println!(
            "  pushed 1 commit standing for {} commit(s)",
            push["represented"]
        ),
        Some("deferred") => println!(
            "  {} local commit(s) held back until {}",
            push["ahead"], push["threshold"]
        ),
        Some("empty") => println!("  local commits cancelled out, nothing to push"),
        Some("up_to_date") => println!("  remote already up to date"),
        _ => {}
    }
}
