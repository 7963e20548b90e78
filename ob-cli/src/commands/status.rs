//! `ob status`: vault and daemon visibility.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use ob_core::config::load_at;
use ob_daemon::paths::socket_path;
use ob_daemon::{request_status, DaemonError};
use ob_sync::{Engine, EngineConfig, GitCli};

use super::home_dir;

/// Arguments for `ob status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    daemon: DaemonState,
    vault: Value,
    last_cycle: Value,
}

#[derive(Debug, Serialize)]
struct DaemonState {
    running: bool,
    pid: Option<u64>,
    started_at_unix: Option<u64>,
    in_flight: bool,
    /// Vault fields were read before the running cycle started.
    vault_cached: bool,
    socket: String,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "field")]
    field: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let socket = socket_path(&home).display().to_string();

        let report = match request_status(&home) {
            Ok(payload) => StatusReport {
                daemon: DaemonState {
                    running: true,
                    pid: payload["pid"].as_u64(),
                    started_at_unix: payload["started_at_unix"].as_u64(),
                    in_flight: payload["in_flight"].as_bool().unwrap_or(false),
                    vault_cached: payload["vault_cached"].as_bool().unwrap_or(false),
                    socket,
                },
                vault: payload["vault"].clone(),
                last_cycle: payload["last_cycle"].clone(),
            },
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let config = load_at(&home)?
                    .with_env_overrides()
                    .validate()
                    .context("invalid vault configuration")?;
                let engine = Engine::new(GitCli::new(&config.vault()), EngineConfig::from(&config));
                let vault = engine
                    .status()
                    .with_context(|| format!("failed to read {}", config.vault()))?;
                StatusReport {
                    daemon: DaemonState {
                        running: false,
                        pid: None,
                        started_at_unix: None,
                        in_flight: false,
                        vault_cached: false,
                        socket,
                    },
                    vault: serde_json::to_value(vault).context("failed to encode vault status")?,
                    last_cycle: Value::Null,
                }
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(&report);
        Ok(())
    }
}

fn print_table(report: &StatusReport) {
    let vault = &report.vault;
    let daemon = if report.daemon.running {
        let pid = report
            .daemon
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        let busy = if report.daemon.in_flight { ", syncing" } else { "" };
        format!("{} (pid {pid}{busy})", "running".green().bold())
    } else {
        "stopped".bright_black().bold().to_string()
    };
    let mut dirty = if vault.is_null() {
        "unknown".bright_black().to_string()
    } else if vault["dirty"].as_bool().unwrap_or(false) {
        "uncommitted changes".yellow().to_string()
    } else {
        "clean".green().to_string()
    };
    if report.daemon.vault_cached {
        dirty.push_str(" (before current cycle)");
    }

    let mut rows = vec![
        StatusRow {
            field: "vault",
            value: vault["vault"].as_str().unwrap_or("?").to_string(),
        },
        StatusRow {
            field: "daemon",
            value: daemon,
        },
        StatusRow {
            field: "working copy",
            value: dirty,
        },
        StatusRow {
            field: "commits ahead",
            value: vault["ahead"].to_string(),
        },
        StatusRow {
            field: "last local commit",
            value: describe_time(&vault["last_local_commit"]),
        },
        StatusRow {
            field: "last remote commit",
            value: format!(
                "{} ({})",
                describe_time(&vault["last_remote_commit"]),
                vault["remote"].as_str().unwrap_or("?")
            ),
        },
    ];
    if !report.last_cycle.is_null() {
        rows.push(StatusRow {
            field: "last cycle",
            value: describe_cycle(&report.last_cycle),
        });
    }

    println!("ob v{}", env!("CARGO_PKG_VERSION"));
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn describe_time(value: &Value) -> String {
    value
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| {
            let at = at.with_timezone(&Utc);
            format!("{} ({})", at.format("%Y-%m-%d %H:%M UTC"), format_age(at, Utc::now()))
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn describe_cycle(cycle: &Value) -> String {
    let trigger = cycle["trigger"].as_str().unwrap_or("?");
    let outcome = match cycle["outcome"]["outcome"].as_str() {
        Some("failed") => format!(
            "{} while {}",
            "failed".red().bold(),
            cycle["outcome"]["phase"].as_str().unwrap_or("?")
        ),
        Some(other) => other.green().to_string(),
        None => "?".to_string(),
    };
    let finished = cycle["finished_at_unix"]
        .as_i64()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|at| format_age(at, Utc::now()))
        .unwrap_or_else(|| "?".to_string());
    format!("{trigger}: {outcome} ({finished})")
}

/// Coarse "N units ago" rendering.
fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let (n, unit) = match secs {
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s => (s / 86_400, "day"),
    };
    let plural = if n == 1 { "" } else { "s" };
    format!("{n} {unit}{plural} ago")
}
