//! `ob start`, `ob stop`, `ob logs` and the hidden `ob daemon`: daemon lifecycle.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use ob_core::config::{load_at, save_at, VAULT_PATH_ENV};
use ob_core::{Config, ConfigError};
use ob_daemon::paths::{logs_dir, pid_path, stderr_log_path, stdout_log_path};
use ob_daemon::pidfile::remove_stale;
use ob_daemon::{request_status, request_stop, start_blocking, DaemonError};

use super::home_dir;

/// Arguments for `ob start`.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Path of the vault's git working copy.
    pub path: PathBuf,
}

impl StartArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;

        // Keep tuned settings from an earlier `ob start`.
        let base = match load_at(&home) {
            Ok(config) => config,
            Err(ConfigError::NotFound { .. }) => Config::new(&self.path),
            Err(err) => return Err(err).context("failed to read existing config"),
        };
        let config = Config {
            vault_path: self.path.clone(),
            ..base
        }
        .validate()
        .with_context(|| format!("cannot sync {}", self.path.display()))?;

        if let Ok(status) = request_status(&home) {
            bail!(
                "daemon already running (pid {}); run `ob stop` first",
                status["pid"]
            );
        }
        remove_stale(&pid_path(&home)).context("failed to clear stale pid file")?;

        let saved = save_at(&home, &config).context("failed to save config")?;

        let logs = logs_dir(&home);
        fs::create_dir_all(&logs).with_context(|| format!("create {}", logs.display()))?;
        let stderr_log = stderr_log_path(&home);
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_log)
            .with_context(|| format!("open {}", stderr_log.display()))?;

        let exe = std::env::current_exe().context("could not locate the ob executable")?;
        let stdout_log = stdout_log_path(&home);
        let mut child = Command::new(exe)
            .arg("daemon")
            .arg("--log-file")
            .arg(&stdout_log)
            .env(VAULT_PATH_ENV, &config.vault_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .context("failed to spawn daemon")?;

        for _ in 0..10 {
            if let Some(status) = child.try_wait().context("failed to poll daemon")? {
                bail!(
                    "daemon exited during startup ({status}); see {}",
                    stderr_log.display()
                );
            }
            if request_status(&home).is_ok() {
                break;
            }
            sleep(Duration::from_millis(100));
        }

        println!("{} daemon started", "✓".green().bold());
        println!("  pid     {}", child.id());
        println!("  vault   {}", config.vault_path.display());
        println!("  config  {}", saved.display());
        println!("  log     {}", stdout_log.display());
        Ok(())
    }
}

pub fn stop() -> Result<()> {
    let home = home_dir()?;
    match request_stop(&home) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => {
            println!("daemon is not running");
            if remove_stale(&pid_path(&home)).context("failed to clear stale pid file")? {
                println!("removed stale pid file");
            }
        }
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

/// Arguments for the hidden `ob daemon`.
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Append log output to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        start_blocking(&home, self.log_file).context("daemon exited with error")
    }
}

/// Arguments for `ob logs`.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only stderr log file.
    #[arg(long)]
    pub stderr_only: bool,
}

impl LogsArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        if !self.stderr_only {
            print_tail(&stdout_log_path(&home), self.lines)
                .context("failed to read daemon log")?;
        }
        print_tail(&stderr_log_path(&home), self.lines).context("failed to read daemon stderr log")
    }
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
