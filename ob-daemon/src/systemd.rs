//! systemd user unit that starts the daemon at login/boot.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

use crate::error::{io_err, DaemonError};
use crate::paths::{logs_dir, systemd_unit_path, systemd_user_dir, SERVICE_NAME};

/// Values baked into the unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub binary: PathBuf,
    pub vault: PathBuf,
    pub log_file: PathBuf,
    /// Agent socket to forward so `git` can authenticate over ssh.
    pub ssh_auth_sock: Option<String>,
}

/// Render the unit.
pub fn generate_unit(service: &UnitSpec) -> String {
    let mut environment = format!("Environment=\"VAULT_PATH={}\"\n", service.vault.display());
    if let Some(sock) = service.ssh_auth_sock.as_deref().filter(|s| !s.is_empty()) {
        environment.push_str(&format!("Environment=\"SSH_AUTH_SOCK={sock}\"\n"));
    }

    format!(
        "[Unit]
Description=ob vault sync daemon
Wants=network-online.target
After=network-online.target

[Service]
Type=simple
ExecStart={binary} daemon --log-file {log_file}
{environment}Restart=on-failure
RestartSec=10

[Install]
WantedBy=default.target
",
        binary = service.binary.display(),
        log_file = service.log_file.display(),
        environment = environment,
    )
}

/// Installed and enabled state as reported by the unit file and `systemctl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub unit: PathBuf,
    pub installed: bool,
    pub enabled: bool,
    pub active: bool,
}

/// Write the unit and `enable --now` it.
pub fn install(home: &Path, service: &UnitSpec) -> Result<PathBuf, DaemonError> {
    ensure_linux()?;

    let dir = systemd_user_dir(home);
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let logs = logs_dir(home);
    fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;

    let unit = systemd_unit_path(home);
    fs::write(&unit, generate_unit(service)).map_err(|e| io_err(&unit, e))?;

    run_systemctl(&["daemon-reload"], false)?;
    run_systemctl(&["enable", "--now", SERVICE_NAME], false)?;
    Ok(unit)
}

/// `disable --now` the unit and delete it. Missing units are not an error.
pub fn uninstall(home: &Path) -> Result<(), DaemonError> {
    ensure_linux()?;

    let unit = systemd_unit_path(home);
    if unit.exists() {
        run_systemctl(&["disable", "--now", SERVICE_NAME], true)?;
        fs::remove_file(&unit).map_err(|e| io_err(&unit, e))?;
        run_systemctl(&["daemon-reload"], true)?;
    }
    Ok(())
}

pub fn status(home: &Path) -> Result<ServiceStatus, DaemonError> {
    let unit = systemd_unit_path(home);
    let installed = unit.exists();
    let (enabled, active) = if installed && cfg!(target_os = "linux") {
        (
            systemctl_query("is-enabled")?,
            systemctl_query("is-active")?,
        )
    } else {
        (false, false)
    };
    Ok(ServiceStatus {
        unit,
        installed,
        enabled,
        active,
    })
}

#[cfg(target_os = "linux")]
fn ensure_linux() -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ensure_linux() -> Result<(), DaemonError> {
    Err(DaemonError::Service(
        "boot service management requires systemd (Linux)".to_string(),
    ))
}

fn run_systemctl(args: &[&str], ignore_failure: bool) -> Result<(), DaemonError> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .output()
        .map_err(|e| io_err("systemctl", e))?;

    if output.status.success() || ignore_failure {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(DaemonError::Service(format!(
        "systemctl --user {} failed ({}): {}",
        args.join(" "),
        output.status,
        stderr
    )))
}

/// `is-enabled` / `is-active` answer through the exit status.
fn systemctl_query(verb: &str) -> Result<bool, DaemonError> {
    let output = Command::new("systemctl")
        .args(["--user", verb, SERVICE_NAME])
        .output()
        .map_err(|e| io_err("systemctl", e))?;
    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> UnitSpec {
        UnitSpec {
            binary: PathBuf::from("/usr/local/bin/ob"),
            vault: PathBuf::from("/home/alex/vault"),
            log_file: PathBuf::from("/home/alex/.config/ob/logs/daemon.log"),
            ssh_auth_sock: Some("/run/user/1000/ssh-agent.socket".to_string()),
        }
    }

    #[test]
    fn unit_runs_daemon_with_vault_environment() {
        let unit = generate_unit(&service());
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/ob daemon --log-file /home/alex/.config/ob/logs/daemon.log"
        ));
        assert!(unit.contains("Environment=\"VAULT_PATH=/home/alex/vault\""));
        assert!(unit.contains("Environment=\"SSH_AUTH_SOCK=/run/user/1000/ssh-agent.socket\""));
        assert!(unit.contains("Restart=on-failure"));
        assert!(unit.contains("After=network-online.target"));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[test]
    fn unit_without_agent_omits_ssh_auth_sock() {
        let mut service = service();
        service.ssh_auth_sock = None;
        assert!(!generate_unit(&service).contains("SSH_AUTH_SOCK"));
    }

    #[test]
    fn status_without_unit_is_not_installed() {
        let home = TempDir::new().unwrap();
        let status = status(home.path()).unwrap();
        assert!(!status.installed);
        assert!(!status.enabled);
        assert_eq!(status.unit, systemd_unit_path(home.path()));
    }
}
