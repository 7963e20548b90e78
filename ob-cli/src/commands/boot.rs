//! `ob boot`: systemd user service that starts the daemon at login.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use ob_core::config::load_at;
use ob_daemon::paths::stdout_log_path;
use ob_daemon::systemd;
use ob_daemon::{install_service, uninstall_service, UnitSpec};

use super::home_dir;

#[derive(Subcommand, Debug)]
pub enum BootCommand {
    /// Install and enable the user service for the configured vault.
    Enable,
    /// Disable and remove the user service.
    Disable,
    /// Show whether the service is installed, enabled and active.
    Status,
}

pub fn run(command: BootCommand) -> Result<()> {
    let home = home_dir()?;
    match command {
        BootCommand::Enable => {
            let config = load_at(&home)?
                .with_env_overrides()
                .validate()
                .context("invalid vault configuration")?;
            let service = UnitSpec {
                binary: std::env::current_exe().context("could not locate the ob executable")?,
                vault: config.vault_path.clone(),
                log_file: stdout_log_path(&home),
                ssh_auth_sock: std::env::var("SSH_AUTH_SOCK").ok(),
            };
            let unit = install_service(&home, &service).context("failed to enable boot service")?;
            println!("{} boot service enabled", "✓".green().bold());
            println!("  unit    {}", unit.display());
            println!("  vault   {}", service.vault.display());
        }
        BootCommand::Disable => {
            uninstall_service(&home).context("failed to disable boot service")?;
            println!("{} boot service disabled", "✓".green().bold());
        }
        BootCommand::Status => {
            let status = systemd::status(&home).context("failed to query boot service")?;
            if !status.installed {
                println!("boot service not installed");
                return Ok(());
            }
            let yes_no = |flag: bool| if flag { "yes".green() } else { "no".red() };
            println!("unit      {}", status.unit.display());
            println!("enabled   {}", yes_no(status.enabled));
            println!("active    {}", yes_no(status.active));
        }
    }
    Ok(())
}
