//! ob keeps a git-backed notes vault in sync with its remote, unattended.
//!
//! # Usage
//!
//! ```text
//! ob start <vault-path>
//! ob stop
//! ob status [--json]
//! ob sync [--json]
//! ob squash <commits> [--json]
//! ob logs [--lines N] [--stderr-only]
//! ob boot enable|disable|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    boot::BootCommand,
    daemon::{DaemonArgs, LogsArgs, StartArgs},
    status::StatusArgs,
    sync::{SquashArgs, SyncArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ob",
    version,
    about = "Unattended git sync for a notes vault",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save the vault path and start the background daemon.
    Start(StartArgs),

    /// Ask the running daemon to shut down.
    Stop,

    /// Show vault and daemon state.
    Status(StatusArgs),

    /// Run a full sync now, pushing whatever is pending.
    Sync(SyncArgs),

    /// Squash the last N commits into one and force-push.
    Squash(SquashArgs),

    /// Print recent daemon log lines.
    Logs(LogsArgs),

    /// Manage the systemd user service that starts the daemon at boot.
    Boot {
        #[command(subcommand)]
        command: BootCommand,
    },

    /// Run the daemon in the foreground.
    #[command(hide = true)]
    Daemon(DaemonArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => args.run(),
        Commands::Stop => commands::daemon::stop(),
        Commands::Status(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Squash(args) => args.run(),
        Commands::Logs(args) => args.run(),
        Commands::Boot { command } => commands::boot::run(command),
        Commands::Daemon(args) => args.run(),
    }
}
