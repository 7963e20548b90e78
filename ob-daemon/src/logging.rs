//! Subscriber setup for the daemon and the CLI.
//!
//! `ob-sync` logs through the `log` facade; `tracing-subscriber` bridges those
//! records into the same output.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
///
/// With `log_file` every event is appended to that path, reopening it each
/// time so a rotated file is picked up; if it cannot be opened the event goes
/// to stderr instead.
pub fn init_tracing(log_file: Option<PathBuf>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    let _ = match log_file {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(move || -> Box<dyn Write> {
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => Box::new(file),
                    Err(_) => Box::new(io::stderr()),
                }
            })
            .try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
}
