//! One-shot external command execution.

use std::process::Command;

use crate::error::SyncError;

/// Run `program` with `args` once and wait for it.
///
/// On success returns the non-empty lines of standard output in order (no
/// output yields an empty `Vec`). On a nonzero exit returns
/// [`SyncError::Command`] with standard error verbatim; standard output is
/// dropped in that case.
pub fn run_command<S: AsRef<str>>(program: &str, args: &[S]) -> Result<Vec<String>, SyncError> {
    Ok(split_lines(&capture(program, args)?))
}

/// Like [`run_command`] for `-z` output: records are split on NUL and kept
/// verbatim, so paths with spaces, quotes or non-ASCII names survive.
pub fn run_command_nul<S: AsRef<str>>(
    program: &str,
    args: &[S],
) -> Result<Vec<String>, SyncError> {
    Ok(split_nul(&capture(program, args)?))
}

fn capture<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, SyncError> {
    let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    tracing::debug!("running: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|source| SyncError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SyncError::Command {
            program: program.to_string(),
            args,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn split_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn split_nul(stdout: &str) -> Vec<String> {
    stdout
        .split('\0')
        .filter(|record| !record.is_empty())
        .map(str::to_string)
        .collect()
}
