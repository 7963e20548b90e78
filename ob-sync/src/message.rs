//! Commit messages written by the engine, and the parser for squash markers.
//!
//! A squash marker's embedded count is the only record of how many original
//! commits a synthetic commit stands for, so encoding and decoding live here
//! together:
//!
//! ```text
//! Auto commit by ob
//! Squashed <count> commits by ob
//! ```

const AUTO_COMMIT: &str = "Auto commit by ob";
const SQUASH_PREFIX: &str = "Squashed";
const SQUASH_SUFFIX: [&str; 3] = ["commits", "by", "ob"];

/// Message of the commit that wraps pending working-copy changes.
pub fn auto_commit_message() -> &'static str {
    AUTO_COMMIT
}

/// Message of a commit that replaces `count` original commits.
pub fn squash_message(count: u64) -> String {
    format!("{SQUASH_PREFIX} {count} {}", SQUASH_SUFFIX.join(" "))
}

/// Embedded count of a squash marker.
///
/// Accepts a bare subject or a `git log --oneline` line (`<hash> <subject>`).
/// Returns `None` for anything else, including the older count-less
/// `Squashed commits by ob` form.
pub fn parse_squash_count(line: &str) -> Option<u64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens.windows(5).find_map(|w| {
        if w[0] != SQUASH_PREFIX || w[2..] != SQUASH_SUFFIX {
            return None;
        }
        w[1].parse::<u64>().ok()
    })
}

/// Number of original commits a list of log lines stands for: markers
/// contribute their embedded count, every other commit counts once.
pub fn represented_commits<S: AsRef<str>>(lines: &[S]) -> u64 {
    lines
        .iter()
        .map(|line| parse_squash_count(line.as_ref()).unwrap_or(1))
        .sum()
}
