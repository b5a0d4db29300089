//! Execution-failure diagnostics.
//!
//! The compiler never executes queries; the job layer that does calls in
//! here to pin a backend error message to a line and column and to persist
//! the failing SQL for inspection.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::error::Error;

/// `[line:col]`, the duckdb-style position tag.
static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+):(\d+)\]").expect("location regex is valid"));

/// `LINE n` / `line n, column m`, the postgres-style position tag.
static LINE_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)line\s+(\d+)\s*,\s*column\s+(\d+)").expect("location regex is valid")
});

/// `at character n`, column-only.
static AT_CHARACTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)at character\s+(\d+)").expect("location regex is valid"));

/// Pull a `(line, column)` position out of a backend error message. The
/// column-only `at character` form reports line 1.
pub fn extract_error_location(message: &str) -> Option<(u32, u32)> {
    let pair = |caps: regex::Captures| {
        let line = caps.get(1)?.as_str().parse().ok()?;
        let column = caps.get(2)?.as_str().parse().ok()?;
        Some((line, column))
    };
    if let Some(caps) = BRACKETED.captures(message) {
        return pair(caps);
    }
    if let Some(caps) = LINE_COLUMN.captures(message) {
        return pair(caps);
    }
    if let Some(caps) = AT_CHARACTER.captures(message) {
        let column = caps.get(1)?.as_str().parse().ok()?;
        return Some((1, column));
    }
    None
}

/// Build an `Execution` error with whatever position the message carries.
pub fn execution_error(message: impl Into<String>) -> Error {
    let message = message.into();
    let location = extract_error_location(&message);
    Error::Execution {
        message,
        line: location.map(|(line, _)| line),
        column: location.map(|(_, column)| column),
    }
}

/// Persist a failing query next to its error text and return the path.
/// The dump is plain SQL with the error as trailing comment lines, so it
/// pastes straight into a console.
pub fn write_failed_query(
    dir: &Path,
    name: &str,
    sql: &str,
    error: &str,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}.sql"));
    let mut file = fs::File::create(&path)?;
    writeln!(file, "{sql}")?;
    writeln!(file)?;
    for line in error.lines() {
        writeln!(file, "-- {line}")?;
    }
    info!(path = %path.display(), "wrote failed query dump");
    Ok(path)
}
