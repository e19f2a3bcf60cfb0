//! Filesystem tools over the target snapshot: file reads and code search.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::ToolError;

/// Cap on file content returned to the model.
pub const READ_FILE_MAX_CHARS: usize = 50_000;
/// Cap on search output returned to the model.
pub const SEARCH_OUTPUT_MAX_CHARS: usize = 10_000;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Extensions included in code search.
const SEARCH_INCLUDE: &[&str] = &[
    "*.py", "*.js", "*.ts", "*.go", "*.c", "*.cpp", "*.java", "*.rs", "*.rb", "*.php", "*.sol",
    "*.yaml", "*.yml", "*.json", "*.toml", "*.cfg", "*.ini", "*.env", "*.sh", "*.bash",
    "*.dockerfile", "Makefile", "*.html", "*.xml",
];

/// Resolve a model-supplied path against the snapshot root, rejecting
/// absolute paths and traversal.
fn resolve(snapshot_dir: &Path, path: &str) -> Result<PathBuf, ToolError> {
    let relative = Path::new(path);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::InvalidParameters(format!(
            "path must be relative to the repository root: {path}"
        )));
    }
    Ok(snapshot_dir.join(relative))
}

/// Read a file from the snapshot, truncated to the content cap.
///
/// Returns `(content, total_lines)`. Missing or unreadable files are the
/// caller's error string, not a fatal failure.
pub async fn read_file(snapshot_dir: &Path, path: &str) -> Result<(String, usize), ToolError> {
    let abs = resolve(snapshot_dir, path)?;
    let content = tokio::fs::read_to_string(&abs)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("Error reading file: {e}")))?;

    let lines = content.lines().count();
    let truncated: String = content.chars().take(READ_FILE_MAX_CHARS).collect();
    Ok((truncated, lines))
}

/// Recursive text search over the snapshot, restricted to the extension
/// allow-list, output capped.
pub async fn search_code(snapshot_dir: &Path, pattern: &str) -> Result<String, ToolError> {
    let mut cmd = tokio::process::Command::new("grep");
    cmd.arg("-rn");
    for glob in SEARCH_INCLUDE {
        cmd.arg(format!("--include={glob}"));
    }
    // Options must precede `--`; everything after it is an operand.
    cmd.arg("--").arg(pattern).arg(snapshot_dir);
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());

    let output = tokio::time::timeout(SEARCH_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ToolError::Timeout(SEARCH_TIMEOUT))?
        .map_err(|e| ToolError::ExecutionFailed(format!("grep failed to start: {e}")))?;

    // grep exits 1 on "no matches", which is a valid result.
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return Ok("No matches found.".to_string());
    }
    Ok(stdout.chars().take(SEARCH_OUTPUT_MAX_CHARS).collect())
}

/// Read an inclusive 1-based line range, for evidence snippet backfill.
pub async fn read_line_range(
    snapshot_dir: &Path,
    path: &str,
    start: usize,
    end: usize,
) -> Result<String, ToolError> {
    let abs = resolve(snapshot_dir, path)?;
    let content = tokio::fs::read_to_string(&abs)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("Error reading file: {e}")))?;

    let snippet: Vec<&str> = content
        .lines()
        .skip(start.saturating_sub(1))
        .take(end.saturating_sub(start) + 1)
        .collect();
    if snippet.is_empty() {
        return Err(ToolError::ExecutionFailed(format!(
            "{path} has no lines in range {start}-{end}"
        )));
    }
    Ok(snippet.join("\n"))
}
