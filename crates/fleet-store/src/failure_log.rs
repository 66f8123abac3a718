//! Append-only log of auto-disable events (`failed_servers.log`).
//!
//! One line per event so operators can grep it and support tooling can tail
//! it without parsing JSON.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use fleet_core::ErrorKind;

const FILE_NAME: &str = "failed_servers.log";

#[derive(Debug, Clone)]
pub struct FailureLogEntry {
    pub timestamp: DateTime<Utc>,
    pub server: String,
    pub error_kind: ErrorKind,
    pub consecutive_failures: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub suggestions: Vec<String>,
}

impl FailureLogEntry {
    /// Render as a single line; embedded newlines are flattened so the log
    /// stays one-event-per-line.
    fn format_line(&self) -> String {
        let first_failure = self
            .first_failure_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let last_error = self.last_error.replace(['\n', '\r'], " ");
        let suggestions = if self.suggestions.is_empty() {
            "-".to_string()
        } else {
            self.suggestions.join("; ").replace(['\n', '\r'], " ")
        };
        format!(
            "{} server={} class={} count={} first_failure={} last_error=\"{}\" suggestions=\"{}\"",
            self.timestamp.to_rfc3339(),
            self.server,
            self.error_kind,
            self.consecutive_failures,
            first_failure,
            last_error,
            suggestions,
        )
    }
}

#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &FailureLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create failure log dir: {}", parent.display())
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open failure log: {}", self.path.display()))?;
        file.write_all(format!("{}\n", entry.format_line()).as_bytes())
            .await
            .with_context(|| format!("Failed to append failure log: {}", self.path.display()))?;
        file.flush().await.context("Failed to flush failure log")?;
        Ok(())
    }

    /// Last `n` lines, oldest first. Empty when the log does not exist yet.
    pub async fn tail(&self, n: usize) -> Result<Vec<String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read failure log: {}", self.path.display())
                });
            }
        };
        let lines: Vec<String> = raw.lines().map(str::to_string).collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].to_vec())
    }
}
