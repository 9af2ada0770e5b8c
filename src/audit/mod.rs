//! Append-only audit trail of status corrections.
//!
//! One JSON object per line in `<runs_dir>/audit.jsonl`. Every entry is also
//! emitted as a `tracing` event under the `genepipe::audit` target.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use genepipe_common::RunStatus;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// The stored status disagreed with on-disk evidence and was rewritten.
    DriftHealed,
    /// The log showed a hard failure and the run was stopped.
    AutoTerminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub run_id: String,
    pub from: Option<RunStatus>,
    pub to: RunStatus,
    /// Evidence that triggered the entry.
    pub detail: String,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        run_id: &str,
        from: Option<RunStatus>,
        to: RunStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            run_id: run_id.to_string(),
            from,
            to,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    /// Entries go to tracing only.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn record(&self, entry: &AuditEntry) -> Result<()> {
        tracing::info!(
            target: "genepipe::audit",
            run_id = %entry.run_id,
            kind = ?entry.kind,
            from = ?entry.from,
            to = %entry.to,
            detail = %entry.detail,
            "Run status corrected"
        );

        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write audit entry")?;
        file.flush().await.context("Failed to flush audit log")?;
        Ok(())
    }

    /// All entries recorded so far.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Failed to parse audit entry"))
            .collect()
    }
}
