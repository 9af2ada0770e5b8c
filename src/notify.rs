//! Run lifecycle notifications.
//!
//! The engine reports "run started" and "run finished" through a `Notifier`.
//! Delivery is best effort: `dispatch` logs failures and never lets them
//! change a run's outcome.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use genepipe_common::{RunStatus, RunType};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        owner: String,
        run_type: RunType,
    },
    RunFinished {
        run_id: String,
        owner: String,
        run_type: RunType,
        status: RunStatus,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. } | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self {
            Self::RunStarted { .. } => None,
            Self::RunFinished { status, .. } => Some(*status),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &RunEvent) -> Result<()>;
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<()> {
        match event {
            RunEvent::RunStarted {
                run_id,
                owner,
                run_type,
            } => tracing::info!(%run_id, %owner, %run_type, "Run started"),
            RunEvent::RunFinished {
                run_id,
                owner,
                run_type,
                status,
            } => tracing::info!(%run_id, %owner, %run_type, %status, "Run finished"),
        }
        Ok(())
    }
}

/// Runs a shell command per event with the event JSON on stdin.
///
/// The command sees `GENEPIPE_EVENT`, `GENEPIPE_RUN_ID` and `GENEPIPE_STATUS`
/// in its environment and is killed after `timeout`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("Failed to serialize run event")?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env("GENEPIPE_EVENT", event.name())
            .env("GENEPIPE_RUN_ID", event.run_id())
            .env(
                "GENEPIPE_STATUS",
                event.status().map(|s| s.as_str()).unwrap_or(""),
            )
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn notify command: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores stdin may close it early; that is fine.
            let _ = stdin.write_all(payload.as_bytes()).await;
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for notify command")?,
            Err(_) => anyhow::bail!(
                "Notify command timed out after {}s",
                self.timeout.as_secs()
            ),
        };
        if !output.status.success() {
            anyhow::bail!(
                "Notify command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Deliver `event`, logging instead of propagating any failure.
pub async fn dispatch(notifier: &dyn Notifier, event: RunEvent) {
    if let Err(e) = notifier.notify(&event).await {
        tracing::warn!(run_id = %event.run_id(), event = event.name(), "Notification failed: {:#}", e);
    }
}
