//! Displayed status from the run record, marker files and log text.
//!
//! `resolve` is the whole decision and is pure. `Reconciler` gathers its
//! inputs from disk, writes corrections back to the store and stops runs
//! whose logs show a hard failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use genepipe_common::{RunStatus, RunView};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::cancel::{locate_script, request_cancel, terminate_tree};
use super::layout::{Marker, Markers, RunLayout};
use super::log_scan::{FailureDetector, LogSignals, read_tail, scan};
use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::store::StoreHandle;

pub const AUTO_TERMINATE_NOTE: &str =
    "[SYSTEM] Auto-terminated pipeline due to detected error in logs.";

/// Which input decided the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Record,
    Marker,
    LogSentinel,
    LogFailure,
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    pub markers: Markers,
    pub log: LogSignals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: RunStatus,
    pub source: StatusSource,
    /// Status to write back because the record disagrees.
    pub heal: Option<RunStatus>,
    /// Failure line that should stop the run.
    pub auto_terminate: Option<String>,
}

/// Precedence: terminal record, then markers (done, cancel, abort), then log
/// sentinels, then the record's own non-terminal status (`running` when
/// there is no record). A running run whose log shows a hard failure
/// resolves to `failed`.
pub fn resolve(stored: Option<RunStatus>, evidence: &Evidence) -> Resolution {
    if let Some(status) = stored.filter(RunStatus::is_terminal) {
        return Resolution {
            status,
            source: StatusSource::Record,
            heal: None,
            auto_terminate: None,
        };
    }

    let markers = evidence.markers;
    let log = &evidence.log;
    let (mut status, mut source) = if markers.done {
        (RunStatus::Completed, StatusSource::Marker)
    } else if markers.cancel {
        (RunStatus::Cancelled, StatusSource::Marker)
    } else if markers.aborted {
        (RunStatus::Failed, StatusSource::Marker)
    } else if log.finished {
        (RunStatus::Completed, StatusSource::LogSentinel)
    } else if log.cancelled {
        (RunStatus::Cancelled, StatusSource::LogSentinel)
    } else {
        (stored.unwrap_or(RunStatus::Running), StatusSource::Default)
    };

    let mut auto_terminate = None;
    if status == RunStatus::Running
        && let Some(line) = &log.failure
    {
        status = RunStatus::Failed;
        source = StatusSource::LogFailure;
        auto_terminate = Some(line.clone());
    }

    let heal = match stored {
        Some(current) if current != status => Some(status),
        _ => None,
    };

    Resolution {
        status,
        source,
        heal,
        auto_terminate,
    }
}

pub struct Reconciler {
    store: StoreHandle,
    detector: Arc<dyn FailureDetector>,
    audit: AuditLog,
    tail_bytes: u64,
    kill_grace: Duration,
}

impl Reconciler {
    pub fn new(
        store: StoreHandle,
        detector: Arc<dyn FailureDetector>,
        audit: AuditLog,
        tail_bytes: u64,
        kill_grace: Duration,
    ) -> Self {
        Self {
            store,
            detector,
            audit,
            tail_bytes,
            kill_grace,
        }
    }

    /// Collect evidence for a non-terminal run.
    pub async fn evidence(&self, layout: &RunLayout) -> Result<Evidence> {
        let markers = layout.markers();
        if markers.done || markers.cancel || markers.aborted {
            return Ok(Evidence {
                markers,
                log: LogSignals::default(),
            });
        }
        let log_path = layout.log_path();
        let log = match read_tail(&log_path, self.tail_bytes)
            .await
            .with_context(|| format!("Failed to read {}", log_path.display()))?
        {
            Some(text) => scan(&text, layout.run_type(), self.detector.as_ref()),
            None => LogSignals::default(),
        };
        Ok(Evidence { markers, log })
    }

    /// Resolve the status of `view` and apply any correction.
    ///
    /// Synthetic runs are resolved but never written to the store.
    pub async fn reconcile(&self, view: &RunView, layout: &RunLayout) -> Result<Resolution> {
        let stored = view.stored_status();
        if stored.is_some_and(|s| s.is_terminal()) {
            return Ok(resolve(stored, &Evidence::default()));
        }

        let evidence = self.evidence(layout).await?;
        let mut resolution = resolve(stored, &evidence);
        let run_id = view.run_id().to_string();

        if let (Some(status), Some(from), RunView::Stored(_)) = (resolution.heal, stored, view) {
            let end_time = status.is_terminal().then(Utc::now);
            let id = run_id.clone();
            let healed = self
                .store
                .call(move |s| s.transition(&id, from, status, end_time))
                .await
                .with_context(|| format!("Failed to heal status of run {}", run_id))?;
            if !healed {
                // Another writer (usually the supervisor) moved the record
                // since `view` was read; its write stands.
                let id = run_id.clone();
                let current = self
                    .store
                    .call(move |s| s.get_run(&id))
                    .await
                    .with_context(|| format!("Failed to re-read run {}", run_id))?;
                tracing::debug!(%run_id, "Heal skipped; record changed concurrently");
                return Ok(match current {
                    Some(record) if record.status.is_terminal() => {
                        resolve(Some(record.status), &Evidence::default())
                    }
                    _ => Resolution {
                        heal: None,
                        auto_terminate: None,
                        ..resolution
                    },
                });
            }

            let kind = if resolution.auto_terminate.is_some() {
                AuditKind::AutoTerminated
            } else {
                AuditKind::DriftHealed
            };
            let detail = resolution
                .auto_terminate
                .clone()
                .unwrap_or_else(|| format!("{:?}", resolution.source));
            if let Err(e) = self
                .audit
                .record(&AuditEntry::new(kind, &run_id, stored, status, detail))
                .await
            {
                tracing::warn!(%run_id, "Failed to write audit entry: {:#}", e);
            }
        }

        if let Some(line) = resolution.auto_terminate.take() {
            self.auto_terminate(&run_id, layout, &line).await?;
            resolution.auto_terminate = Some(line);
        }

        Ok(resolution)
    }

    /// Ask the script to stop, mark the run aborted, note why in its log,
    /// and stop its processes in the background.
    async fn auto_terminate(&self, run_id: &str, layout: &RunLayout, line: &str) -> Result<()> {
        tracing::warn!(%run_id, failure = %line, "Error detected in run log; terminating");

        // The script's own cancel path stops it even when no process can be
        // located from here.
        request_cancel(layout)?;
        layout
            .write_marker(Marker::Aborted)
            .context("Failed to write abort marker")?;

        let log_path = layout.log_path();
        let already_noted = tokio::fs::read_to_string(&log_path)
            .await
            .map(|t| t.contains(AUTO_TERMINATE_NOTE))
            .unwrap_or(false);
        if !already_noted {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
                .with_context(|| format!("Failed to open {}", log_path.display()))?;
            file.write_all(format!("\n\n{}\n", AUTO_TERMINATE_NOTE).as_bytes())
                .await
                .context("Failed to append auto-termination note")?;
        }

        if let Some(pid) = locate_script(layout) {
            let grace = self.kill_grace;
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = terminate_tree(pid, grace).await {
                    tracing::error!(%run_id, pid, "Auto-termination failed: {}", e);
                }
            });
        }
        Ok(())
    }
}
