//! The orchestration facade used by the CLI.
//!
//! `Engine` owns the store, the supervisor and the reconciler and exposes the
//! run lifecycle: submit, status, logs, cancel, list and delete. Every read
//! goes through the reconciler, so callers always see a healed status.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use genepipe_common::{
    RunStatus, RunStore, RunType, RunView, SyntheticRun, is_valid_run_id, new_blast_run_id,
    new_pipeline_run_id, safe_owner,
};
use serde::Serialize;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::errors::{CancelError, EngineError};
use crate::notify::{CommandNotifier, LogNotifier, Notifier};
use crate::pipeline::{BlastParams, ExecutionPlan, ToolSelection, compose, compose_blast, materialize};
use crate::run::cancel::{CancelState, Termination, locate_script, request_cancel, terminate_tree};
use crate::run::layout::{Marker, RunLayout};
use crate::run::log_scan::{KeywordDetector, read_log, strip_ansi};
use crate::run::reconcile::{Reconciler, StatusSource};
use crate::run::supervisor::{RunHandle, Supervisor, SupervisorSettings};
use crate::store::{SqliteRunStore, StoreHandle};

pub const WAITING_MESSAGE: &str = "Waiting for pipeline to start...";

/// Extra wait on top of poll interval and grace before a graceful cancel
/// escalates.
const GRACEFUL_MARGIN: Duration = Duration::from_secs(2);

/// A launched run.
pub struct Submission {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub plan: ExecutionPlan,
    pub handle: RunHandle,
}

/// Reconciled view of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub owner: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub source: StatusSource,
    pub synthetic: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_dir: PathBuf,
    pub cancel_state: CancelState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Write the cancel marker and let the script stop itself.
    Cooperative,
    /// Cooperative first; force-kill if the script has not stopped in time.
    Graceful,
    /// Signal the process tree immediately.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Nothing to do; the run had already finished.
    AlreadyTerminal { status: RunStatus },
    /// The marker is in place; the script stops at its next poll.
    Requested,
    /// The script stopped on its own within the grace period.
    Stopped,
    Terminated { termination: Termination },
    /// Marker written but no live script process was found.
    NoProcess,
}

pub struct Engine {
    config: Config,
    store: StoreHandle,
    supervisor: Supervisor,
    reconciler: Reconciler,
}

impl Engine {
    pub fn new(mut config: Config, store: Arc<dyn RunStore>, notifier: Arc<dyn Notifier>) -> Self {
        // Scripts run with the run directory as cwd, so every path they see
        // must be absolute.
        config.paths.runs_dir = absolutize(&config.paths.runs_dir);
        config.paths.tool_dirs = config.paths.tool_dirs.iter().map(|d| absolutize(d)).collect();
        let store = StoreHandle::new(store);
        let supervisor = Supervisor::new(
            store.clone(),
            notifier,
            SupervisorSettings {
                shell: config.environment.shell.clone(),
            },
        );
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(KeywordDetector::default()),
            AuditLog::new(&config.audit_path()),
            config.supervisor.log_tail_bytes,
            config.kill_grace(),
        );
        Self {
            config,
            store,
            supervisor,
            reconciler,
        }
    }

    /// Open the SQLite store and notifier described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = SqliteRunStore::open(&config.paths.db_path)?;
        let notifier: Arc<dyn Notifier> = if config.notify.command.trim().is_empty() {
            Arc::new(LogNotifier)
        } else {
            Arc::new(CommandNotifier::new(
                config.notify.command.clone(),
                Duration::from_secs(config.notify.timeout_secs),
            ))
        };
        Ok(Self::new(config, Arc::new(store), notifier))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Validate, materialize and launch a pipeline run on `input`.
    ///
    /// An invalid selection fails before anything is created on disk or in
    /// the store.
    pub async fn submit(
        &self,
        owner: &str,
        selection: &ToolSelection,
        input: &Path,
    ) -> Result<Submission, EngineError> {
        if !input.is_file() {
            return Err(EngineError::InputMissing {
                path: input.to_path_buf(),
            });
        }
        let run_id = new_pipeline_run_id();
        self.run_dir(owner, &run_id)?;
        let layout = RunLayout::new(&self.config.paths.runs_dir, owner, &run_id, RunType::Pipeline);
        let file_name = input
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("input.fastq"));
        let raw = layout.run_dir().join(file_name);

        let plan = compose(selection, layout.run_dir(), &raw)?;
        tracing::info!(%run_id, %owner, stages = ?plan.stage_ids(), "Submitting pipeline run");
        self.start(owner, &run_id, layout, plan, input, &raw).await
    }

    /// Launch a BLAST search of the FASTA in `query`.
    pub async fn submit_blast(
        &self,
        owner: &str,
        query: &Path,
        params: &BlastParams,
    ) -> Result<Submission, EngineError> {
        if !query.is_file() {
            return Err(EngineError::InputMissing {
                path: query.to_path_buf(),
            });
        }
        let run_id = new_blast_run_id();
        self.run_dir(owner, &run_id)?;
        let layout = RunLayout::new(&self.config.paths.runs_dir, owner, &run_id, RunType::Blast);
        let staged = layout.run_dir().join("query.fasta");
        let params = BlastParams {
            db_path: absolutize(&params.db_path),
            ..params.clone()
        };

        let plan = compose_blast(&params, layout.run_dir(), &staged)?;
        tracing::info!(%run_id, %owner, db = %params.db_path.display(), "Submitting BLAST run");
        self.start(owner, &run_id, layout, plan, query, &staged).await
    }

    async fn start(
        &self,
        owner: &str,
        run_id: &str,
        layout: RunLayout,
        plan: ExecutionPlan,
        source: &Path,
        staged: &Path,
    ) -> Result<Submission, EngineError> {
        let run_dir = layout.run_dir().to_path_buf();
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|source| EngineError::Io {
                path: run_dir.clone(),
                source,
            })?;

        let prepared = async {
            tokio::fs::copy(source, staged)
                .await
                .map_err(|source| EngineError::Io {
                    path: staged.to_path_buf(),
                    source,
                })?;
            let script = materialize(&plan, &layout, &self.config.script_options())?;
            let (id, owner, run_type) = (run_id.to_string(), owner.to_string(), layout.run_type());
            self.store
                .call(move |s| s.create_run(&id, &owner, run_type))
                .await
                .map_err(EngineError::Store)?;
            Ok::<_, EngineError>(script)
        }
        .await;

        let script = match prepared {
            Ok(script) => script,
            Err(e) => {
                // Never leave a launchable directory behind for a run with no record.
                if let Err(rm) = tokio::fs::remove_dir_all(&run_dir).await {
                    tracing::warn!(%run_id, "Failed to clean up {}: {}", run_dir.display(), rm);
                }
                return Err(e);
            }
        };

        let handle = self.supervisor.launch(run_id, owner, script, layout);
        Ok(Submission {
            run_id: run_id.to_string(),
            run_dir,
            plan,
            handle,
        })
    }

    /// Resolve a run id to what is known about it and where it lives.
    async fn find(&self, owner: &str, run_id: &str) -> Result<(RunView, RunLayout), EngineError> {
        let dir = self.run_dir(owner, run_id)?;
        let id = run_id.to_string();
        let record = self
            .store
            .call(move |s| s.get_run(&id))
            .await
            .map_err(EngineError::Store)?;
        if let Some(record) = record.filter(|r| r.owner == owner) {
            let layout = RunLayout::new(
                &self.config.paths.runs_dir,
                owner,
                run_id,
                record.run_type,
            );
            return Ok((RunView::Stored(record), layout));
        }

        if dir.is_dir() {
            let view = synthetic_view(owner, run_id, dir.clone());
            let layout = RunLayout::at(dir, view.run_type());
            return Ok((view, layout));
        }
        Err(EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.config.paths.runs_dir.join(safe_owner(owner))
    }

    /// Directory of `run_id` under `owner`, refusing anything that could
    /// name a path outside the owner's directory.
    fn run_dir(&self, owner: &str, run_id: &str) -> Result<PathBuf, EngineError> {
        let safe = safe_owner(owner);
        if safe.is_empty() || safe.contains(['/', '\\', '\0']) {
            return Err(EngineError::InvalidOwner {
                owner: owner.to_string(),
            });
        }
        if !is_valid_run_id(run_id) {
            return Err(EngineError::InvalidRunId {
                run_id: run_id.to_string(),
            });
        }
        let owner_dir = self.owner_dir(owner);
        let dir = owner_dir.join(run_id);
        if dir.parent() != Some(owner_dir.as_path())
            || owner_dir.parent() != Some(self.config.paths.runs_dir.as_path())
        {
            return Err(EngineError::InvalidRunId {
                run_id: run_id.to_string(),
            });
        }
        Ok(dir)
    }

    async fn report(&self, view: RunView, layout: &RunLayout) -> Result<RunReport, EngineError> {
        let run_id = view.run_id().to_string();
        let resolution = self
            .reconciler
            .reconcile(&view, layout)
            .await
            .map_err(|source| EngineError::Reconcile {
                run_id: run_id.clone(),
                source,
            })?;

        let end_time = match &view {
            RunView::Stored(record) if resolution.heal.is_some() => {
                let id = run_id.clone();
                self.store
                    .call(move |s| s.get_run(&id))
                    .await
                    .map_err(EngineError::Store)?
                    .and_then(|r| r.end_time)
                    .or(record.end_time)
            }
            RunView::Stored(record) => record.end_time,
            RunView::Synthetic(_) => None,
        };

        let markers = layout.markers();
        let alive = markers.cancel
            && !resolution.status.is_terminal()
            && locate_script(layout).is_some();

        Ok(RunReport {
            run_id,
            owner: view.owner().to_string(),
            run_type: view.run_type(),
            status: resolution.status,
            source: resolution.source,
            synthetic: view.is_synthetic(),
            start_time: view.start_time(),
            end_time,
            run_dir: layout.run_dir().to_path_buf(),
            cancel_state: CancelState::observe(markers, alive),
        })
    }

    pub async fn status(&self, owner: &str, run_id: &str) -> Result<RunReport, EngineError> {
        let (view, layout) = self.find(owner, run_id).await?;
        self.report(view, &layout).await
    }

    /// Current log text with ANSI escapes removed.
    pub async fn read_log(&self, owner: &str, run_id: &str) -> Result<String, EngineError> {
        let (_, layout) = self.find(owner, run_id).await?;
        if layout.has(Marker::Cancel) {
            return Ok(format!("{} ABORTED BY USER\nExecution stopped.", layout.label()));
        }
        let path = layout.log_path();
        match read_log(&path).await {
            Ok(Some(text)) => Ok(strip_ansi(&text).into_owned()),
            Ok(None) => Ok(WAITING_MESSAGE.to_string()),
            Err(source) => Err(EngineError::Io { path, source }),
        }
    }

    pub async fn cancel(
        &self,
        owner: &str,
        run_id: &str,
        mode: CancelMode,
    ) -> Result<CancelOutcome, EngineError> {
        let (view, layout) = self.find(owner, run_id).await?;
        let current = self.report(view, &layout).await?;
        if current.status.is_terminal() {
            tracing::info!(%run_id, status = %current.status, "Cancel ignored; run already finished");
            return Ok(CancelOutcome::AlreadyTerminal {
                status: current.status,
            });
        }

        request_cancel(&layout)?;
        tracing::info!(%run_id, ?mode, "Cancel requested");

        let outcome = match mode {
            CancelMode::Cooperative => return Ok(CancelOutcome::Requested),
            CancelMode::Forced => self.force(&layout).await?,
            CancelMode::Graceful => {
                let wait = self.config.cancel_poll() + self.config.kill_grace() + GRACEFUL_MARGIN;
                if self.wait_for_stop(&layout, wait).await {
                    CancelOutcome::Stopped
                } else {
                    tracing::warn!(%run_id, "Script did not stop in time; forcing");
                    self.force(&layout).await?
                }
            }
        };

        // Heal a record whose supervisor is not around to finish it. The
        // record may have moved while we waited, so read it again.
        let (view, layout) = self.find(owner, run_id).await?;
        self.report(view, &layout).await?;
        Ok(outcome)
    }

    async fn force(&self, layout: &RunLayout) -> Result<CancelOutcome, EngineError> {
        layout
            .write_marker(Marker::Aborted)
            .map_err(|source| CancelError::MarkerWrite {
                path: layout.marker_path(Marker::Aborted),
                source,
            })?;
        match locate_script(layout) {
            Some(pid) => {
                let termination = terminate_tree(pid, self.config.kill_grace()).await?;
                Ok(CancelOutcome::Terminated { termination })
            }
            None => Ok(CancelOutcome::NoProcess),
        }
    }

    async fn wait_for_stop(&self, layout: &RunLayout, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if layout.has(Marker::Aborted) || locate_script(layout).is_none() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Stored runs plus run directories with no record, newest first.
    pub async fn list(&self, owner: &str) -> Result<Vec<RunReport>, EngineError> {
        let owner_key = owner.to_string();
        let records = self
            .store
            .call(move |s| s.list_runs(&owner_key))
            .await
            .map_err(EngineError::Store)?;
        let known: HashSet<String> = records.iter().map(|r| r.run_id.clone()).collect();

        let mut views: Vec<(RunView, RunLayout)> = records
            .into_iter()
            .map(|record| {
                let layout = RunLayout::new(
                    &self.config.paths.runs_dir,
                    owner,
                    &record.run_id,
                    record.run_type,
                );
                (RunView::Stored(record), layout)
            })
            .collect();

        let owner_dir = self.owner_dir(owner);
        match std::fs::read_dir(&owner_dir) {
            Ok(entries) => {
                for entry in entries.filter_map(|e| e.ok()) {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if !is_valid_run_id(&name) || known.contains(&name) || !entry.path().is_dir() {
                        continue;
                    }
                    let view = synthetic_view(owner, &name, entry.path());
                    let layout = RunLayout::at(entry.path(), view.run_type());
                    views.push((view, layout));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EngineError::Io {
                    path: owner_dir,
                    source,
                });
            }
        }

        let mut reports = Vec::with_capacity(views.len());
        for (view, layout) in views {
            reports.push(self.report(view, &layout).await?);
        }
        reports.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(reports)
    }

    /// Remove a run's directory and record. Active runs are refused unless
    /// `force`, which cancels them first.
    pub async fn delete(&self, owner: &str, run_id: &str, force: bool) -> Result<(), EngineError> {
        let (view, layout) = self.find(owner, run_id).await?;
        let current = self.report(view, &layout).await?;
        if !current.status.is_terminal() {
            if !force {
                return Err(EngineError::RunActive {
                    run_id: run_id.to_string(),
                    status: current.status.to_string(),
                });
            }
            self.cancel(owner, run_id, CancelMode::Forced).await?;
        }

        let dir = layout.run_dir();
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EngineError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        }
        let id = run_id.to_string();
        self.store
            .call(move |s| s.delete_run(&id))
            .await
            .map_err(EngineError::Store)?;
        tracing::info!(%run_id, %owner, "Run deleted");
        Ok(())
    }
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn synthetic_view(owner: &str, run_id: &str, run_dir: PathBuf) -> RunView {
    let modified = std::fs::metadata(&run_dir)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    RunView::Synthetic(SyntheticRun {
        run_id: run_id.to_string(),
        owner: owner.to_string(),
        run_dir,
        modified,
    })
}
