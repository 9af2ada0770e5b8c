//! Launching a materialized script and watching it to completion.
//!
//! Each run gets one worker task. The worker marks the record `running`,
//! spawns the script in its own process group, streams stdout and stderr
//! into the run log, classifies the exit and writes the terminal status
//! exactly once.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genepipe_common::RunStatus;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;

use super::layout::{Markers, RunLayout};
use crate::errors::SupervisorError;
use crate::notify::{Notifier, RunEvent, dispatch};
use crate::pipeline::ScriptHandle;
use crate::store::StoreHandle;

/// How long to keep reading output after the script exits. Grandchildren
/// that inherited the pipes can hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Interpreter for the script.
    pub shell: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }
}

/// Final result of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub run_id: String,
    pub status: RunStatus,
    /// `None` when the script was killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Map a script exit to a terminal status.
///
/// A cancelled script leaves both the cancel and abort markers behind and
/// that wins over the exit code. Otherwise a zero exit is success.
pub fn classify_exit(exit_code: Option<i32>, markers: Markers) -> RunStatus {
    if markers.done && exit_code == Some(0) {
        RunStatus::Completed
    } else if markers.cancel && markers.aborted {
        RunStatus::Cancelled
    } else if exit_code == Some(0) {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    }
}

/// Runs scripts for the engine.
#[derive(Clone)]
pub struct Supervisor {
    store: StoreHandle,
    notifier: Arc<dyn Notifier>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(store: StoreHandle, notifier: Arc<dyn Notifier>, settings: SupervisorSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    /// Start supervising `script`. Returns immediately; the run proceeds in
    /// the background whether or not the handle is awaited.
    pub fn launch(
        &self,
        run_id: &str,
        owner: &str,
        script: ScriptHandle,
        layout: RunLayout,
    ) -> RunHandle {
        let worker = Worker {
            run_id: run_id.to_string(),
            owner: owner.to_string(),
            script,
            layout,
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            shell: self.settings.shell.clone(),
        };
        let task = tokio::spawn(worker.run());
        RunHandle {
            run_id: run_id.to_string(),
            store: self.store.clone(),
            task: Mutex::new(Some(task)),
            outcome: OnceCell::new(),
        }
    }
}

/// Handle to a supervised run.
pub struct RunHandle {
    run_id: String,
    store: StoreHandle,
    task: Mutex<Option<JoinHandle<Outcome>>>,
    outcome: OnceCell<Outcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait for the run to finish. Safe to call more than once and safe to
    /// drop mid-wait; later calls return the same outcome.
    pub async fn await_completion(&self) -> Outcome {
        self.outcome
            .get_or_init(|| async {
                let mut guard = self.task.lock().await;
                let Some(task) = guard.as_mut() else {
                    return self.lost("supervisor task already consumed").await;
                };
                let joined = task.await;
                *guard = None;
                match joined {
                    Ok(outcome) => outcome,
                    Err(e) => self.lost(&format!("supervisor task failed: {}", e)).await,
                }
            })
            .await
            .clone()
    }

    /// The worker died before writing a status.
    async fn lost(&self, reason: &str) -> Outcome {
        tracing::error!(run_id = %self.run_id, "{}", reason);
        let id = self.run_id.clone();
        if let Err(e) = self
            .store
            .call(move |s| s.finish_run(&id, RunStatus::Failed, Utc::now()))
            .await
        {
            tracing::error!(run_id = %self.run_id, "Failed to record failure: {:#}", e);
        }
        Outcome {
            run_id: self.run_id.clone(),
            status: RunStatus::Failed,
            exit_code: None,
            error: Some(reason.to_string()),
        }
    }
}

struct Worker {
    run_id: String,
    owner: String,
    script: ScriptHandle,
    layout: RunLayout,
    store: StoreHandle,
    notifier: Arc<dyn Notifier>,
    shell: String,
}

impl Worker {
    async fn run(self) -> Outcome {
        let run_type = self.layout.run_type();
        let result = self.execute().await;

        let (mut status, exit_code, error) = match result {
            Ok(code) => (classify_exit(code, self.layout.markers()), code, None),
            Err(e) => {
                tracing::error!(run_id = %self.run_id, "Supervisor error: {}", e);
                self.append_internal_error(&e.to_string()).await;
                (RunStatus::Failed, None, Some(e.to_string()))
            }
        };

        let id = self.run_id.clone();
        match self
            .store
            .call(move |s| s.finish_run(&id, status, Utc::now()))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Someone else already wrote a terminal status; that one stands.
                let id = self.run_id.clone();
                if let Ok(Some(record)) = self.store.call(move |s| s.get_run(&id)).await {
                    tracing::debug!(
                        run_id = %self.run_id,
                        ours = %status,
                        stored = %record.status,
                        "Run already terminal"
                    );
                    status = record.status;
                }
            }
            Err(e) => {
                tracing::error!(run_id = %self.run_id, "Failed to record final status: {:#}", e)
            }
        }

        tracing::info!(run_id = %self.run_id, %status, exit_code = ?exit_code, "Run finished");
        dispatch(
            self.notifier.as_ref(),
            RunEvent::RunFinished {
                run_id: self.run_id.clone(),
                owner: self.owner.clone(),
                run_type,
                status,
            },
        )
        .await;

        Outcome {
            run_id: self.run_id,
            status,
            exit_code,
            error,
        }
    }

    async fn execute(&self) -> Result<Option<i32>, SupervisorError> {
        let id = self.run_id.clone();
        let started = self
            .store
            .call(move |s| s.mark_running(&id))
            .await
            .map_err(SupervisorError::Store)?;
        if !started {
            tracing::debug!(run_id = %self.run_id, "Record was not pending at launch");
        }
        dispatch(
            self.notifier.as_ref(),
            RunEvent::RunStarted {
                run_id: self.run_id.clone(),
                owner: self.owner.clone(),
                run_type: self.layout.run_type(),
            },
        )
        .await;

        let log_path = self.layout.log_path();
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|source| SupervisorError::LogOpen {
                path: log_path.clone(),
                source,
            })?;

        let mut child = Command::new(&self.shell)
            .arg(&self.script.path)
            .current_dir(self.layout.run_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(SupervisorError::SpawnFailed)?;

        if let Some(pid) = child.id()
            && let Err(e) = tokio::fs::write(self.layout.pid_path(), format!("{}\n", pid)).await
        {
            tracing::warn!(run_id = %self.run_id, "Failed to write pid file: {}", e);
        }
        tracing::info!(run_id = %self.run_id, pid = ?child.id(), script = %self.script.path.display(), "Script started");

        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingPipe("stderr"))?;

        let (tx, rx) = mpsc::channel(256);
        let mut out_task = tokio::spawn(pump(stdout, tx.clone()));
        let mut err_task = tokio::spawn(pump(stderr, tx));
        let writer = tokio::spawn(write_log(log, rx));

        let waited = child.wait().await;

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            let _ = (&mut out_task).await;
            let _ = (&mut err_task).await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(run_id = %self.run_id, "Output still open after exit; stopped reading");
        }
        out_task.abort();
        err_task.abort();

        match writer.await {
            Ok(result) => result?,
            Err(e) => tracing::warn!(run_id = %self.run_id, "Log writer task failed: {}", e),
        }

        let status = waited.map_err(SupervisorError::Wait)?;
        Ok(status.code())
    }

    async fn append_internal_error(&self, message: &str) {
        let path = self.layout.log_path();
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(format!("\n[INTERNAL ERROR] {}\n", message).as_bytes())
                .await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(run_id = %self.run_id, "Failed to append error to {}: {}", path.display(), e);
        }
    }
}

/// Carriage-return progress updates become separate lines.
fn normalize_line(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'\r' if raw.get(i + 1) == Some(&b'\n') => {}
            b'\r' => out.push(b'\n'),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

async fn pump<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(normalize_line(&buf)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read script output: {}", e);
                break;
            }
        }
    }
}

async fn write_log(
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> Result<(), SupervisorError> {
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await.map_err(SupervisorError::LogWrite)?;
        file.flush().await.map_err(SupervisorError::LogWrite)?;
    }
    Ok(())
}
