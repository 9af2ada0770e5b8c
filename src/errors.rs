//! Typed error hierarchy for the orchestrator.
//!
//! Each stage of a run's life has its own enum so callers can match on what
//! went wrong:
//! - `PlanError`: the requested tool selection is invalid (nothing created)
//! - `MaterializeError`: the pipeline script could not be written
//! - `SupervisorError`: launching or watching the script failed
//! - `CancelError`: a cancel request or forced termination failed
//! - `EngineError`: everything the engine facade surfaces to callers

use std::path::PathBuf;

use thiserror::Error;

/// Rejected tool selection. Raised before any run directory or record exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Please select at least one tool")]
    EmptySelection,

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error(
        "Invalid selection: {} require the assembler (flye) to be selected",
        .requested.join(", ")
    )]
    MissingAssembly { requested: Vec<String> },

    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter { name: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Failed to create script directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write script at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to make script executable at {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move script into place at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn pipeline script: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to open run log at {path}: {source}")]
    LogOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write run log: {0}")]
    LogWrite(#[source] std::io::Error),

    #[error("Failed to wait for pipeline script: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Pipeline script produced no {0} handle")]
    MissingPipe(&'static str),

    #[error("Run store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Failed to write cancel marker at {path}: {source}")]
    MarkerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the `Engine` facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Cancel(#[from] CancelError),

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Invalid run id {run_id:?}")]
    InvalidRunId { run_id: String },

    #[error("Invalid owner {owner:?}")]
    InvalidOwner { owner: String },

    #[error("Run {run_id} is still {status}; cancel it first or pass --force")]
    RunActive { run_id: String, status: String },

    #[error("Input file not found: {path}")]
    InputMissing { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("Failed to reconcile run {run_id}: {source:#}")]
    Reconcile {
        run_id: String,
        #[source]
        source: anyhow::Error,
    },
}
