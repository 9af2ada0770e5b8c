//! genepipe: plan, supervise, cancel and reconcile long-read assembly runs.
//!
//! A run starts as a `ToolSelection`, is composed into an `ExecutionPlan`,
//! rendered to a bash script inside its own run directory and supervised to
//! a terminal status. Status reads merge the stored record with marker files
//! and log text and heal the record when it lags behind.

pub mod audit;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod run;
pub mod store;

pub use engine::{CancelMode, CancelOutcome, Engine, RunReport, Submission};
pub use errors::{CancelError, EngineError, MaterializeError, PlanError, SupervisorError};
