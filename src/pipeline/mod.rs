//! From a tool selection to an executable script.
//!
//! - `catalog`: stage ids, artifacts and per-stage argument builders
//! - `plan`: selection validation and input resolution
//! - `blast`: the single-stage BLAST plan
//! - `script`: bash rendering and atomic materialization

pub mod blast;
pub mod catalog;
pub mod plan;
pub mod script;

pub use blast::{BlastParams, compose_blast};
pub use catalog::{ArtifactKind, RunParams, StageId, StageSpec, ToolCommand};
pub use plan::{ExecutionPlan, PlannedStage, Preflight, ToolSelection, compose};
pub use script::{ScriptHandle, ScriptOptions, materialize, render};
