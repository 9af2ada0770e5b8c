//! Domain types shared by every genepipe layer.
//!
//! The orchestrator, the store implementations and the CLI all speak in terms
//! of these types; nothing here touches the filesystem or spawns processes.

pub mod ids;
pub mod models;
pub mod store;

pub use ids::{is_valid_run_id, new_blast_run_id, new_pipeline_run_id, safe_owner};
pub use models::{ParseError, RunRecord, RunStatus, RunType, RunView, SyntheticRun};
pub use store::RunStore;
