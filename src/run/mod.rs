//! Everything that happens to a run after its script is written.
//!
//! - `layout`: run directory paths and marker files
//! - `supervisor`: launching and watching the script
//! - `cancel`: the cancel marker and forced process-tree termination
//! - `process_tree`: `/proc` discovery and signalling
//! - `log_scan`: log reading, sentinel and failure detection
//! - `reconcile`: displayed status from record, markers and logs

pub mod cancel;
pub mod layout;
pub mod log_scan;
pub mod process_tree;
pub mod reconcile;
pub mod supervisor;

pub use cancel::{CancelState, Termination, locate_script, request_cancel, terminate_tree};
pub use layout::{Marker, Markers, RunLayout};
pub use log_scan::{FailureDetector, KeywordDetector, LogSignals};
pub use reconcile::{Reconciler, Resolution, StatusSource, resolve};
pub use supervisor::{Outcome, RunHandle, Supervisor, SupervisorSettings, classify_exit};
