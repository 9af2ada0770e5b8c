//! Cooperative and forced cancellation.
//!
//! A cancel request is the `CANCEL` marker; the running script polls for it
//! and stops its current tool. Forced termination signals the script's whole
//! process tree: SIGTERM, a bounded grace period, then SIGKILL for anything
//! still alive.

use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Serialize;

use super::layout::{Marker, Markers, RunLayout};
use super::process_tree;
use crate::errors::CancelError;

/// Where a run is in the cancellation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    Active,
    CancelRequested,
    Terminating,
    Cancelled,
}

impl CancelState {
    /// Derive the state from markers and process liveness.
    pub fn observe(markers: Markers, process_alive: bool) -> Self {
        match (markers.cancel, markers.aborted, process_alive) {
            (false, _, _) => Self::Active,
            (true, _, true) => Self::CancelRequested,
            (true, true, false) => Self::Cancelled,
            // Marker seen but the script never acknowledged it; the process
            // is gone, so there is nothing left to stop.
            (true, false, false) => Self::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CancelRequested => "cancel-requested",
            Self::Terminating => "terminating",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Create the cancel marker. Safe to call before the script starts polling
/// and safe to repeat.
pub fn request_cancel(layout: &RunLayout) -> Result<(), CancelError> {
    layout
        .write_marker(Marker::Cancel)
        .map_err(|source| CancelError::MarkerWrite {
            path: layout.marker_path(Marker::Cancel),
            source,
        })
}

/// Find the script process for a run: the recorded pid when it is still
/// running this run's script, else a search for a process whose arguments
/// name the materialized script.
pub fn locate_script(layout: &RunLayout) -> Option<i32> {
    let is_script = |arg: &str| layout.is_script_path(arg);
    if let Some(pid) = layout.recorded_pid()
        && process_tree::is_alive(pid)
        && process_tree::has_arg(pid, is_script).unwrap_or(true)
    {
        return Some(pid);
    }
    process_tree::find_by_arg(is_script)
        .into_iter()
        .find(|pid| *pid != std::process::id() as i32 && process_tree::is_alive(*pid))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Termination {
    /// Processes sent SIGTERM.
    pub signalled: Vec<i32>,
    /// Processes still alive after the grace period and sent SIGKILL.
    pub killed: Vec<i32>,
}

/// Terminate `root` and all of its descendants.
///
/// The tree is collected before signalling; children that outlive their
/// parent get reparented and would otherwise be lost.
pub async fn terminate_tree(root: i32, grace: Duration) -> Result<Termination, CancelError> {
    let mut tree = vec![root];
    tree.extend(process_tree::descendants(root));

    process_tree::signal(root, Signal::SIGTERM)
        .map_err(|source| CancelError::Signal { pid: root, source })?;
    let _ = process_tree::signal_group(root, Signal::SIGTERM);
    for pid in &tree[1..] {
        let _ = process_tree::signal(*pid, Signal::SIGTERM);
        let _ = process_tree::signal_group(*pid, Signal::SIGTERM);
    }
    tracing::info!(pid = root, tree = tree.len(), "Sent SIGTERM to process tree");

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !tree.iter().any(|pid| process_tree::is_alive(*pid)) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let killed: Vec<i32> = tree
        .iter()
        .copied()
        .filter(|pid| process_tree::is_alive(*pid))
        .collect();
    for pid in &killed {
        let _ = process_tree::signal(*pid, Signal::SIGKILL);
    }
    let _ = process_tree::signal_group(root, Signal::SIGKILL);
    if !killed.is_empty() {
        tracing::warn!(pid = root, killed = ?killed, "Force-killed processes that ignored SIGTERM");
    }

    Ok(Termination {
        signalled: tree,
        killed,
    })
}
