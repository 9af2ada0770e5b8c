//! The persistent store interface the orchestrator depends on.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{RunRecord, RunStatus, RunType};

/// Key/value access to run records.
///
/// Writes touch only `status` and `end_time`. Everything except `set_status`
/// is conditional on the current status, so a terminal record is never
/// overwritten by a writer working from a stale read.
pub trait RunStore: Send + Sync {
    /// Insert a new record with status `pending` and `start_time` now.
    fn create_run(&self, run_id: &str, owner: &str, run_type: RunType) -> Result<RunRecord>;

    /// Unconditionally set `status` and `end_time`.
    fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Move the record from `from` to `to` only if it is still `from`.
    /// Returns `false` (and writes nothing) when another writer got there
    /// first.
    fn transition(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// `pending` -> `running`. Returns `false` when the record is in any other
    /// state.
    fn mark_running(&self, run_id: &str) -> Result<bool>;

    /// Move a non-terminal record to `status`. Returns `false` (and writes
    /// nothing) when the record is missing or already terminal.
    fn finish_run(&self, run_id: &str, status: RunStatus, end_time: DateTime<Utc>) -> Result<bool>;

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Records for one owner, newest first.
    fn list_runs(&self, owner: &str) -> Result<Vec<RunRecord>>;

    /// Returns `true` if a record was removed.
    fn delete_run(&self, run_id: &str) -> Result<bool>;
}
