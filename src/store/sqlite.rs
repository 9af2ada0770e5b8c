use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use genepipe_common::{RunRecord, RunStatus, RunStore, RunType};
use rusqlite::{Connection, OptionalExtension, params};

/// SQLite-backed run records.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        run_migrations(&conn).context("Failed to run migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Run store lock poisoned: {}", e))
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            start_time TEXT NOT NULL,
            end_time TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pipeline_runs_owner
            ON pipeline_runs(owner, start_time);
        ",
    )
    .context("Failed to create pipeline_runs table")?;

    // Databases created before BLAST support lack run_type.
    if let Err(e) = conn.execute(
        "ALTER TABLE pipeline_runs ADD COLUMN run_type TEXT NOT NULL DEFAULT 'pipeline'",
        [],
    ) && !e.to_string().contains("duplicate column")
    {
        return Err(e).context("Failed to add run_type column");
    }
    Ok(())
}

const SELECT_COLUMNS: &str = "run_id, owner, status, run_type, start_time, end_time";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        owner: row.get(1)?,
        status: row.get(2)?,
        run_type: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
    })
}

impl RunStore for SqliteRunStore {
    fn create_run(&self, run_id: &str, owner: &str, run_type: RunType) -> Result<RunRecord> {
        let now = Utc::now();
        self.conn()?
            .execute(
                "INSERT INTO pipeline_runs (run_id, owner, status, run_type, start_time)
                 VALUES (?1, ?2, 'pending', ?3, ?4)",
                params![run_id, owner, run_type.as_str(), fmt_time(now)],
            )
            .with_context(|| format!("Failed to insert run {}", run_id))?;
        Ok(RunRecord {
            run_id: run_id.to_string(),
            owner: owner.to_string(),
            status: RunStatus::Pending,
            run_type,
            start_time: now,
            end_time: None,
        })
    }

    fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE pipeline_runs SET status = ?1, end_time = ?2 WHERE run_id = ?3",
                params![status.as_str(), end_time.map(fmt_time), run_id],
            )
            .with_context(|| format!("Failed to update status of run {}", run_id))?;
        Ok(())
    }

    fn transition(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE pipeline_runs SET status = ?1, end_time = ?2
                 WHERE run_id = ?3 AND status = ?4",
                params![to.as_str(), end_time.map(fmt_time), run_id, from.as_str()],
            )
            .with_context(|| format!("Failed to update status of run {}", run_id))?;
        Ok(changed > 0)
    }

    fn mark_running(&self, run_id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE pipeline_runs SET status = 'running'
                 WHERE run_id = ?1 AND status = 'pending'",
                params![run_id],
            )
            .with_context(|| format!("Failed to mark run {} running", run_id))?;
        Ok(changed > 0)
    }

    fn finish_run(&self, run_id: &str, status: RunStatus, end_time: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE pipeline_runs SET status = ?1, end_time = ?2
                 WHERE run_id = ?3 AND status IN ('pending', 'running')",
                params![status.as_str(), fmt_time(end_time), run_id],
            )
            .with_context(|| format!("Failed to finish run {}", run_id))?;
        Ok(changed > 0)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM pipeline_runs WHERE run_id = ?1"),
                params![run_id],
                read_row,
            )
            .optional()
            .with_context(|| format!("Failed to query run {}", run_id))?;
        row.map(RunRow::into_record).transpose()
    }

    fn list_runs(&self, owner: &str) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM pipeline_runs
                 WHERE owner = ?1 ORDER BY start_time DESC"
            ))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![owner], read_row)
            .context("Failed to query runs")?;
        let mut records = Vec::new();
        for row in rows {
            let row = row.context("Failed to read pipeline_runs row")?;
            records.push(row.into_record()?);
        }
        Ok(records)
    }

    fn delete_run(&self, run_id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute("DELETE FROM pipeline_runs WHERE run_id = ?1", params![run_id])
            .with_context(|| format!("Failed to delete run {}", run_id))?;
        Ok(changed > 0)
    }
}

/// Intermediate row struct for pipeline_runs.
struct RunRow {
    run_id: String,
    owner: String,
    status: String,
    run_type: String,
    start_time: String,
    end_time: Option<String>,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        let run_type = RunType::from_str(&self.run_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run type")?;
        let end_time = self.end_time.as_deref().map(parse_time).transpose()?;
        Ok(RunRecord {
            run_id: self.run_id,
            owner: self.owner,
            status,
            run_type,
            start_time: parse_time(&self.start_time)?,
            end_time,
        })
    }
}

/// Fixed-width UTC timestamps so `ORDER BY start_time` sorts chronologically.
fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in run store: {}", raw))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_table_and_index() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        let conn = store.conn()?;
        let index_count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name = 'idx_pipeline_runs_owner'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 1);
        Ok(())
    }

    #[test]
    fn test_migrations_are_rerunnable() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        let conn = store.conn()?;
        run_migrations(&conn)?;
        run_migrations(&conn)?;
        Ok(())
    }

    #[test]
    fn test_create_and_get_run() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        let created = store.create_run("abcd1234", "me@example.org", RunType::Blast)?;
        assert_eq!(created.status, RunStatus::Pending);
        assert!(created.end_time.is_none());

        let fetched = store.get_run("abcd1234")?.expect("run should exist");
        assert_eq!(fetched.owner, "me@example.org");
        assert_eq!(fetched.run_type, RunType::Blast);
        assert_eq!(fetched.status, RunStatus::Pending);
        assert!(store.get_run("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_run_id_is_rejected() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("dup", "a", RunType::Pipeline)?;
        assert!(store.create_run("dup", "a", RunType::Pipeline).is_err());
        Ok(())
    }

    #[test]
    fn test_mark_running_only_from_pending() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("r1", "a", RunType::Pipeline)?;
        assert!(store.mark_running("r1")?);
        assert!(!store.mark_running("r1")?);
        assert_eq!(store.get_run("r1")?.unwrap().status, RunStatus::Running);

        store.set_status("r1", RunStatus::Cancelled, Some(Utc::now()))?;
        assert!(!store.mark_running("r1")?);
        assert_eq!(store.get_run("r1")?.unwrap().status, RunStatus::Cancelled);
        Ok(())
    }

    #[test]
    fn test_finish_run_writes_once() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("r1", "a", RunType::Pipeline)?;
        store.mark_running("r1")?;

        assert!(store.finish_run("r1", RunStatus::Completed, Utc::now())?);
        assert!(!store.finish_run("r1", RunStatus::Failed, Utc::now())?);

        let run = store.get_run("r1")?.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.end_time.is_some());
        Ok(())
    }

    #[test]
    fn test_finish_missing_run_is_false() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        assert!(!store.finish_run("nope", RunStatus::Failed, Utc::now())?);
        Ok(())
    }

    #[test]
    fn test_set_status_is_unconditional() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("r1", "a", RunType::Pipeline)?;
        store.set_status("r1", RunStatus::Failed, Some(Utc::now()))?;
        store.set_status("r1", RunStatus::Completed, Some(Utc::now()))?;
        assert_eq!(store.get_run("r1")?.unwrap().status, RunStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_transition_requires_expected_status() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("r1", "a", RunType::Pipeline)?;
        store.mark_running("r1")?;
        let finished = Utc::now();
        assert!(store.finish_run("r1", RunStatus::Completed, finished)?);

        // A heal computed from the earlier `running` read loses the race.
        assert!(!store.transition("r1", RunStatus::Running, RunStatus::Cancelled, Some(Utc::now()))?);
        let run = store.get_run("r1")?.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.end_time.map(|t| t.timestamp_millis()), Some(finished.timestamp_millis()));

        store.create_run("r2", "a", RunType::Pipeline)?;
        assert!(store.transition("r2", RunStatus::Pending, RunStatus::Failed, Some(Utc::now()))?);
        assert_eq!(store.get_run("r2")?.unwrap().status, RunStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_list_runs_filters_owner_newest_first() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("old", "me", RunType::Pipeline)?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create_run("new", "me", RunType::Pipeline)?;
        store.create_run("theirs", "someone-else", RunType::Pipeline)?;

        let ids: Vec<String> = store
            .list_runs("me")?
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
        Ok(())
    }

    #[test]
    fn test_delete_run() -> Result<()> {
        let store = SqliteRunStore::open_in_memory()?;
        store.create_run("r1", "a", RunType::Pipeline)?;
        assert!(store.delete_run("r1")?);
        assert!(!store.delete_run("r1")?);
        assert!(store.get_run("r1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_open_on_disk_creates_parent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("runs.db");
        {
            let store = SqliteRunStore::open(&path)?;
            store.create_run("r1", "a", RunType::Pipeline)?;
        }
        let reopened = SqliteRunStore::open(&path)?;
        assert!(reopened.get_run("r1")?.is_some());
        Ok(())
    }
}
