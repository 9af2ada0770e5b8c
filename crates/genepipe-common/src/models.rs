use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid run status: {0}")]
    Status(String),

    #[error("Invalid run type: {0}")]
    RunType(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are final: once stored, only run deletion removes them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseError::Status(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    Pipeline,
    Blast,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Blast => "blast",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(Self::Pipeline),
            "blast" => Ok(Self::Blast),
            _ => Err(ParseError::RunType(s.to_string())),
        }
    }
}

/// Persistent record of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub owner: String,
    pub status: RunStatus,
    pub run_type: RunType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A run directory found on disk with no record behind it.
///
/// Built on read from directory metadata alone; never written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticRun {
    pub run_id: String,
    pub owner: String,
    pub run_dir: PathBuf,
    pub modified: Option<DateTime<Utc>>,
}

/// What the orchestrator knows about a run before reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RunView {
    Stored(RunRecord),
    Synthetic(SyntheticRun),
}

impl RunView {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Stored(r) => &r.run_id,
            Self::Synthetic(s) => &s.run_id,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::Stored(r) => &r.owner,
            Self::Synthetic(s) => &s.owner,
        }
    }

    /// The stored status, if a record exists.
    pub fn stored_status(&self) -> Option<RunStatus> {
        match self {
            Self::Stored(r) => Some(r.status),
            Self::Synthetic(_) => None,
        }
    }

    /// Synthetic runs carry no type column; the id prefix is all there is.
    pub fn run_type(&self) -> RunType {
        match self {
            Self::Stored(r) => r.run_type,
            Self::Synthetic(s) if s.run_id.starts_with("blast_") => RunType::Blast,
            Self::Synthetic(_) => RunType::Pipeline,
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Stored(r) => Some(r.start_time),
            Self::Synthetic(s) => s.modified,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_rejects_unknown() {
        assert_eq!(
            "done".parse::<RunStatus>(),
            Err(ParseError::Status("done".to_string()))
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_synthetic_run_type_from_id_prefix() {
        let view = RunView::Synthetic(SyntheticRun {
            run_id: "blast_20240101_120000_abcd1234".to_string(),
            owner: "a_b_org".to_string(),
            run_dir: PathBuf::from("/tmp/x"),
            modified: None,
        });
        assert_eq!(view.run_type(), RunType::Blast);
        assert!(view.stored_status().is_none());
        assert!(view.is_synthetic());
    }

    #[test]
    fn test_run_view_serializes_with_source_tag() {
        let view = RunView::Stored(RunRecord {
            run_id: "abcd1234".to_string(),
            owner: "me@example.org".to_string(),
            status: RunStatus::Running,
            run_type: RunType::Pipeline,
            start_time: Utc::now(),
            end_time: None,
        });
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["source"], "stored");
        assert_eq!(json["status"], "running");
    }
}
