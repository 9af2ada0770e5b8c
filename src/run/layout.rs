//! On-disk layout of a run directory and its marker files.
//!
//! ```text
//! <runs_dir>/<safe owner>/<run id>/
//!     pipeline_output.log | blast.log      supervisor-captured output
//!     pipeline.log                          script-side copy (tee)
//!     pipeline.pid                          pid of the script process
//!     PIPELINE_DONE | BLAST_DONE            written by the script postamble
//!     PIPELINE_ABORTED | BLAST_ABORTED      stage failure or cancellation
//!     CANCEL                                cancel request
//! ```
//!
//! Markers are existence signals. They are created at most once and only
//! removed together with the whole run directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use genepipe_common::{RunType, safe_owner};

pub const CANCEL_MARKER: &str = "CANCEL";
pub const PID_FILE: &str = "pipeline.pid";
pub const SCRIPT_LOG: &str = "pipeline.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Done,
    Aborted,
    Cancel,
}

/// Snapshot of which markers exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Markers {
    pub done: bool,
    pub aborted: bool,
    pub cancel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_dir: PathBuf,
    run_type: RunType,
}

impl RunLayout {
    pub fn new(runs_dir: &Path, owner: &str, run_id: &str, run_type: RunType) -> Self {
        Self {
            run_dir: runs_dir.join(safe_owner(owner)).join(run_id),
            run_type,
        }
    }

    pub fn at(run_dir: PathBuf, run_type: RunType) -> Self {
        Self { run_dir, run_type }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_type(&self) -> RunType {
        self.run_type
    }

    /// Prefix used in script log lines and sentinel phrases.
    pub fn label(&self) -> &'static str {
        match self.run_type {
            RunType::Pipeline => "PIPELINE",
            RunType::Blast => "BLAST",
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join(match self.run_type {
            RunType::Pipeline => "pipeline_output.log",
            RunType::Blast => "blast.log",
        })
    }

    pub fn script_log_path(&self) -> PathBuf {
        self.run_dir.join(SCRIPT_LOG)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.run_dir.join(PID_FILE)
    }

    pub fn marker_path(&self, marker: Marker) -> PathBuf {
        let name = match (marker, self.run_type) {
            (Marker::Done, RunType::Pipeline) => "PIPELINE_DONE",
            (Marker::Done, RunType::Blast) => "BLAST_DONE",
            (Marker::Aborted, RunType::Pipeline) => "PIPELINE_ABORTED",
            (Marker::Aborted, RunType::Blast) => "BLAST_ABORTED",
            (Marker::Cancel, _) => CANCEL_MARKER,
        };
        self.run_dir.join(name)
    }

    pub fn has(&self, marker: Marker) -> bool {
        self.marker_path(marker).exists()
    }

    pub fn markers(&self) -> Markers {
        Markers {
            done: self.has(Marker::Done),
            aborted: self.has(Marker::Aborted),
            cancel: self.has(Marker::Cancel),
        }
    }

    /// Create `marker` if it does not exist yet. Existing markers are left
    /// untouched.
    pub fn write_marker(&self, marker: Marker) -> std::io::Result<()> {
        let path = self.marker_path(marker);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                if marker == Marker::Cancel {
                    writeln!(file, "{} ABORTED BY USER", self.label())?;
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Pid recorded by the supervisor, if any.
    pub fn recorded_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.pid_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|pid| *pid > 0)
    }

    /// Fresh, unique script path inside the run directory.
    pub fn new_script_path(&self) -> PathBuf {
        self.run_dir.join(format!(
            "{}_{}.sh",
            self.run_type.as_str(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Whether `arg` names a script materialized by `new_script_path`.
    pub fn is_script_path(&self, arg: &str) -> bool {
        let path = Path::new(arg);
        let prefix = format!("{}_", self.run_type.as_str());
        path.parent() == Some(self.run_dir.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".sh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_script_path() {
        let layout = RunLayout::at(PathBuf::from("/r/abcd1234"), RunType::Pipeline);
        let script = layout.new_script_path();
        assert!(layout.is_script_path(&script.to_string_lossy()));
        assert!(!layout.is_script_path("/r/abcd1234/flye/assembly.fasta"));
        assert!(!layout.is_script_path("/r/abcd1234/blast_1.sh"));
        assert!(!layout.is_script_path("/r/other/pipeline_1.sh"));
        assert!(!layout.is_script_path("pipeline_1.sh"));
    }

    #[test]
    fn test_run_dir_uses_safe_owner() {
        let layout = RunLayout::new(
            Path::new("/srv/pipeline_runs"),
            "jane.doe@lab.org",
            "abcd1234",
            RunType::Pipeline,
        );
        assert_eq!(
            layout.run_dir(),
            Path::new("/srv/pipeline_runs/jane_doe_lab_org/abcd1234")
        );
    }

    #[test]
    fn test_marker_names_per_run_type() {
        let pipeline = RunLayout::at(PathBuf::from("/r"), RunType::Pipeline);
        let blast = RunLayout::at(PathBuf::from("/r"), RunType::Blast);
        assert_eq!(pipeline.marker_path(Marker::Done), Path::new("/r/PIPELINE_DONE"));
        assert_eq!(blast.marker_path(Marker::Aborted), Path::new("/r/BLAST_ABORTED"));
        assert_eq!(blast.marker_path(Marker::Cancel), Path::new("/r/CANCEL"));
        assert_eq!(pipeline.log_path(), Path::new("/r/pipeline_output.log"));
        assert_eq!(blast.log_path(), Path::new("/r/blast.log"));
    }

    #[test]
    fn test_write_marker_is_write_once() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = RunLayout::at(dir.path().to_path_buf(), RunType::Pipeline);
        assert_eq!(layout.markers(), Markers::default());

        layout.write_marker(Marker::Cancel)?;
        let first = std::fs::read_to_string(layout.marker_path(Marker::Cancel))?;
        assert_eq!(first, "PIPELINE ABORTED BY USER\n");

        std::fs::write(layout.marker_path(Marker::Cancel), "kept")?;
        layout.write_marker(Marker::Cancel)?;
        assert_eq!(
            std::fs::read_to_string(layout.marker_path(Marker::Cancel))?,
            "kept"
        );

        layout.write_marker(Marker::Aborted)?;
        assert_eq!(
            layout.markers(),
            Markers {
                done: false,
                aborted: true,
                cancel: true
            }
        );
        Ok(())
    }

    #[test]
    fn test_recorded_pid() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = RunLayout::at(dir.path().to_path_buf(), RunType::Pipeline);
        assert_eq!(layout.recorded_pid(), None);
        std::fs::write(layout.pid_path(), "4242\n")?;
        assert_eq!(layout.recorded_pid(), Some(4242));
        std::fs::write(layout.pid_path(), "garbage")?;
        assert_eq!(layout.recorded_pid(), None);
        Ok(())
    }

    #[test]
    fn test_script_paths_are_unique() {
        let layout = RunLayout::at(PathBuf::from("/r"), RunType::Pipeline);
        let a = layout.new_script_path();
        let b = layout.new_script_path();
        assert_ne!(a, b);
        assert!(a.starts_with("/r"));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("sh"));
    }
}
