//! Single-stage BLAST plan.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use genepipe_common::RunType;
use serde::{Deserialize, Serialize};

use super::catalog::{StageId, ToolCommand};
use super::plan::{ExecutionPlan, PlannedStage, Preflight};
use crate::errors::PlanError;

/// Tabular columns requested from blastn (`-outfmt 6`).
pub const OUTFMT: &str =
    "6 qseqid sseqid pident length mismatch gapopen qstart qend sstart send evalue bitscore";

/// File suffixes of which at least one exists for a usable nucleotide DB.
const DB_SUFFIXES: [&str; 4] = [".nin", ".nsq", ".nhr", ".nal"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastParams {
    /// Database prefix as given to `makeblastdb -out`.
    pub db_path: PathBuf,
    pub threads: u32,
    pub max_hits: u32,
    pub task: String,
}

impl Default for BlastParams {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("blast_db/reference"),
            threads: 4,
            max_hits: 10,
            task: "blastn".to_string(),
        }
    }
}

/// Candidate index files for a database prefix.
pub fn db_candidates(db_path: &Path) -> Vec<PathBuf> {
    DB_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name = OsString::from(db_path.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

/// Plan a BLAST search of `query` (already inside `run_dir`).
pub fn compose_blast(
    params: &BlastParams,
    run_dir: &Path,
    query: &Path,
) -> Result<ExecutionPlan, PlanError> {
    if params.threads == 0 {
        return Err(PlanError::InvalidParameter {
            name: "threads",
            message: "must be at least 1".to_string(),
        });
    }
    if params.max_hits == 0 {
        return Err(PlanError::InvalidParameter {
            name: "max_hits",
            message: "must be at least 1".to_string(),
        });
    }

    let spec = StageId::Blast.spec();
    let artifact = run_dir.join(spec.artifact);
    let command = ToolCommand::new("blastn")
        .arg("-task")
        .arg(params.task.clone())
        .arg("-query")
        .path(query)
        .arg("-db")
        .path(&params.db_path)
        .arg("-num_threads")
        .arg(params.threads.to_string())
        .arg("-max_target_seqs")
        .arg(params.max_hits.to_string())
        .arg("-max_hsps")
        .arg("1")
        .arg("-outfmt")
        .arg(OUTFMT)
        .arg("-out")
        .path(&artifact);

    Ok(ExecutionPlan {
        run_type: RunType::Blast,
        run_dir: run_dir.to_path_buf(),
        raw_input: query.to_path_buf(),
        preflight: vec![Preflight::AnyExists {
            candidates: db_candidates(&params.db_path),
            message: format!("Missing BLAST DB files at {}", params.db_path.display()),
        }],
        stages: vec![PlannedStage {
            id: StageId::Blast,
            input: query.to_path_buf(),
            commands: vec![command],
            subdirs: Vec::new(),
            artifact,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_candidates_append_suffix() {
        let candidates = db_candidates(Path::new("/data/db/ref.v2"));
        assert_eq!(candidates[0], PathBuf::from("/data/db/ref.v2.nin"));
        assert_eq!(candidates[3], PathBuf::from("/data/db/ref.v2.nal"));
    }

    #[test]
    fn test_blast_plan_shape() {
        let params = BlastParams {
            db_path: PathBuf::from("/data/db/ref"),
            ..BlastParams::default()
        };
        let run_dir = Path::new("/runs/me/blast_20240101_120000_abcd1234");
        let query = run_dir.join("query.fasta");
        let plan = compose_blast(&params, run_dir, &query).unwrap();

        assert_eq!(plan.run_type, RunType::Blast);
        assert_eq!(plan.stage_ids(), vec![StageId::Blast]);
        assert_eq!(plan.preflight.len(), 1);

        let argv = plan.stages[0].commands[0].argv();
        assert_eq!(argv[0], "blastn");
        assert!(argv.windows(2).any(|w| w == ["-max_target_seqs", "10"]));
        assert!(argv.windows(2).any(|w| w == ["-max_hsps", "1"]));
        assert!(argv.windows(2).any(|w| w == ["-outfmt", OUTFMT]));
        assert_eq!(
            argv.last().copied(),
            Some("/runs/me/blast_20240101_120000_abcd1234/blast_results.tsv")
        );
    }

    #[test]
    fn test_zero_threads_rejected() {
        let params = BlastParams {
            threads: 0,
            ..BlastParams::default()
        };
        let run_dir = Path::new("/runs/x");
        assert!(compose_blast(&params, run_dir, &run_dir.join("query.fasta")).is_err());
    }
}
