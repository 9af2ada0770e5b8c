//! End-to-end runs through the engine.
//!
//! Every external tool is replaced by a small shell script in a temporary
//! tool directory, so these tests exercise the real script, supervisor,
//! cancellation and reconciliation paths without any bioinformatics software.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use genepipe::config::Config;
use genepipe::engine::{CancelMode, CancelOutcome, Engine};
use genepipe::errors::{EngineError, PlanError};
use genepipe::notify::LogNotifier;
use genepipe::pipeline::catalog::StageId;
use genepipe::pipeline::{BlastParams, RunParams, ToolSelection};
use genepipe::run::StatusSource;
use genepipe::store::SqliteRunStore;
use genepipe_common::{RunStatus, RunType, safe_owner};
use tempfile::TempDir;

const OWNER: &str = "tester@lab.org";

const SEQKIT: &str = r#"cp "$2" "$4""#;
const FILTLONG: &str = r#"echo "filtlong $*" >&2; cat "$5""#;
const FLYE: &str = r#"out=""
while [ $# -gt 0 ]; do
    case "$1" in
        --out-dir) out="$2"; shift ;;
    esac
    shift
done
mkdir -p "$out"
printf '>contig_1\nACGTACGT\n' > "$out/assembly.fasta""#;
const BLASTN: &str = r#"out=""
while [ $# -gt 0 ]; do
    case "$1" in
        -out) out="$2"; shift ;;
    esac
    shift
done
printf 'q1\ts1\t99.0\t8\t0\t0\t1\t8\t1\t8\t1e-5\t16\n' > "$out""#;

struct Fixture {
    dir: TempDir,
    engine: Engine,
}

impl Fixture {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn input(&self) -> PathBuf {
        self.root().join("reads.fastq")
    }

    fn runs_dir(&self) -> PathBuf {
        self.root().join("runs")
    }
}

fn fixture(tools: &[(&str, &str)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let tool_dir = dir.path().join("bin");
    fs::create_dir_all(&tool_dir).unwrap();
    for (name, body) in tools {
        let path = tool_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    fs::write(
        dir.path().join("reads.fastq"),
        "@read1\nACGTACGTAC\n+\nIIIIIIIIII\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.paths.runs_dir = dir.path().join("runs");
    config.paths.db_path = dir.path().join("runs/runs.db");
    config.paths.tool_dirs = vec![tool_dir];
    config.environment.conda_env = String::new();
    config.supervisor.cancel_poll_secs = 1;
    config.supervisor.kill_grace_secs = 1;

    let store = SqliteRunStore::open(&config.paths.db_path).unwrap();
    let engine = Engine::new(config, Arc::new(store), Arc::new(LogNotifier));
    Fixture { dir, engine }
}

fn selection(list: &str) -> ToolSelection {
    let params = RunParams {
        min_length: 1000,
        keep_percent: 90,
        ..RunParams::default()
    };
    ToolSelection::parse(list, params).unwrap()
}

async fn within<F: std::future::Future>(secs: u64, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("run did not finish in time")
}

#[tokio::test]
async fn test_filter_then_assemble_completes() {
    let fx = fixture(&[("seqkit", SEQKIT), ("filtlong", FILTLONG), ("flye", FLYE)]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("dedup-filter,assemble"), &fx.input())
        .await
        .unwrap();
    assert_eq!(
        submission.plan.stage_ids(),
        vec![StageId::DedupFilter, StageId::Assemble]
    );
    assert_eq!(
        submission.run_dir,
        fx.runs_dir().join(safe_owner(OWNER)).join(&submission.run_id)
    );

    let outcome = within(30, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Completed, "{:?}", outcome);

    let run_dir = &submission.run_dir;
    assert!(run_dir.join("PIPELINE_DONE").exists());
    assert!(!run_dir.join("PIPELINE_ABORTED").exists());
    assert!(run_dir.join("filtlong/filtered.fastq").exists());
    assert!(run_dir.join("flye/assembly.fasta").exists());

    let log = fs::read_to_string(run_dir.join("pipeline_output.log")).unwrap();
    assert!(log.contains("--min_length 1000 --keep_percent 90"));
    assert!(log.contains("PIPELINE FINISHED SUCCESSFULLY"));

    let report = fx.engine.status(OWNER, &submission.run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.source, StatusSource::Record);
    assert!(report.end_time.is_some());
}

#[tokio::test]
async fn test_assembly_dependency_is_rejected_before_anything_runs() {
    let fx = fixture(&[]);
    let err = fx
        .engine
        .submit(OWNER, &selection("align,polish,annotate,assess"), &fx.input())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        EngineError::Plan(PlanError::MissingAssembly { .. })
    ));
    assert!(!fx.runs_dir().join(safe_owner(OWNER)).exists());
    assert!(fx.engine.list(OWNER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_marker_stops_long_stage() {
    let fx = fixture(&[("flye", "sleep 60")]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("assemble"), &fx.input())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let outcome = fx
        .engine
        .cancel(OWNER, &submission.run_id, CancelMode::Cooperative)
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::Requested);

    let outcome = within(20, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Cancelled, "{:?}", outcome);
    assert!(submission.run_dir.join("PIPELINE_ABORTED").exists());
    assert!(!submission.run_dir.join("PIPELINE_DONE").exists());

    let report = fx.engine.status(OWNER, &submission.run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(
        fx.engine.read_log(OWNER, &submission.run_id).await.unwrap(),
        "PIPELINE ABORTED BY USER\nExecution stopped."
    );
}

#[tokio::test]
async fn test_forced_cancel_terminates_process_tree() {
    let fx = fixture(&[("flye", "sleep 60 & wait")]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("assemble"), &fx.input())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let outcome = fx
        .engine
        .cancel(OWNER, &submission.run_id, CancelMode::Forced)
        .await
        .unwrap();
    assert!(
        matches!(outcome, CancelOutcome::Terminated { .. }),
        "{:?}",
        outcome
    );

    let outcome = within(20, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Cancelled, "{:?}", outcome);
}

#[tokio::test]
async fn test_stage_failure_fails_run() {
    let fx = fixture(&[("flye", "echo 'flye: not enough reads' >&2; exit 3")]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("assemble"), &fx.input())
        .await
        .unwrap();

    let outcome = within(30, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code, Some(3));
    assert!(submission.run_dir.join("PIPELINE_ABORTED").exists());

    let log = fs::read_to_string(submission.run_dir.join("pipeline_output.log")).unwrap();
    assert!(log.contains("ABORTED (exit code 3): flye"));
    assert!(log.contains("not enough reads"));
}

#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let fx = fixture(&[("flye", FLYE)]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("assemble"), &fx.input())
        .await
        .unwrap();
    let outcome = within(30, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let cancel = fx
        .engine
        .cancel(OWNER, &submission.run_id, CancelMode::Forced)
        .await
        .unwrap();
    assert_eq!(
        cancel,
        CancelOutcome::AlreadyTerminal {
            status: RunStatus::Completed
        }
    );
    assert!(!submission.run_dir.join("CANCEL").exists());
    let report = fx.engine.status(OWNER, &submission.run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_status_heals_record_stuck_at_running() {
    let fx = fixture(&[]);
    let store = fx.engine.store().store();
    store.create_run("5e1f0001", OWNER, RunType::Pipeline).unwrap();
    store.mark_running("5e1f0001").unwrap();
    let run_dir = fx.runs_dir().join(safe_owner(OWNER)).join("5e1f0001");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(run_dir.join("PIPELINE_DONE"), "").unwrap();

    let first = fx.engine.status(OWNER, "5e1f0001").await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.source, StatusSource::Marker);
    assert_eq!(
        store.get_run("5e1f0001").unwrap().unwrap().status,
        RunStatus::Completed
    );

    let second = fx.engine.status(OWNER, "5e1f0001").await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.source, StatusSource::Record);

    let audit = fs::read_to_string(fx.runs_dir().join("audit.jsonl")).unwrap();
    assert_eq!(audit.lines().count(), 1);
    assert!(audit.contains("drift_healed"));
}

#[tokio::test]
async fn test_list_includes_directories_without_records() {
    let fx = fixture(&[("flye", FLYE)]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("assemble"), &fx.input())
        .await
        .unwrap();
    within(30, submission.handle.await_completion()).await;

    let legacy = fx.runs_dir().join(safe_owner(OWNER)).join("1e6ac042");
    fs::create_dir_all(&legacy).unwrap();
    fs::write(
        legacy.join("pipeline_output.log"),
        "STEP 1/1\nPIPELINE FINISHED SUCCESSFULLY\n",
    )
    .unwrap();

    let reports = fx.engine.list(OWNER).await.unwrap();
    assert_eq!(reports.len(), 2);
    let stored = reports
        .iter()
        .find(|r| r.run_id == submission.run_id)
        .unwrap();
    assert!(!stored.synthetic);
    assert_eq!(stored.status, RunStatus::Completed);

    let synthetic = reports.iter().find(|r| r.run_id == "1e6ac042").unwrap();
    assert!(synthetic.synthetic);
    assert_eq!(synthetic.status, RunStatus::Completed);
    assert_eq!(synthetic.source, StatusSource::LogSentinel);
    assert!(fx.engine.store().store().get_run("1e6ac042").unwrap().is_none());
}

#[tokio::test]
async fn test_delete_refuses_active_run_unless_forced() {
    let fx = fixture(&[]);
    let store = fx.engine.store().store();
    store.create_run("ac71e001", OWNER, RunType::Pipeline).unwrap();
    store.mark_running("ac71e001").unwrap();
    let run_dir = fx.runs_dir().join(safe_owner(OWNER)).join("ac71e001");
    fs::create_dir_all(&run_dir).unwrap();

    let err = fx.engine.delete(OWNER, "ac71e001", false).await.unwrap_err();
    assert!(matches!(err, EngineError::RunActive { .. }));
    assert!(run_dir.exists());

    fx.engine.delete(OWNER, "ac71e001", true).await.unwrap();
    assert!(!run_dir.exists());
    assert!(store.get_run("ac71e001").unwrap().is_none());
    assert!(matches!(
        fx.engine.status(OWNER, "ac71e001").await,
        Err(EngineError::RunNotFound { .. })
    ));
}

#[tokio::test]
async fn test_blast_run_completes() {
    let fx = fixture(&[("blastn", BLASTN)]);
    let db_dir = fx.root().join("db");
    fs::create_dir_all(&db_dir).unwrap();
    fs::write(db_dir.join("reference.nal"), "").unwrap();
    let query = fx.root().join("query.fa");
    fs::write(&query, ">q1\nACGTACGT\n").unwrap();

    let params = BlastParams {
        db_path: db_dir.join("reference"),
        ..BlastParams::default()
    };
    let submission = fx.engine.submit_blast(OWNER, &query, &params).await.unwrap();
    assert!(submission.run_id.starts_with("blast_"));

    let outcome = within(30, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Completed, "{:?}", outcome);
    assert!(submission.run_dir.join("BLAST_DONE").exists());
    assert!(submission.run_dir.join("query.fasta").exists());
    let hits = fs::read_to_string(submission.run_dir.join("blast_results.tsv")).unwrap();
    assert!(hits.starts_with("q1\ts1"));

    let log = fs::read_to_string(submission.run_dir.join("blast.log")).unwrap();
    assert!(log.contains("BLAST FINISHED SUCCESSFULLY"));

    let report = fx.engine.status(OWNER, &submission.run_id).await.unwrap();
    assert_eq!(report.run_type, RunType::Blast);
}

#[tokio::test]
async fn test_blast_without_database_fails() {
    let fx = fixture(&[("blastn", BLASTN)]);
    let query = fx.root().join("query.fa");
    fs::write(&query, ">q1\nACGT\n").unwrap();
    let params = BlastParams {
        db_path: fx.root().join("nowhere/reference"),
        ..BlastParams::default()
    };
    let submission = fx.engine.submit_blast(OWNER, &query, &params).await.unwrap();
    let outcome = within(30, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    let log = fs::read_to_string(submission.run_dir.join("blast.log")).unwrap();
    assert!(log.contains("Missing BLAST DB files"));
}

#[tokio::test]
async fn test_log_is_readable_while_run_is_going() {
    let fx = fixture(&[(
        "flye",
        "echo 'flye: assembling chunk 1'; sleep 4; echo 'flye: done'; exit 7",
    )]);
    let submission = fx
        .engine
        .submit(OWNER, &selection("assemble"), &fx.input())
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..60 {
        let text = fx.engine.read_log(OWNER, &submission.run_id).await.unwrap();
        if text.contains("assembling chunk 1") {
            assert!(!text.contains("flye: done"));
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(seen, "tool output should reach the log before the tool exits");
    let report = fx.engine.status(OWNER, &submission.run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Running);

    let outcome = within(30, submission.handle.await_completion()).await;
    assert_eq!(outcome.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_run_ids_cannot_escape_owner_directory() {
    let fx = fixture(&[]);
    let alice = "alice@lab.org";
    let store = fx.engine.store().store();
    store.create_run("abcd1234", alice, RunType::Pipeline).unwrap();
    store.mark_running("abcd1234").unwrap();
    let alice_run = fx.runs_dir().join(safe_owner(alice)).join("abcd1234");
    fs::create_dir_all(&alice_run).unwrap();
    fs::write(alice_run.join("pipeline_output.log"), "secret alice output\n").unwrap();

    for id in ["../alice_lab_org/abcd1234", "..", ".", "/etc", "abcd1234/.."] {
        let read = fx.engine.read_log("bob", id).await;
        assert!(
            matches!(read, Err(EngineError::InvalidRunId { .. })),
            "{:?}: {:?}",
            id,
            read
        );
        assert!(matches!(
            fx.engine.delete("bob", id, true).await,
            Err(EngineError::InvalidRunId { .. })
        ));
        assert!(matches!(
            fx.engine.cancel("bob", id, CancelMode::Forced).await,
            Err(EngineError::InvalidRunId { .. })
        ));
        assert!(matches!(
            fx.engine.status("bob", id).await,
            Err(EngineError::InvalidRunId { .. })
        ));
    }
    // A well-formed id still only resolves inside the caller's directory.
    assert!(matches!(
        fx.engine.read_log("bob", "abcd1234").await,
        Err(EngineError::RunNotFound { .. })
    ));

    assert!(alice_run.join("pipeline_output.log").exists());
    assert!(fx.runs_dir().join("runs.db").exists());
    assert!(!alice_run.join("CANCEL").exists());
    assert_eq!(
        store.get_run("abcd1234").unwrap().unwrap().status,
        RunStatus::Running
    );
}
