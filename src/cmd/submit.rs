//! `genepipe submit` and `genepipe blast`: launch a run and supervise it in
//! the foreground.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use genepipe::config::Config;
use genepipe::engine::{CancelMode, Engine, Submission};
use genepipe::pipeline::{BlastParams, RunParams, ToolSelection};
use genepipe_common::RunStatus;

use super::super::Cli;
use super::styled_status;

pub async fn cmd_submit(
    cli: &Cli,
    config: Config,
    input: &Path,
    tools: &str,
    params: RunParams,
) -> Result<ExitCode> {
    let selection = ToolSelection::parse(tools, params)?;
    let engine = Engine::from_config(config)?;
    let submission = engine.submit(&cli.owner, &selection, input).await?;

    println!("Run {} started", console::style(&submission.run_id).bold());
    println!("  Directory: {}", submission.run_dir.display());
    let stages: Vec<String> = submission
        .plan
        .stage_ids()
        .iter()
        .map(|s| s.to_string())
        .collect();
    println!("  Stages:    {}", stages.join(" -> "));
    supervise(cli, &engine, submission).await
}

pub async fn cmd_blast(
    cli: &Cli,
    config: Config,
    query: &Path,
    params: BlastParams,
) -> Result<ExitCode> {
    let engine = Engine::from_config(config)?;
    let submission = engine.submit_blast(&cli.owner, query, &params).await?;

    println!("BLAST run {} started", console::style(&submission.run_id).bold());
    println!("  Directory: {}", submission.run_dir.display());
    println!("  Database:  {}", params.db_path.display());
    supervise(cli, &engine, submission).await
}

/// Wait for the run. The first Ctrl-C asks the script to stop and keeps
/// waiting for it to do so.
async fn supervise(cli: &Cli, engine: &Engine, submission: Submission) -> Result<ExitCode> {
    println!(
        "  Follow with: genepipe logs --follow {}",
        submission.run_id
    );
    println!();

    let outcome = tokio::select! {
        outcome = submission.handle.await_completion() => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", console::style("Interrupted; cancelling run...").yellow());
            engine
                .cancel(&cli.owner, &submission.run_id, CancelMode::Graceful)
                .await?;
            submission.handle.await_completion().await
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!(
            "Run {} finished: {}",
            outcome.run_id,
            styled_status(outcome.status)
        );
        if let Some(code) = outcome.exit_code.filter(|c| *c != 0) {
            println!("  Script exit code: {}", code);
        }
        if let Some(error) = &outcome.error {
            println!("  {} {}", console::style("Error:").red().bold(), error);
        }
    }

    Ok(if outcome.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
