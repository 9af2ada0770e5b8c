//! Run inspection and control: status, logs, cancel, list, delete.

use anyhow::Result;
use std::process::ExitCode;
use std::time::Duration;

use genepipe::config::Config;
use genepipe::engine::{CancelMode, CancelOutcome, Engine, RunReport, WAITING_MESSAGE};
use genepipe::run::CancelState;

use super::super::Cli;
use super::styled_status;

fn fmt_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| {
        t.with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_else(|| "-".to_string())
}

pub async fn cmd_status(cli: &Cli, config: Config, run_id: &str) -> Result<ExitCode> {
    let engine = Engine::from_config(config)?;
    let report = engine.status(&cli.owner, run_id).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!("Run:       {}", console::style(&report.run_id).bold());
    println!("Type:      {}", report.run_type);
    println!("Status:    {}", styled_status(report.status));
    println!("Started:   {}", fmt_time(report.start_time));
    println!("Finished:  {}", fmt_time(report.end_time));
    println!("Directory: {}", report.run_dir.display());
    if report.synthetic {
        println!(
            "           {}",
            console::style("(no stored record; status from run directory)").dim()
        );
    }
    if report.cancel_state != CancelState::Active {
        println!("Cancel:    {}", report.cancel_state.as_str());
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

pub async fn cmd_logs(cli: &Cli, config: Config, run_id: &str, follow: bool) -> Result<ExitCode> {
    let engine = Engine::from_config(config)?;
    if !follow {
        println!("{}", engine.read_log(&cli.owner, run_id).await?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut printed = 0usize;
    loop {
        let text = engine.read_log(&cli.owner, run_id).await?;
        if text != WAITING_MESSAGE {
            if text.len() < printed {
                // Replaced by the cancellation banner or a rewritten log.
                printed = 0;
            }
            print!("{}", unseen(&text, printed));
            printed = text.len();
        }
        let report = engine.status(&cli.owner, run_id).await?;
        if report.status.is_terminal() {
            println!();
            println!("Run {} {}", run_id, styled_status(report.status));
            return Ok(ExitCode::SUCCESS);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// The part of `text` after the first `printed` bytes. A lossy re-read can
/// shift a boundary into a multi-byte character; back up to the start of it
/// rather than drop the rest.
fn unseen(text: &str, printed: usize) -> &str {
    let mut start = printed.min(text.len());
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    &text[start..]
}

pub async fn cmd_cancel(
    cli: &Cli,
    config: Config,
    run_id: &str,
    force: bool,
    wait: bool,
) -> Result<ExitCode> {
    let mode = if force {
        CancelMode::Forced
    } else if wait {
        CancelMode::Graceful
    } else {
        CancelMode::Cooperative
    };
    let engine = Engine::from_config(config)?;
    let outcome = engine.cancel(&cli.owner, run_id, mode).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(ExitCode::SUCCESS);
    }
    match outcome {
        CancelOutcome::AlreadyTerminal { status } => {
            println!("Run {} already finished ({})", run_id, styled_status(status));
        }
        CancelOutcome::Requested => {
            println!(
                "{}",
                console::style("Cancel requested; the run stops at its next check.").yellow()
            );
        }
        CancelOutcome::Stopped => println!("Run {} stopped", run_id),
        CancelOutcome::Terminated { termination } => {
            println!(
                "Run {} terminated ({} processes signalled, {} killed)",
                run_id,
                termination.signalled.len(),
                termination.killed.len()
            );
        }
        CancelOutcome::NoProcess => {
            println!("Run {} marked cancelled; no running process was found", run_id);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_table(reports: &[RunReport]) {
    println!(
        "{:<32} {:<9} {:<10} {:<20} Source",
        "Run", "Type", "Status", "Started"
    );
    println!(
        "{:<32} {:<9} {:<10} {:<20} ------",
        "-".repeat(32),
        "-".repeat(9),
        "-".repeat(10),
        "-".repeat(20)
    );
    for report in reports {
        println!(
            "{:<32} {:<9} {:<10} {:<20} {}",
            report.run_id,
            report.run_type.as_str(),
            styled_status(report.status),
            fmt_time(report.start_time),
            if report.synthetic { "directory" } else { "record" }
        );
    }
}

pub async fn cmd_list(cli: &Cli, config: Config) -> Result<ExitCode> {
    let engine = Engine::from_config(config)?;
    let reports = engine.list(&cli.owner).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(ExitCode::SUCCESS);
    }
    if reports.is_empty() {
        println!("No runs found for {}", cli.owner);
        return Ok(ExitCode::SUCCESS);
    }
    println!();
    print_table(&reports);
    println!();
    println!("{} runs", reports.len());
    Ok(ExitCode::SUCCESS)
}

pub async fn cmd_delete(
    cli: &Cli,
    config: Config,
    run_id: &str,
    yes: bool,
    force: bool,
) -> Result<ExitCode> {
    use dialoguer::Confirm;

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!("Delete run {} and all of its files?", run_id))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Delete cancelled");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let engine = Engine::from_config(config)?;
    engine.delete(&cli.owner, run_id, force).await?;
    println!("Deleted run {}", run_id);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_backs_up_to_char_boundary() {
        let text = "step 1\nassembled 5 µm contigs\n";
        let inside = text.find('µ').unwrap() + 1;
        assert_eq!(unseen(text, inside), "µm contigs\n");
        assert_eq!(unseen(text, 7), "assembled 5 µm contigs\n");
        assert_eq!(unseen(text, text.len()), "");
        assert_eq!(unseen(text, text.len() + 10), "");
    }
}
