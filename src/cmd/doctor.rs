//! `genepipe doctor`: configuration and tool checks.

use anyhow::Result;
use std::process::ExitCode;

use genepipe::config::Config;
use genepipe::diagnostics::check_tools;

use super::super::Cli;

pub fn cmd_doctor(cli: &Cli, config: &Config) -> Result<ExitCode> {
    let checks = check_tools(&config.paths.tool_dirs);
    let issues = config.validate();

    if cli.json {
        let report = serde_json::json!({
            "config": cli.config,
            "config_found": cli.config.exists(),
            "runs_dir": config.paths.runs_dir,
            "db_path": config.paths.db_path,
            "tools": checks,
            "issues": issues,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!("{}", console::style("genepipe doctor").bold().cyan());
    println!();
    let config_state = if cli.config.exists() {
        "found"
    } else {
        "not found, using defaults"
    };
    println!("Config:    {} ({})", cli.config.display(), config_state);
    println!("Runs dir:  {}", config.paths.runs_dir.display());
    println!("Database:  {}", config.paths.db_path.display());
    match config.script_options().conda_env {
        Some(env) => println!("Conda env: {}", env),
        None => println!("Conda env: {}", console::style("disabled").dim()),
    }
    println!();

    println!("Tools:");
    for check in &checks {
        match &check.path {
            Some(path) => println!(
                "  {} {:<10} {}",
                console::style("✓").green(),
                check.name,
                path.display()
            ),
            None => println!(
                "  {} {:<10} {}",
                console::style("✗").red(),
                check.name,
                console::style("not on PATH (may still come from conda)").dim()
            ),
        }
    }

    if !issues.is_empty() {
        println!();
        println!("{}", console::style("Config issues:").yellow().bold());
        for issue in &issues {
            println!("  - {}", issue);
        }
    }
    println!();
    let missing = checks.iter().filter(|c| !c.found()).count();
    println!("{} of {} tools found", checks.len() - missing, checks.len());
    Ok(ExitCode::SUCCESS)
}
