use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use genepipe::config::{Config, DEFAULT_CONFIG_FILE, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "genepipe")]
#[command(version, about = "Run orchestration for long-read assembly pipelines")]
pub struct Cli {
    /// Path to genepipe.toml
    #[arg(long, global = true, env = "GENEPIPE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Identity that owns the runs (directory names use @ and . replaced by _)
    #[arg(long, global = true, env = "GENEPIPE_OWNER", default_value = "local")]
    pub owner: String,

    /// Diagnostic log format on stderr: pretty or json. Overrides [logging] format.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default genepipe.toml and create the runs directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the assembly pipeline on a reads file and supervise it to completion
    Submit {
        /// Raw reads (FASTQ)
        #[arg(short, long)]
        input: PathBuf,
        /// Comma-separated stages or tool names, e.g. trim,filter,flye,prokka
        #[arg(short, long)]
        tools: String,
        /// Expected genome size for the assembler, e.g. 5m
        #[arg(long)]
        genome_size: Option<String>,
        #[arg(long)]
        threads: Option<u32>,
        /// Minimum read length kept by the filter
        #[arg(long)]
        min_length: Option<u64>,
        /// Percentage of bases kept by the filter
        #[arg(long)]
        keep_percent: Option<u8>,
    },
    /// Run a BLAST search of a FASTA query and supervise it to completion
    Blast {
        /// Query sequences (FASTA)
        #[arg(short, long)]
        query: PathBuf,
        /// BLAST database prefix
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        threads: Option<u32>,
        #[arg(long)]
        max_hits: Option<u32>,
        /// blastn task (blastn, megablast, dc-megablast)
        #[arg(long)]
        task: Option<String>,
    },
    /// Show the reconciled status of a run
    Status { run_id: String },
    /// Print a run's log
    Logs {
        run_id: String,
        /// Keep printing new output until the run finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Cancel a run
    Cancel {
        run_id: String,
        /// Terminate the process tree immediately
        #[arg(long, conflicts_with = "wait")]
        force: bool,
        /// Wait for the script to stop; terminate it if it does not
        #[arg(long)]
        wait: bool,
    },
    /// List runs, including run directories without a record
    List,
    /// Delete a run directory and its record
    Delete {
        run_id: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
        /// Cancel the run first if it is still active
        #[arg(long)]
        force: bool,
    },
    /// Check configuration and tool availability
    Doctor,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        cmd::cmd_init(&cli.config, *force)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let format = cli.log_format.unwrap_or(config.logging.format);
    let _guard = genepipe::logging::init(&config.logging, format)?;

    let code = match &cli.command {
        Commands::Init { .. } => ExitCode::SUCCESS,
        Commands::Submit {
            input,
            tools,
            genome_size,
            threads,
            min_length,
            keep_percent,
        } => {
            let mut params = config.run_params();
            if let Some(v) = genome_size {
                params.genome_size = v.clone();
            }
            if let Some(v) = threads {
                params.threads = *v;
            }
            if let Some(v) = min_length {
                params.min_length = *v;
            }
            if let Some(v) = keep_percent {
                params.keep_percent = *v;
            }
            cmd::cmd_submit(&cli, config, input, tools, params).await?
        }
        Commands::Blast {
            query,
            db,
            threads,
            max_hits,
            task,
        } => {
            let mut params = config.blast_params();
            if let Some(v) = db {
                params.db_path = v.clone();
            }
            if let Some(v) = threads {
                params.threads = *v;
            }
            if let Some(v) = max_hits {
                params.max_hits = *v;
            }
            if let Some(v) = task {
                params.task = v.clone();
            }
            cmd::cmd_blast(&cli, config, query, params).await?
        }
        Commands::Status { run_id } => cmd::cmd_status(&cli, config, run_id).await?,
        Commands::Logs { run_id, follow } => cmd::cmd_logs(&cli, config, run_id, *follow).await?,
        Commands::Cancel {
            run_id,
            force,
            wait,
        } => cmd::cmd_cancel(&cli, config, run_id, *force, *wait).await?,
        Commands::List => cmd::cmd_list(&cli, config).await?,
        Commands::Delete { run_id, yes, force } => {
            cmd::cmd_delete(&cli, config, run_id, *yes, *force).await?
        }
        Commands::Doctor => cmd::cmd_doctor(&cli, &config)?,
    };

    Ok(code)
}
