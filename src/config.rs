//! Configuration loaded from `genepipe.toml`.
//!
//! Layering: file, then `.env` and process environment (`GENEPIPE_*`), then
//! CLI flags applied by the command handlers.
//!
//! ```toml
//! [paths]
//! runs_dir = "pipeline_runs"
//! db_path = "pipeline_runs/runs.db"
//! tool_dirs = []
//!
//! [environment]
//! conda_env = "pipeline"
//! shell = "bash"
//!
//! [supervisor]
//! cancel_poll_secs = 1
//! kill_grace_secs = 2
//! log_tail_bytes = 65536
//!
//! [defaults]
//! genome_size = "5m"
//! threads = 8
//! min_length = 1000
//! keep_percent = 90
//!
//! [blast]
//! db_path = "blast_db/reference"
//! threads = 4
//! max_hits = 10
//! task = "blastn"
//!
//! [notify]
//! command = ""
//! timeout_secs = 10
//!
//! [logging]
//! dir = ""
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::{BlastParams, RunParams, ScriptOptions};

pub const DEFAULT_CONFIG_FILE: &str = "genepipe.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Prepended to `PATH` inside generated scripts.
    #[serde(default)]
    pub tool_dirs: Vec<PathBuf>,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("pipeline_runs")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pipeline_runs/runs.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            db_path: default_db_path(),
            tool_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Empty disables conda activation.
    #[serde(default = "default_conda_env")]
    pub conda_env: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_conda_env() -> String {
    "pipeline".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            conda_env: default_conda_env(),
            shell: default_shell(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_cancel_poll_secs")]
    pub cancel_poll_secs: u64,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// How much of the end of a log the reconciler scans.
    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: u64,
}

fn default_cancel_poll_secs() -> u64 {
    1
}

fn default_kill_grace_secs() -> u64 {
    2
}

fn default_log_tail_bytes() -> u64 {
    64 * 1024
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cancel_poll_secs: default_cancel_poll_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            log_tail_bytes: default_log_tail_bytes(),
        }
    }
}

/// Default assembly parameters; each can be overridden per submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_genome_size")]
    pub genome_size: String,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_min_length")]
    pub min_length: u64,
    #[serde(default = "default_keep_percent")]
    pub keep_percent: u8,
}

fn default_genome_size() -> String {
    "5m".to_string()
}

fn default_threads() -> u32 {
    8
}

fn default_min_length() -> u64 {
    1000
}

fn default_keep_percent() -> u8 {
    90
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            genome_size: default_genome_size(),
            threads: default_threads(),
            min_length: default_min_length(),
            keep_percent: default_keep_percent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastConfig {
    #[serde(default = "default_blast_db")]
    pub db_path: PathBuf,
    #[serde(default = "default_blast_threads")]
    pub threads: u32,
    #[serde(default = "default_max_hits")]
    pub max_hits: u32,
    #[serde(default = "default_blast_task")]
    pub task: String,
}

fn default_blast_db() -> PathBuf {
    PathBuf::from("blast_db/reference")
}

fn default_blast_threads() -> u32 {
    4
}

fn default_max_hits() -> u32 {
    10
}

fn default_blast_task() -> String {
    "blastn".to_string()
}

impl Default for BlastConfig {
    fn default() -> Self {
        Self {
            db_path: default_blast_db(),
            threads: default_blast_threads(),
            max_hits: default_max_hits(),
            task: default_blast_task(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Shell command run per lifecycle event; empty disables.
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    10
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; empty disables.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub blast: BlastConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse genepipe.toml")
    }

    /// Load `path` if it exists (defaults otherwise), then apply `.env` and
    /// `GENEPIPE_*` overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize genepipe.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GENEPIPE_RUNS_DIR") {
            self.paths.runs_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GENEPIPE_DB_PATH") {
            self.paths.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GENEPIPE_TOOL_DIRS") {
            self.paths.tool_dirs = std::env::split_paths(&v).collect();
        }
        if let Some(v) = lookup("GENEPIPE_CONDA_ENV") {
            self.environment.conda_env = v;
        }
        if let Some(v) = lookup("GENEPIPE_NOTIFY_COMMAND") {
            self.notify.command = v;
        }
        if let Some(v) = lookup("GENEPIPE_LOG_DIR") {
            self.logging.dir = v;
        }
    }

    pub fn audit_path(&self) -> PathBuf {
        self.paths.runs_dir.join("audit.jsonl")
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_secs(self.supervisor.cancel_poll_secs.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.kill_grace_secs)
    }

    pub fn script_options(&self) -> ScriptOptions {
        let conda = self.environment.conda_env.trim();
        ScriptOptions {
            conda_env: (!conda.is_empty()).then(|| conda.to_string()),
            tool_dirs: self.paths.tool_dirs.clone(),
            cancel_poll: self.cancel_poll(),
            kill_grace: self.kill_grace(),
            cancellable: true,
        }
    }

    pub fn run_params(&self) -> RunParams {
        RunParams {
            genome_size: self.defaults.genome_size.clone(),
            threads: self.defaults.threads,
            min_length: self.defaults.min_length,
            keep_percent: self.defaults.keep_percent,
        }
    }

    pub fn blast_params(&self) -> BlastParams {
        BlastParams {
            db_path: self.blast.db_path.clone(),
            threads: self.blast.threads,
            max_hits: self.blast.max_hits,
            task: self.blast.task.clone(),
        }
    }

    /// Problems worth reporting before anything runs.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if let Err(e) = self.run_params().validate() {
            issues.push(format!("[defaults] {}", e));
        }
        if self.blast.threads == 0 {
            issues.push("[blast] threads must be at least 1".to_string());
        }
        if self.supervisor.cancel_poll_secs == 0 {
            issues.push("[supervisor] cancel_poll_secs of 0 is treated as 1".to_string());
        }
        if self.environment.shell.trim().is_empty() {
            issues.push("[environment] shell must not be empty".to_string());
        }
        issues
    }
}
