//! Static table of the tools a run can chain together.
//!
//! Every stage has a fixed argument shape. Builders return argument vectors;
//! nothing here ever joins arguments into a shell string.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::PlanError;

/// Stage identifiers in topological order. The derived `Ord` is that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Trim,
    DedupFilter,
    Assemble,
    Align,
    Polish,
    QualityCheck,
    Annotate,
    Assess,
    /// Alignment search; only ever planned on its own by the BLAST composer.
    Blast,
}

impl StageId {
    /// Stages selectable in a pipeline run, in execution order.
    pub const PIPELINE: [StageId; 8] = [
        StageId::Trim,
        StageId::DedupFilter,
        StageId::Assemble,
        StageId::Align,
        StageId::Polish,
        StageId::QualityCheck,
        StageId::Annotate,
        StageId::Assess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trim => "trim",
            Self::DedupFilter => "dedup-filter",
            Self::Assemble => "assemble",
            Self::Align => "align",
            Self::Polish => "polish",
            Self::QualityCheck => "quality-check",
            Self::Annotate => "annotate",
            Self::Assess => "assess",
            Self::Blast => "blast",
        }
    }

    /// Stages that are meaningless without contigs.
    pub fn requires_assembly(&self) -> bool {
        matches!(
            self,
            Self::Align | Self::Polish | Self::Annotate | Self::Assess
        )
    }

    pub fn spec(&self) -> &'static StageSpec {
        match self {
            Self::Trim => &TRIM,
            Self::DedupFilter => &DEDUP_FILTER,
            Self::Assemble => &ASSEMBLE,
            Self::Align => &ALIGN,
            Self::Polish => &POLISH,
            Self::QualityCheck => &QUALITY_CHECK,
            Self::Annotate => &ANNOTATE,
            Self::Assess => &ASSESS,
            Self::Blast => &BLAST,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the stage id or the name of the tool behind it.
impl FromStr for StageId {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trim" | "porechop" => Ok(Self::Trim),
            "dedup-filter" | "dedup" | "filter" | "filtlong" | "seqkit" => Ok(Self::DedupFilter),
            "assemble" | "flye" => Ok(Self::Assemble),
            "align" | "minimap2" => Ok(Self::Align),
            "polish" | "racon" => Ok(Self::Polish),
            "quality-check" | "qc" | "fastqc" => Ok(Self::QualityCheck),
            "annotate" | "prokka" => Ok(Self::Annotate),
            "assess" | "quast" => Ok(Self::Assess),
            _ => Err(PlanError::UnknownTool(s.to_string())),
        }
    }
}

/// What a stage consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Reads,
    Contigs,
    Alignment,
    Report,
}

/// Immutable description of one catalog entry.
#[derive(Debug)]
pub struct StageSpec {
    pub id: StageId,
    /// Tool name shown in logs and validation messages.
    pub tool: &'static str,
    /// Every executable the stage may invoke.
    pub executables: &'static [&'static str],
    /// Subdirectories of the run directory the stage writes into.
    pub subdirs: &'static [&'static str],
    pub consumes: ArtifactKind,
    pub produces: ArtifactKind,
    /// Declared artifact, relative to the run directory.
    pub artifact: &'static str,
}

static TRIM: StageSpec = StageSpec {
    id: StageId::Trim,
    tool: "porechop",
    executables: &["porechop"],
    subdirs: &["porechop"],
    consumes: ArtifactKind::Reads,
    produces: ArtifactKind::Reads,
    artifact: "porechop/trimmed.fastq",
};

static DEDUP_FILTER: StageSpec = StageSpec {
    id: StageId::DedupFilter,
    tool: "filtlong",
    executables: &["seqkit", "filtlong"],
    subdirs: &["dedup", "filtlong"],
    consumes: ArtifactKind::Reads,
    produces: ArtifactKind::Reads,
    artifact: "filtlong/filtered.fastq",
};

static ASSEMBLE: StageSpec = StageSpec {
    id: StageId::Assemble,
    tool: "flye",
    executables: &["flye"],
    subdirs: &["flye"],
    consumes: ArtifactKind::Reads,
    produces: ArtifactKind::Contigs,
    artifact: "flye/assembly.fasta",
};

static ALIGN: StageSpec = StageSpec {
    id: StageId::Align,
    tool: "minimap2",
    executables: &["minimap2"],
    subdirs: &["minimap2"],
    consumes: ArtifactKind::Contigs,
    produces: ArtifactKind::Alignment,
    artifact: "minimap2/reads.paf",
};

static POLISH: StageSpec = StageSpec {
    id: StageId::Polish,
    tool: "racon",
    executables: &["minimap2", "racon"],
    subdirs: &["racon"],
    consumes: ArtifactKind::Contigs,
    produces: ArtifactKind::Contigs,
    artifact: "racon/polished.fasta",
};

static QUALITY_CHECK: StageSpec = StageSpec {
    id: StageId::QualityCheck,
    tool: "fastqc",
    executables: &["fastqc"],
    subdirs: &["fastqc/raw", "fastqc/filtered"],
    consumes: ArtifactKind::Reads,
    produces: ArtifactKind::Report,
    artifact: "fastqc/raw",
};

static ANNOTATE: StageSpec = StageSpec {
    id: StageId::Annotate,
    tool: "prokka",
    executables: &["prokka"],
    subdirs: &["prokka"],
    consumes: ArtifactKind::Contigs,
    produces: ArtifactKind::Report,
    artifact: "prokka/genome.gff",
};

static ASSESS: StageSpec = StageSpec {
    id: StageId::Assess,
    tool: "quast",
    executables: &["quast"],
    subdirs: &["quast"],
    consumes: ArtifactKind::Contigs,
    produces: ArtifactKind::Report,
    artifact: "quast/report.txt",
};

static BLAST: StageSpec = StageSpec {
    id: StageId::Blast,
    tool: "blastn",
    executables: &["blastn"],
    subdirs: &[],
    consumes: ArtifactKind::Reads,
    produces: ArtifactKind::Report,
    artifact: "blast_results.tsv",
};

/// Every executable referenced by any catalog entry, deduplicated, in
/// catalog order.
pub fn all_executables() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for id in StageId::PIPELINE.iter().chain(std::iter::once(&StageId::Blast)) {
        for exe in id.spec().executables {
            if !names.contains(exe) {
                names.push(exe);
            }
        }
    }
    names
}

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Redirect stdout to this file (tools that write their result to stdout).
    pub stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub(crate) fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdout: None,
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub(crate) fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout = Some(path);
        self
    }

    /// Argument vector including the program name.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// Numeric knobs passed through to the tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub genome_size: String,
    pub threads: u32,
    pub min_length: u64,
    pub keep_percent: u8,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            genome_size: "5m".to_string(),
            threads: 8,
            min_length: 1000,
            keep_percent: 90,
        }
    }
}

impl RunParams {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.threads == 0 {
            return Err(PlanError::InvalidParameter {
                name: "threads",
                message: "must be at least 1".to_string(),
            });
        }
        if self.keep_percent == 0 || self.keep_percent > 100 {
            return Err(PlanError::InvalidParameter {
                name: "keep_percent",
                message: format!("{} is outside 1..=100", self.keep_percent),
            });
        }
        let size = self.genome_size.trim();
        let digits = size.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
        let positive = digits.parse::<f64>().is_ok_and(|v| v.is_finite() && v > 0.0);
        if !positive {
            return Err(PlanError::InvalidParameter {
                name: "genome_size",
                message: format!("'{}' is not a size like 5m or 4.6m", self.genome_size),
            });
        }
        Ok(())
    }
}

/// Resolved inputs for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInputs {
    /// The raw input file as copied into the run directory.
    pub raw: PathBuf,
    /// Nearest earlier reads artifact (raw input if none).
    pub reads: PathBuf,
    /// Nearest earlier contigs artifact.
    pub contigs: Option<PathBuf>,
    /// Alignment produced by the align stage, if selected.
    pub alignment: Option<PathBuf>,
}

/// Build the commands for `stage`. `run_dir` is absolute.
///
/// Returns `None` only when a contigs-consuming stage has no contigs, which
/// the plan composer rules out before calling this.
pub fn build_commands(
    stage: StageId,
    inputs: &StageInputs,
    params: &RunParams,
    run_dir: &Path,
) -> Option<Vec<ToolCommand>> {
    let at = |rel: &str| run_dir.join(rel);
    let threads = params.threads.to_string();
    let commands = match stage {
        StageId::Trim => vec![
            ToolCommand::new("porechop")
                .arg("-i")
                .path(&inputs.reads)
                .arg("-o")
                .path(&at(TRIM.artifact)),
        ],
        StageId::DedupFilter => {
            let dedup = at("dedup/dedup.fastq");
            vec![
                ToolCommand::new("seqkit")
                    .arg("rename")
                    .path(&inputs.reads)
                    .arg("-o")
                    .path(&dedup),
                ToolCommand::new("filtlong")
                    .arg("--min_length")
                    .arg(params.min_length.to_string())
                    .arg("--keep_percent")
                    .arg(params.keep_percent.to_string())
                    .path(&dedup)
                    .stdout_to(at(DEDUP_FILTER.artifact)),
            ]
        }
        StageId::Assemble => vec![
            ToolCommand::new("flye")
                .arg("--nano-raw")
                .path(&inputs.reads)
                .arg("--out-dir")
                .path(&at("flye"))
                .arg("--threads")
                .arg(threads)
                .arg("--genome-size")
                .arg(params.genome_size.clone()),
        ],
        StageId::Align => {
            let contigs = inputs.contigs.as_ref()?;
            vec![minimap2(&threads, contigs, &inputs.reads, at(ALIGN.artifact))]
        }
        StageId::Polish => {
            let contigs = inputs.contigs.as_ref()?;
            let mut commands = Vec::new();
            let paf = match &inputs.alignment {
                Some(paf) => paf.clone(),
                None => {
                    let paf = at("racon/reads.paf");
                    commands.push(minimap2(&threads, contigs, &inputs.reads, paf.clone()));
                    paf
                }
            };
            commands.push(
                ToolCommand::new("racon")
                    .arg("-t")
                    .arg(threads)
                    .path(&inputs.reads)
                    .path(&paf)
                    .path(contigs)
                    .stdout_to(at(POLISH.artifact)),
            );
            commands
        }
        StageId::QualityCheck => {
            let mut commands = vec![
                ToolCommand::new("fastqc")
                    .path(&inputs.raw)
                    .arg("-o")
                    .path(&at("fastqc/raw")),
            ];
            if inputs.reads != inputs.raw {
                commands.push(
                    ToolCommand::new("fastqc")
                        .path(&inputs.reads)
                        .arg("-o")
                        .path(&at("fastqc/filtered")),
                );
            }
            commands
        }
        StageId::Annotate => {
            let contigs = inputs.contigs.as_ref()?;
            vec![
                ToolCommand::new("prokka")
                    .arg("--outdir")
                    .path(&at("prokka"))
                    .arg("--force")
                    .arg("--prefix")
                    .arg("genome")
                    .path(contigs),
            ]
        }
        StageId::Assess => {
            let contigs = inputs.contigs.as_ref()?;
            vec![
                ToolCommand::new("quast")
                    .path(contigs)
                    .arg("-o")
                    .path(&at("quast")),
            ]
        }
        // Built by the BLAST composer, which owns the database parameters.
        StageId::Blast => return None,
    };
    Some(commands)
}

fn minimap2(threads: &str, contigs: &Path, reads: &Path, out: PathBuf) -> ToolCommand {
    ToolCommand::new("minimap2")
        .arg("-t")
        .arg(threads)
        .arg("-x")
        .arg("map-ont")
        .path(contigs)
        .path(reads)
        .stdout_to(out)
}
