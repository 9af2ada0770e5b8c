//! Selection validation and plan composition.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use genepipe_common::RunType;
use serde::Serialize;

use super::catalog::{ArtifactKind, RunParams, StageId, StageInputs, ToolCommand, build_commands};
use crate::errors::PlanError;

/// Requested stages plus the parameters handed to the tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSelection {
    stages: BTreeSet<StageId>,
    pub params: RunParams,
}

impl ToolSelection {
    pub fn new(stages: impl IntoIterator<Item = StageId>, params: RunParams) -> Self {
        Self {
            stages: stages.into_iter().collect(),
            params,
        }
    }

    /// Parse a comma-separated list of stage ids or tool names.
    pub fn parse(list: &str, params: RunParams) -> Result<Self, PlanError> {
        let stages = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<BTreeSet<StageId>, _>>()?;
        Ok(Self { stages, params })
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.stages.contains(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Selected stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.stages.iter().copied()
    }
}

/// A stage bound to concrete paths inside one run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStage {
    pub id: StageId,
    /// Primary input (reads or contigs, per the catalog).
    pub input: PathBuf,
    pub commands: Vec<ToolCommand>,
    pub subdirs: Vec<PathBuf>,
    pub artifact: PathBuf,
}

/// A check the script runs before the first stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Preflight {
    /// At least one of `candidates` must exist, else abort with `message`.
    AnyExists {
        candidates: Vec<PathBuf>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub run_type: RunType,
    pub run_dir: PathBuf,
    pub raw_input: PathBuf,
    pub preflight: Vec<Preflight>,
    pub stages: Vec<PlannedStage>,
}

impl ExecutionPlan {
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }
}

/// Validate `selection` and bind it to `run_dir`.
///
/// Stages keep the fixed catalog order. Each stage reads the output of the
/// nearest earlier selected stage producing the kind it consumes, or
/// `raw_input` when there is none.
pub fn compose(
    selection: &ToolSelection,
    run_dir: &Path,
    raw_input: &Path,
) -> Result<ExecutionPlan, PlanError> {
    if selection.is_empty() {
        return Err(PlanError::EmptySelection);
    }
    if selection.contains(StageId::Blast) {
        return Err(PlanError::UnknownTool(StageId::Blast.to_string()));
    }
    if !selection.contains(StageId::Assemble) {
        let requested: Vec<String> = selection
            .stages()
            .filter(StageId::requires_assembly)
            .map(|s| s.spec().tool.to_string())
            .collect();
        if !requested.is_empty() {
            return Err(PlanError::MissingAssembly { requested });
        }
    }
    selection.params.validate()?;

    let mut inputs = StageInputs {
        raw: raw_input.to_path_buf(),
        reads: raw_input.to_path_buf(),
        contigs: None,
        alignment: None,
    };
    let mut stages = Vec::new();

    for id in selection.stages() {
        let spec = id.spec();
        let commands = build_commands(id, &inputs, &selection.params, run_dir).ok_or_else(|| {
            PlanError::MissingAssembly {
                requested: vec![spec.tool.to_string()],
            }
        })?;
        let input = match spec.consumes {
            ArtifactKind::Contigs => inputs.contigs.clone().unwrap_or_else(|| inputs.raw.clone()),
            _ => inputs.reads.clone(),
        };
        let artifact = run_dir.join(spec.artifact);

        match spec.produces {
            ArtifactKind::Reads => inputs.reads = artifact.clone(),
            ArtifactKind::Contigs => inputs.contigs = Some(artifact.clone()),
            ArtifactKind::Alignment => inputs.alignment = Some(artifact.clone()),
            ArtifactKind::Report => {}
        }

        stages.push(PlannedStage {
            id,
            input,
            commands,
            subdirs: spec.subdirs.iter().map(|d| run_dir.join(d)).collect(),
            artifact,
        });
    }

    Ok(ExecutionPlan {
        run_type: RunType::Pipeline,
        run_dir: run_dir.to_path_buf(),
        raw_input: raw_input.to_path_buf(),
        preflight: Vec::new(),
        stages,
    })
}
