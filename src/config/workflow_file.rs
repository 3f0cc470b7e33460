use super::ConfigError;
use crate::orchestration::context::CONTEXT_FIELDS;
use crate::orchestration::registry::UnitRegistry;
use crate::shared::ids::{UnitName, WorkflowName};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// How a step is scheduled relative to its neighbours.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    Sequential,
    Parallel,
    Background,
    /// Kept verbatim so the runner can warn about it; executed sequentially.
    Unrecognized(String),
}

impl StepMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" => Self::Sequential,
            "parallel" => Self::Parallel,
            "background" => Self::Background,
            _ => Self::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Background => "background",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl std::fmt::Display for StepMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StepMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StepMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepDefinition {
    pub unit: UnitName,
    #[serde(default)]
    pub mode: StepMode,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
}

impl StepDefinition {
    pub fn new(unit: UnitName, mode: StepMode) -> Self {
        Self {
            unit,
            mode,
            input_mapping: BTreeMap::new(),
        }
    }

    pub fn with_mapping(mut self, target: &str, source: &str) -> Self {
        self.input_mapping
            .insert(target.to_string(), source.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    pub name: WorkflowName,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDefinition>,
}

pub fn parse_workflow_yaml(raw: &str, origin: &str) -> Result<WorkflowDefinition, ConfigError> {
    serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })
}

pub fn load_workflow_from_path(path: &Path) -> Result<WorkflowDefinition, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_workflow_yaml(&raw, &path.display().to_string())
}

/// Load every `*.yaml` / `*.yml` workflow under `dir`, validated against `registry`.
///
/// Any malformed file or bad reference fails the whole load.
pub fn load_workflows_from_dir(
    dir: &Path,
    registry: &UnitRegistry,
) -> Result<BTreeMap<WorkflowName, WorkflowDefinition>, ConfigError> {
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::ReadDir {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::ReadDir {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        if path.is_file() && is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut workflows = BTreeMap::new();
    for path in paths {
        let workflow = load_workflow_from_path(&path)?;
        validate_workflow(&workflow, registry)?;
        if workflows.contains_key(&workflow.name) {
            return Err(ConfigError::DuplicateWorkflow {
                workflow: workflow.name.to_string(),
            });
        }
        tracing::info!(workflow = %workflow.name, steps = workflow.steps.len(), "loaded workflow");
        workflows.insert(workflow.name.clone(), workflow);
    }
    Ok(workflows)
}

pub fn validate_workflow(
    workflow: &WorkflowDefinition,
    registry: &UnitRegistry,
) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Workflow {
        workflow: workflow.name.to_string(),
        reason,
    };

    if workflow.steps.is_empty() {
        return Err(invalid("workflow must declare at least one step".to_string()));
    }

    let step_units: BTreeSet<&str> = workflow.steps.iter().map(|s| s.unit.as_str()).collect();

    for (index, step) in workflow.steps.iter().enumerate() {
        if !registry.contains(step.unit.as_str()) {
            return Err(ConfigError::UnknownUnit {
                workflow: workflow.name.to_string(),
                index,
                unit: step.unit.to_string(),
            });
        }
        if let StepMode::Unrecognized(raw) = &step.mode {
            tracing::warn!(
                workflow = %workflow.name,
                unit = %step.unit,
                mode = %raw,
                "unrecognized step mode; step will run sequentially"
            );
        }

        for (target, source) in &step.input_mapping {
            if target.trim().is_empty() {
                return Err(invalid(format!(
                    "step `{}` has an empty input mapping key",
                    step.unit
                )));
            }
            if let Some(field) = source.strip_prefix("ctx.") {
                if !CONTEXT_FIELDS.contains(&field) {
                    return Err(invalid(format!(
                        "step `{}` maps `{target}` from unknown context field `{field}`",
                        step.unit
                    )));
                }
            } else if let Some(unit) = source.strip_prefix("result.") {
                if !step_units.contains(unit) {
                    return Err(invalid(format!(
                        "step `{}` maps `{target}` from result of `{unit}`, which is not a step of this workflow",
                        step.unit
                    )));
                }
            }
        }
    }
    Ok(())
}
