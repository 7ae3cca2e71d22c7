#![allow(clippy::result_large_err)] // Plan loading returns AppError so validation failures keep their codes.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

fn default_plan_name() -> String {
    "workflow".to_string()
}

/// Fully resolved, immutable plan handed to the engine by the workflow compiler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    #[serde(default = "default_plan_name")]
    pub name: String,
    /// Workflow-level environment (lowest priority layer).
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Environment providers, run once per workflow in declared order.
    #[serde(default)]
    pub providers: Vec<PathBuf>,
    pub levels: Vec<Level>,
}

/// Jobs with no ordering among themselves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Level {
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<ArtifactRef>,
    #[serde(default)]
    pub outputs: Vec<ArtifactRef>,
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionSpec {
    pub name: String,
    /// Opaque executable reference; relative references resolve against the
    /// executor's action directory.
    pub executable: String,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryPolicySpec>,
    #[serde(default, with = "humantime_option")]
    pub timeout: Option<Duration>,
}

/// Named artifact hand-off. `path` is the save source for outputs and the
/// restore target for inputs, relative to the job workspace.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactRef {
    pub name: String,
    #[serde(alias = "source_path", alias = "target_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicySpec {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(with = "humantime_required")]
    pub min_delay: Duration,
    #[serde(with = "humantime_required")]
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Constant,
    Linear,
    Exponential,
}

/// Predicate deciding whether a job or action runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "ConditionRepr", into = "ConditionRepr")]
pub enum Condition {
    #[default]
    Success,
    Failure,
    Always,
    Cancelled,
    ShellExpr(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConditionParseError {
    #[error("unknown condition literal '{0}'; expected success, failure, always, cancelled or {{shell: <expr>}}")]
    UnknownLiteral(String),
    #[error("shell condition expression is empty")]
    EmptyShellExpr,
}

impl FromStr for Condition {
    type Err = ConditionParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let literal = trimmed.strip_suffix("()").unwrap_or(trimmed);
        match literal {
            "success" => Ok(Condition::Success),
            "failure" => Ok(Condition::Failure),
            "always" => Ok(Condition::Always),
            "cancelled" => Ok(Condition::Cancelled),
            _ => Err(ConditionParseError::UnknownLiteral(value.to_string())),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Success => write!(f, "success()"),
            Condition::Failure => write!(f, "failure()"),
            Condition::Always => write!(f, "always()"),
            Condition::Cancelled => write!(f, "cancelled()"),
            Condition::ShellExpr(expr) => write!(f, "shell({})", expr),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum ConditionRepr {
    Literal(String),
    Shell { shell: String },
}

impl TryFrom<ConditionRepr> for Condition {
    type Error = ConditionParseError;

    fn try_from(repr: ConditionRepr) -> Result<Self, Self::Error> {
        match repr {
            ConditionRepr::Literal(literal) => literal.parse(),
            ConditionRepr::Shell { shell } => {
                if shell.trim().is_empty() {
                    Err(ConditionParseError::EmptyShellExpr)
                } else {
                    Ok(Condition::ShellExpr(shell))
                }
            }
        }
    }
}

impl From<Condition> for ConditionRepr {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Success => ConditionRepr::Literal("success".into()),
            Condition::Failure => ConditionRepr::Literal("failure".into()),
            Condition::Always => ConditionRepr::Literal("always".into()),
            Condition::Cancelled => ConditionRepr::Literal("cancelled".into()),
            Condition::ShellExpr(shell) => ConditionRepr::Shell { shell },
        }
    }
}

/// Where a job's actions execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "ExecutorRepr", into = "ExecutorRepr")]
pub enum ExecutorSpec {
    #[default]
    Local,
    Container { image: String, mode: ContainerMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerMode {
    Mount,
    Build,
}

impl fmt::Display for ContainerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerMode::Mount => write!(f, "mount"),
            ContainerMode::Build => write!(f, "build"),
        }
    }
}

/// Executor implementation family a spec dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Local,
    ContainerMount,
    ContainerBuild,
}

impl ExecutorSpec {
    /// Canonical key; jobs with equal keys share one sandbox per run.
    pub fn canonical_key(&self) -> String {
        match self {
            ExecutorSpec::Local => "local".to_string(),
            ExecutorSpec::Container { image, mode } => format!("container:{}:{}", mode, image),
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutorSpec::Local => ExecutorKind::Local,
            ExecutorSpec::Container {
                mode: ContainerMode::Mount,
                ..
            } => ExecutorKind::ContainerMount,
            ExecutorSpec::Container {
                mode: ContainerMode::Build,
                ..
            } => ExecutorKind::ContainerBuild,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ContainerRepr {
    image: String,
    #[serde(default = "default_container_mode")]
    mode: ContainerMode,
}

fn default_container_mode() -> ContainerMode {
    ContainerMode::Mount
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum ExecutorRepr {
    Name(String),
    Container { container: ContainerRepr },
}

impl TryFrom<ExecutorRepr> for ExecutorSpec {
    type Error = String;

    fn try_from(repr: ExecutorRepr) -> Result<Self, Self::Error> {
        match repr {
            ExecutorRepr::Name(name) if name.trim() == "local" => Ok(ExecutorSpec::Local),
            ExecutorRepr::Name(name) => Err(format!(
                "unknown executor '{}'; expected local or {{container: {{image, mode}}}}",
                name
            )),
            ExecutorRepr::Container { container } => {
                if container.image.trim().is_empty() {
                    return Err("container executor requires a non-empty image".to_string());
                }
                Ok(ExecutorSpec::Container {
                    image: container.image,
                    mode: container.mode,
                })
            }
        }
    }
}

impl From<ExecutorSpec> for ExecutorRepr {
    fn from(spec: ExecutorSpec) -> Self {
        match spec {
            ExecutorSpec::Local => ExecutorRepr::Name("local".into()),
            ExecutorSpec::Container { image, mode } => ExecutorRepr::Container {
                container: ContainerRepr { image, mode },
            },
        }
    }
}

impl Plan {
    /// Iterate all jobs in level order.
    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.levels.iter().flat_map(|level| level.jobs.iter())
    }
}

/// Load a plan from YAML or JSON (by extension) and validate it.
pub fn load_plan(path: &Path) -> Result<Plan, AppError> {
    let content = fs::read_to_string(path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to read plan {}: {}", path.display(), err),
        )
        .with_code("CFG-PLAN-001")
    })?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let parsed = if is_json {
        serde_json::from_str::<Plan>(&content).map_err(|err| err.to_string())
    } else {
        serde_yaml::from_str::<Plan>(&content).map_err(|err| err.to_string())
    };
    let plan = parsed.map_err(|message| parse_error(&path.display().to_string(), message))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Parse and validate a YAML (or JSON) plan held in memory.
pub fn load_plan_str(content: &str) -> Result<Plan, AppError> {
    let plan = serde_yaml::from_str::<Plan>(content)
        .map_err(|err| parse_error("<inline>", err.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

fn parse_error(origin: &str, message: String) -> AppError {
    let code = if message.contains("condition") {
        "CFG-COND-001"
    } else {
        "CFG-PLAN-001"
    };
    AppError::new(
        ErrorCategory::ConfigurationError,
        format!("failed to parse plan {}: {}", origin, message),
    )
    .with_code(code)
}

/// Check the structural invariants the engine relies on.
pub fn validate_plan(plan: &Plan) -> Result<(), AppError> {
    let mut names = HashSet::new();
    let mut produced_before: HashSet<&str> = HashSet::new();

    for (index, level) in plan.levels.iter().enumerate() {
        let mut produced_here: HashMap<&str, &str> = HashMap::new();
        for job in &level.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(plan_error(
                    "CFG-PLAN-002",
                    format!("duplicate job name '{}'", job.name),
                ));
            }
            if job.actions.is_empty() {
                return Err(plan_error(
                    "CFG-PLAN-003",
                    format!("job '{}' has no actions", job.name),
                ));
            }
            for action in &job.actions {
                if let Some(retry) = &action.retry {
                    if retry.max_attempts == 0 {
                        return Err(plan_error(
                            "CFG-PLAN-004",
                            format!(
                                "action '{}' in job '{}' has max_attempts 0",
                                action.name, job.name
                            ),
                        ));
                    }
                    if retry.min_delay > retry.max_delay {
                        return Err(plan_error(
                            "CFG-PLAN-004",
                            format!(
                                "action '{}' in job '{}' has min_delay greater than max_delay",
                                action.name, job.name
                            ),
                        ));
                    }
                }
            }
            for input in &job.inputs {
                if !produced_before.contains(input.name.as_str()) {
                    return Err(plan_error(
                        "CFG-PLAN-005",
                        format!(
                            "job '{}' in level {} restores artifact '{}' that no earlier level produces",
                            job.name, index, input.name
                        ),
                    ));
                }
            }
            for output in &job.outputs {
                if let Some(other) = produced_here.insert(output.name.as_str(), job.name.as_str()) {
                    return Err(plan_error(
                        "CFG-PLAN-006",
                        format!(
                            "artifact '{}' is saved by both '{}' and '{}' in level {}",
                            output.name, other, job.name, index
                        ),
                    ));
                }
            }
        }
        produced_before.extend(produced_here.keys());
    }
    Ok(())
}

fn plan_error(code: &str, message: String) -> AppError {
    AppError::new(ErrorCategory::ConfigurationError, message).with_code(code)
}

mod humantime_required {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}
