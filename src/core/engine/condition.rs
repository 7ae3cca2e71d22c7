#![allow(clippy::result_large_err)] // Condition failures are configuration errors carried as AppError.

use crate::core::engine::env::EnvMap;
use crate::core::engine::executor::{Executor, JobWorkspace};
use crate::core::engine::plan::Condition;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Accumulated state a condition is evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConditionScope {
    /// Whether anything earlier in scope has failed.
    pub failed: bool,
    /// Run-level cancellation flag.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip,
}

impl Decision {
    pub fn should_run(self) -> bool {
        matches!(self, Decision::Run)
    }

    fn from_bool(run: bool) -> Self {
        if run {
            Decision::Run
        } else {
            Decision::Skip
        }
    }
}

/// Where a shell condition runs.
#[derive(Clone, Copy)]
pub enum ShellSite<'a> {
    /// The control process, before any workspace exists (job conditions).
    Host,
    /// Inside a job workspace, through the job's executor (action conditions).
    Workspace {
        executor: &'a dyn Executor,
        workspace: &'a JobWorkspace,
    },
}

/// Decides run/skip for job and action conditions.
///
/// Evaluation never mutates the scope it is given.
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    shell: String,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ConditionEvaluator {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub async fn evaluate(
        &self,
        condition: &Condition,
        scope: ConditionScope,
        env: &EnvMap,
        site: ShellSite<'_>,
    ) -> Result<Decision, AppError> {
        let decision = match condition {
            Condition::Success => Decision::from_bool(!scope.failed),
            Condition::Failure => Decision::from_bool(scope.failed),
            Condition::Always => Decision::Run,
            Condition::Cancelled => Decision::from_bool(scope.cancelled),
            Condition::ShellExpr(expr) => {
                let passed = match site {
                    ShellSite::Host => host_shell_condition(&self.shell, expr, env, None).await?,
                    ShellSite::Workspace {
                        executor,
                        workspace,
                    } => {
                        executor
                            .test_condition(workspace, &self.shell, expr, env)
                            .await?
                    }
                };
                Decision::from_bool(passed)
            }
        };
        Ok(decision)
    }
}

/// Run `<shell> -c <expr>` on the host; true on exit status 0.
pub async fn host_shell_condition(
    shell: &str,
    expr: &str,
    env: &EnvMap,
    cwd: Option<&Path>,
) -> Result<bool, AppError> {
    let mut command = Command::new(shell);
    command.arg("-c").arg(expr).envs(env);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    shell_condition_status(command, shell, expr).await
}

/// Spawn a prepared condition command and report whether it exited 0.
///
/// Failing to spawn at all is a configuration error (`CFG-COND-002`).
pub async fn shell_condition_status(
    mut command: Command,
    shell: &str,
    expr: &str,
) -> Result<bool, AppError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = command.output().await.map_err(|err| {
        AppError::new(
            ErrorCategory::ConfigurationError,
            format!(
                "failed to evaluate shell condition '{}' with {}: {}",
                expr, shell, err
            ),
        )
        .with_code("CFG-COND-002")
    })?;

    if !output.status.success() {
        tracing::debug!(
            expr,
            exit_code = output.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "shell condition evaluated false"
        );
    }
    Ok(output.status.success())
}
