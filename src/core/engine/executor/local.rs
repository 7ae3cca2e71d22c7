#![allow(clippy::result_large_err)]

use super::copy::{contents_marker, copy_dir_contents, copy_into};
use super::{
    sandbox_slug, spawn_and_stream, validate_relative, validate_segment, ActionInvocation,
    ExitResult, Executor, JobWorkspace, RunContext, SandboxHandle, SandboxLocation,
};
use crate::core::engine::condition::host_shell_condition;
use crate::core::engine::env::{EnvMap, JOB_ENV_FILE};
use crate::core::engine::plan::ExecutorSpec;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs actions as child processes of the control process.
pub struct LocalExecutor {
    action_store: PathBuf,
}

impl LocalExecutor {
    pub fn new(action_store: PathBuf) -> Self {
        Self { action_store }
    }

    fn resolve_executable(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.action_store.join(path)
        }
    }
}

fn host_root(workspace: &JobWorkspace) -> Result<PathBuf, AppError> {
    workspace.host_path().ok_or_else(|| {
        AppError::new(
            ErrorCategory::InternalError,
            "local executor given a non-host workspace",
        )
    })
}

fn io_error(code: &str, message: String) -> impl FnOnce(io::Error) -> AppError + '_ {
    move |err| {
        AppError::new(ErrorCategory::IoError, format!("{}: {}", message, err)).with_code(code)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn provision(
        &self,
        spec: &ExecutorSpec,
        run: &RunContext,
    ) -> Result<SandboxHandle, AppError> {
        let key = spec.canonical_key();
        let root = run
            .run_dir
            .join("sandboxes")
            .join(format!("local-{}", sandbox_slug(&key)));
        fs::create_dir_all(root.join("jobs")).map_err(|err| {
            AppError::new(
                ErrorCategory::SandboxError,
                format!("failed to create sandbox root {}: {}", root.display(), err),
            )
            .with_code("SBX-PROV-001")
        })?;
        Ok(SandboxHandle {
            key,
            spec: spec.clone(),
            location: SandboxLocation::Host { root },
        })
    }

    async fn prepare_job_workspace(
        &self,
        sandbox: &Arc<SandboxHandle>,
        job: &str,
    ) -> Result<JobWorkspace, AppError> {
        validate_segment("job name", job)?;
        let SandboxLocation::Host { root } = &sandbox.location else {
            return Err(AppError::new(
                ErrorCategory::InternalError,
                "local executor given a container sandbox",
            ));
        };
        let path = root.join("jobs").join(job);
        if path.exists() {
            fs::remove_dir_all(&path)
                .map_err(io_error("SBX-WS-001", format!("failed to clear {}", path.display())))?;
        }
        let env_file = path.join(JOB_ENV_FILE);
        if let Some(parent) = env_file.parent() {
            fs::create_dir_all(parent)
                .map_err(io_error("SBX-WS-001", format!("failed to create {}", parent.display())))?;
        }
        fs::write(&env_file, b"")
            .map_err(io_error("SBX-WS-001", format!("failed to create {}", env_file.display())))?;
        Ok(JobWorkspace {
            job: job.to_string(),
            sandbox: Arc::clone(sandbox),
            path: path.to_string_lossy().into_owned(),
        })
    }

    async fn run(
        &self,
        workspace: &JobWorkspace,
        invocation: ActionInvocation<'_>,
        interrupt: &CancellationToken,
    ) -> Result<ExitResult, AppError> {
        let mut command = Command::new(self.resolve_executable(&invocation.action.executable));
        command.current_dir(host_root(workspace)?).envs(invocation.env);
        spawn_and_stream(command, invocation, interrupt).await
    }

    async fn test_condition(
        &self,
        workspace: &JobWorkspace,
        shell: &str,
        expr: &str,
        env: &EnvMap,
    ) -> Result<bool, AppError> {
        let root = host_root(workspace)?;
        host_shell_condition(shell, expr, env, Some(&root)).await
    }

    async fn read_file(
        &self,
        workspace: &JobWorkspace,
        rel_path: &str,
    ) -> Result<Option<String>, AppError> {
        validate_relative(rel_path)?;
        let path = host_root(workspace)?.join(rel_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("IO_ERROR", format!("failed to read {}", path.display()))(err)),
        }
    }

    async fn copy_out(
        &self,
        workspace: &JobWorkspace,
        rel_path: &str,
        host_dest: &Path,
    ) -> Result<(), AppError> {
        validate_relative(rel_path)?;
        let (trimmed, contents_only) = contents_marker(rel_path);
        let source = host_root(workspace)?.join(trimmed);
        if !source.exists() {
            return Err(AppError::new(
                ErrorCategory::ArtifactError,
                format!(
                    "'{}' does not exist in the workspace of job '{}'",
                    rel_path, workspace.job
                ),
            )
            .with_code("ART-SAVE-001"));
        }
        copy_into(&source, contents_only, host_dest).map_err(|err| {
            AppError::new(
                ErrorCategory::ArtifactError,
                format!("failed to copy {} out of workspace: {}", source.display(), err),
            )
            .with_code("ART-COPY-001")
        })
    }

    async fn copy_in(
        &self,
        host_source: &Path,
        workspace: &JobWorkspace,
        rel_path: &str,
    ) -> Result<(), AppError> {
        validate_relative(rel_path)?;
        let (trimmed, _) = contents_marker(rel_path);
        let target = host_root(workspace)?.join(trimmed);
        copy_dir_contents(host_source, &target).map_err(|err| {
            AppError::new(
                ErrorCategory::ArtifactError,
                format!(
                    "failed to copy {} into {}: {}",
                    host_source.display(),
                    target.display(),
                    err
                ),
            )
            .with_code("ART-COPY-001")
        })
    }

    async fn teardown(&self, sandbox: &SandboxHandle) -> Result<(), AppError> {
        if let SandboxLocation::Host { root } = &sandbox.location {
            if root.exists() {
                fs::remove_dir_all(root).map_err(|err| {
                    AppError::new(
                        ErrorCategory::SandboxError,
                        format!("failed to remove sandbox {}: {}", root.display(), err),
                    )
                    .with_code("SBX-TEAR-001")
                })?;
            }
        }
        Ok(())
    }
}
