#![allow(clippy::result_large_err)]

//! Container executors. Mount mode bind-mounts the host action store into a
//! stock image; build mode expects actions to be baked into the image.

use super::copy::contents_marker;
use super::{
    sandbox_slug, spawn_and_stream, validate_relative, validate_segment, ActionInvocation,
    ExitResult, Executor, JobWorkspace, RunContext, SandboxHandle, SandboxLocation,
};
use crate::core::config::ContainerConfig;
use crate::core::engine::condition::shell_condition_status;
use crate::core::engine::env::{EnvMap, JOB_ENV_FILE};
use crate::core::engine::plan::{ContainerMode, ExecutorSpec};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Workspace-relative file holding the in-container pid of the running action.
pub const ACTION_PID_FILE: &str = ".conveyor/pid";

/// Records the action's pid, then execs it so the pid stays the same.
const PID_WRAPPER: &str = "echo $$ > \"$1\"; shift; exec \"$@\"";

/// Request to start a long-lived container that actions are exec'd into.
#[derive(Debug, Clone)]
pub struct ContainerStart {
    pub image: String,
    pub name: String,
    /// Read-only bind mounts as `(host path, container path)`.
    pub mounts: Vec<(PathBuf, String)>,
}

/// Captured result of a short runtime command.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RuntimeOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Container runtime operations the executors depend on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn load_image(&self, archive: &Path) -> Result<(), AppError>;

    /// Start a container and return its id.
    async fn start(&self, request: &ContainerStart) -> Result<String, AppError>;

    /// Run a short command inside the container and capture its output.
    async fn run_in(&self, id: &str, argv: &[String]) -> Result<RuntimeOutput, AppError>;

    /// Command that runs `argv` inside the container; the caller spawns it.
    fn exec_command(&self, id: &str, workdir: &str, env: &EnvMap, argv: &[String]) -> Command;

    async fn copy_from(&self, id: &str, source: &str, host_dest: &Path) -> Result<(), AppError>;

    async fn copy_to(&self, host_source: &Path, id: &str, dest: &str) -> Result<(), AppError>;

    async fn remove(&self, id: &str) -> Result<(), AppError>;
}

/// Docker-compatible runtime driven through its command line.
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn start_args(request: &ContainerStart) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            request.name.clone(),
        ];
        for (host, container) in &request.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", host.display(), container));
        }
        args.extend([
            "--entrypoint".to_string(),
            "sleep".to_string(),
            request.image.clone(),
            "infinity".to_string(),
        ]);
        args
    }

    async fn invoke(&self, args: &[String]) -> Result<RuntimeOutput, AppError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::SandboxError,
                    format!("failed to invoke container runtime '{}': {}", self.binary, err),
                )
                .with_code("SBX-RT-001")
            })?;
        Ok(RuntimeOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn invoke_checked(&self, args: &[String], code: &str) -> Result<RuntimeOutput, AppError> {
        let output = self.invoke(args).await?;
        if output.success() {
            return Ok(output);
        }
        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        Err(AppError::new(
            ErrorCategory::SandboxError,
            format!(
                "{} {} failed: {}",
                self.binary,
                subcommand,
                output.stderr.trim()
            ),
        )
        .with_code(code))
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn load_image(&self, archive: &Path) -> Result<(), AppError> {
        let args = vec![
            "load".to_string(),
            "-i".to_string(),
            archive.display().to_string(),
        ];
        self.invoke_checked(&args, "SBX-PROV-001").await.map(|_| ())
    }

    async fn start(&self, request: &ContainerStart) -> Result<String, AppError> {
        let output = self
            .invoke_checked(&Self::start_args(request), "SBX-PROV-001")
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn run_in(&self, id: &str, argv: &[String]) -> Result<RuntimeOutput, AppError> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());
        self.invoke(&args).await
    }

    fn exec_command(&self, id: &str, workdir: &str, env: &EnvMap, argv: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("exec").arg("-w").arg(workdir);
        for (key, value) in env {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command.arg(id).args(argv);
        command
    }

    async fn copy_from(&self, id: &str, source: &str, host_dest: &Path) -> Result<(), AppError> {
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", id, source),
            host_dest.display().to_string(),
        ];
        self.invoke_checked(&args, "ART-COPY-001").await.map(|_| ())
    }

    async fn copy_to(&self, host_source: &Path, id: &str, dest: &str) -> Result<(), AppError> {
        let args = vec![
            "cp".to_string(),
            format!("{}/.", host_source.display()),
            format!("{}:{}", id, dest),
        ];
        self.invoke_checked(&args, "ART-COPY-001").await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), AppError> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        self.invoke_checked(&args, "SBX-TEAR-001").await.map(|_| ())
    }
}

/// Executor for both container modes.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    mode: ContainerMode,
    config: ContainerConfig,
    action_store: Option<PathBuf>,
    loaded_images: Mutex<HashSet<String>>,
}

impl ContainerExecutor {
    /// Stock image with the host action store mounted read-only.
    pub fn mount(
        runtime: Arc<dyn ContainerRuntime>,
        config: ContainerConfig,
        action_store: PathBuf,
    ) -> Self {
        Self {
            runtime,
            mode: ContainerMode::Mount,
            config,
            action_store: Some(action_store),
            loaded_images: Mutex::new(HashSet::new()),
        }
    }

    /// Prebuilt image that already contains the actions.
    pub fn build(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        Self {
            runtime,
            mode: ContainerMode::Build,
            config,
            action_store: None,
            loaded_images: Mutex::new(HashSet::new()),
        }
    }

    fn program_for(&self, executable: &str) -> String {
        if executable.starts_with('/') {
            return executable.to_string();
        }
        let base = match self.mode {
            ContainerMode::Mount => &self.config.action_mount,
            ContainerMode::Build => &self.config.image_action_dir,
        };
        format!("{}/{}", base.trim_end_matches('/'), executable)
    }

    /// Load `<image_archive_dir>/<image>.tar` once per image when it exists.
    async fn preload_image(&self, image: &str) -> Result<(), AppError> {
        let Some(dir) = &self.config.image_archive_dir else {
            return Ok(());
        };
        let archive = dir.join(format!("{}.tar", archive_name(image)));
        if !archive.is_file() {
            tracing::debug!(image, archive = %archive.display(), "no image archive to preload");
            return Ok(());
        }
        let already = self
            .loaded_images
            .lock()
            .map(|loaded| loaded.contains(image))
            .unwrap_or(false);
        if already {
            return Ok(());
        }
        tracing::info!(event = "image_preload", image, archive = %archive.display(), "loading image archive");
        self.runtime.load_image(&archive).await?;
        if let Ok(mut loaded) = self.loaded_images.lock() {
            loaded.insert(image.to_string());
        }
        Ok(())
    }

    /// Kill the action recorded in the workspace pid file.
    ///
    /// Killing the runtime's exec client does not reach the process inside the
    /// container, so timed-out and interrupted actions are killed here.
    async fn kill_action(&self, id: &str, workspace: &JobWorkspace) {
        let pid_file = workspace.join(ACTION_PID_FILE);
        let argv = sh(
            "[ -s \"$1\" ] || exit 0; kill -KILL \"$(cat \"$1\")\" 2>/dev/null; rm -f \"$1\"",
            &pid_file,
        );
        match self.runtime.run_in(id, &argv).await {
            Ok(output) if output.success() => {
                tracing::info!(job = %workspace.job, container = %id, event = "action_reaped", "in-container action killed")
            }
            Ok(output) => {
                tracing::warn!(job = %workspace.job, container = %id, stderr = %output.stderr.trim(), "failed to kill in-container action")
            }
            Err(err) => {
                tracing::warn!(job = %workspace.job, container = %id, error = %err, "failed to kill in-container action")
            }
        }
    }

    async fn checked(&self, id: &str, argv: Vec<String>, code: &str) -> Result<(), AppError> {
        let output = self.runtime.run_in(id, &argv).await?;
        if output.success() {
            Ok(())
        } else {
            Err(AppError::new(
                ErrorCategory::SandboxError,
                format!(
                    "'{}' failed in container {}: {}",
                    argv.join(" "),
                    id,
                    output.stderr.trim()
                ),
            )
            .with_code(code))
        }
    }
}

fn container_id(workspace: &JobWorkspace) -> Result<&str, AppError> {
    match &workspace.sandbox.location {
        SandboxLocation::Container { id, .. } => Ok(id),
        SandboxLocation::Host { .. } => Err(AppError::new(
            ErrorCategory::InternalError,
            "container executor given a host workspace",
        )),
    }
}

/// File name stem for an image reference (`registry/app:1.0` -> `registry_app_1.0`).
pub fn archive_name(image: &str) -> String {
    image
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            other => other,
        })
        .collect()
}

fn sh(script: &str, arg: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
        arg.to_string(),
    ]
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn name(&self) -> &'static str {
        match self.mode {
            ContainerMode::Mount => "container-mount",
            ContainerMode::Build => "container-build",
        }
    }

    async fn provision(
        &self,
        spec: &ExecutorSpec,
        run: &RunContext,
    ) -> Result<SandboxHandle, AppError> {
        let ExecutorSpec::Container { image, .. } = spec else {
            return Err(AppError::new(
                ErrorCategory::InternalError,
                "container executor asked to provision a local sandbox",
            ));
        };
        let key = spec.canonical_key();
        let slug = sandbox_slug(&key);
        let run_prefix: String = run.run_id.simple().to_string().chars().take(8).collect();

        let mut mounts = Vec::new();
        match self.mode {
            ContainerMode::Mount => {
                if let Some(store) = &self.action_store {
                    mounts.push((store.clone(), self.config.action_mount.clone()));
                }
            }
            ContainerMode::Build => self.preload_image(image).await.map_err(|err| {
                AppError::new(
                    ErrorCategory::SandboxError,
                    format!("failed to preload image {}: {}", image, err.message),
                )
                .with_code("SBX-PROV-001")
            })?,
        }

        let request = ContainerStart {
            image: image.clone(),
            name: format!("conveyor-{}-{}", run_prefix, slug),
            mounts,
        };
        let id = self.runtime.start(&request).await?;
        let root = format!("{}/{}", self.config.workspace_root.trim_end_matches('/'), slug);
        if let Err(err) = self
            .checked(&id, sh("mkdir -p \"$1/jobs\"", &root), "SBX-PROV-001")
            .await
        {
            if let Err(cleanup) = self.runtime.remove(&id).await {
                tracing::warn!(container = %id, error = %cleanup, "failed to remove half-provisioned container");
            }
            return Err(err);
        }
        tracing::info!(event = "sandbox_ready", sandbox = %key, container = %id, "container sandbox started");
        Ok(SandboxHandle {
            key,
            spec: spec.clone(),
            location: SandboxLocation::Container { id, root },
        })
    }

    async fn prepare_job_workspace(
        &self,
        sandbox: &Arc<SandboxHandle>,
        job: &str,
    ) -> Result<JobWorkspace, AppError> {
        validate_segment("job name", job)?;
        let SandboxLocation::Container { id, root } = &sandbox.location else {
            return Err(AppError::new(
                ErrorCategory::InternalError,
                "container executor given a host sandbox",
            ));
        };
        let path = format!("{}/jobs/{}", root, job);
        let script = format!(
            "rm -rf \"$1\" && mkdir -p \"$1/{dir}\" && : > \"$1/{file}\"",
            dir = Path::new(JOB_ENV_FILE)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            file = JOB_ENV_FILE,
        );
        self.checked(id, sh(&script, &path), "SBX-WS-001").await?;
        Ok(JobWorkspace {
            job: job.to_string(),
            sandbox: Arc::clone(sandbox),
            path,
        })
    }

    async fn run(
        &self,
        workspace: &JobWorkspace,
        invocation: ActionInvocation<'_>,
        interrupt: &CancellationToken,
    ) -> Result<ExitResult, AppError> {
        let id = container_id(workspace)?;
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            PID_WRAPPER.to_string(),
            "sh".to_string(),
            workspace.join(ACTION_PID_FILE),
            self.program_for(&invocation.action.executable),
        ];
        let command = self
            .runtime
            .exec_command(id, &workspace.path, invocation.env, &argv);
        let result = spawn_and_stream(command, invocation, interrupt).await?;
        if result.timed_out || result.interrupted {
            self.kill_action(id, workspace).await;
        }
        Ok(result)
    }

    async fn test_condition(
        &self,
        workspace: &JobWorkspace,
        shell: &str,
        expr: &str,
        env: &EnvMap,
    ) -> Result<bool, AppError> {
        let id = container_id(workspace)?;
        let argv = vec![shell.to_string(), "-c".to_string(), expr.to_string()];
        let command = self.runtime.exec_command(id, &workspace.path, env, &argv);
        shell_condition_status(command, shell, expr).await
    }

    async fn read_file(
        &self,
        workspace: &JobWorkspace,
        rel_path: &str,
    ) -> Result<Option<String>, AppError> {
        validate_relative(rel_path)?;
        let id = container_id(workspace)?;
        let argv = sh("[ -e \"$1\" ] || exit 3; cat \"$1\"", &workspace.join(rel_path));
        let output = self.runtime.run_in(id, &argv).await?;
        match output.code {
            Some(0) => Ok(Some(output.stdout)),
            Some(3) => Ok(None),
            _ => Err(AppError::new(
                ErrorCategory::IoError,
                format!(
                    "failed to read {} in container {}: {}",
                    rel_path,
                    id,
                    output.stderr.trim()
                ),
            )
            .with_code("IO_ERROR")),
        }
    }

    async fn copy_out(
        &self,
        workspace: &JobWorkspace,
        rel_path: &str,
        host_dest: &Path,
    ) -> Result<(), AppError> {
        validate_relative(rel_path)?;
        let id = container_id(workspace)?;
        let (trimmed, contents_only) = contents_marker(rel_path);
        let source = workspace.join(trimmed);
        let found = self
            .runtime
            .run_in(id, &["test".to_string(), "-e".to_string(), source.clone()])
            .await?;
        if !found.success() {
            return Err(AppError::new(
                ErrorCategory::ArtifactError,
                format!(
                    "'{}' does not exist in the workspace of job '{}'",
                    rel_path, workspace.job
                ),
            )
            .with_code("ART-SAVE-001"));
        }
        let source = if contents_only {
            format!("{}/.", source)
        } else {
            source
        };
        self.runtime.copy_from(id, &source, host_dest).await
    }

    async fn copy_in(
        &self,
        host_source: &Path,
        workspace: &JobWorkspace,
        rel_path: &str,
    ) -> Result<(), AppError> {
        validate_relative(rel_path)?;
        let id = container_id(workspace)?;
        let (trimmed, _) = contents_marker(rel_path);
        let target = workspace.join(trimmed);
        self.checked(id, sh("mkdir -p \"$1\"", &target), "ART-COPY-001")
            .await?;
        self.runtime.copy_to(host_source, id, &target).await
    }

    async fn teardown(&self, sandbox: &SandboxHandle) -> Result<(), AppError> {
        match &sandbox.location {
            SandboxLocation::Container { id, .. } => self.runtime.remove(id).await,
            SandboxLocation::Host { .. } => Ok(()),
        }
    }
}
