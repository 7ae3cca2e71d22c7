#![allow(clippy::result_large_err)] // Executors return AppError so sandbox and copy failures keep their codes.

//! Executor abstraction: sandbox lifecycle, action launch and artifact copy
//! primitives, with one implementation per [`ExecutorKind`].

pub mod container;
pub mod copy;
pub mod local;

use crate::core::engine::env::{EnvMap, JOB_ENV_FILE};
use crate::core::engine::plan::{ActionSpec, ExecutorKind, ExecutorSpec};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const OUTPUT_CAPTURE_LIMIT_BYTES: usize = 1_048_576;

/// How long output readers may keep draining after the action exited.
/// Background processes that inherited the pipes are abandoned after this.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Identity of the run a sandbox is provisioned for.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    /// `<run_root>/<run_id>`; holds sandboxes, artifacts and the run report.
    pub run_dir: PathBuf,
}

/// Where a sandbox lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxLocation {
    Host { root: PathBuf },
    Container { id: String, root: String },
}

/// A provisioned execution environment, shared by every job with the same spec.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub key: String,
    pub spec: ExecutorSpec,
    pub location: SandboxLocation,
}

/// A job's private directory inside a sandbox.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    pub job: String,
    pub sandbox: Arc<SandboxHandle>,
    /// Workspace path as seen by the job's actions.
    pub path: String,
}

impl JobWorkspace {
    /// Join a workspace-relative path using the action's view of the filesystem.
    pub fn join(&self, rel: &str) -> String {
        let rel = rel.trim_start_matches("./").trim_end_matches('/');
        if rel.is_empty() || rel == "." {
            self.path.clone()
        } else {
            format!("{}/{}", self.path.trim_end_matches('/'), rel)
        }
    }

    /// Host path of the workspace, when the sandbox lives on the host.
    pub fn host_path(&self) -> Option<PathBuf> {
        match self.sandbox.location {
            SandboxLocation::Host { .. } => Some(PathBuf::from(&self.path)),
            SandboxLocation::Container { .. } => None,
        }
    }

    pub fn env_file_path(&self) -> String {
        self.join(JOB_ENV_FILE)
    }
}

/// One action invocation request.
#[derive(Debug, Clone, Copy)]
pub struct ActionInvocation<'a> {
    pub job: &'a str,
    pub action: &'a ActionSpec,
    pub env: &'a EnvMap,
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExitResult {
    /// `None` when the process never started, was killed, or timed out.
    pub exit_code: Option<i32>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(skip)]
    pub stdout: String,
    pub timed_out: bool,
    pub interrupted: bool,
    pub error: Option<String>,
}

impl ExitResult {
    pub fn exited(code: i32, duration: Duration, stdout: String) -> Self {
        Self {
            exit_code: Some(code),
            duration,
            stdout,
            ..Self::default()
        }
    }

    pub fn timed_out(duration: Duration) -> Self {
        let error = AppError::new(
            ErrorCategory::TimeoutError,
            format!("attempt killed after exceeding its timeout ({}ms)", duration.as_millis()),
        )
        .with_code("ACT-TIMEOUT-001");
        Self {
            duration,
            timed_out: true,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn interrupted(duration: Duration) -> Self {
        Self {
            duration,
            interrupted: true,
            error: Some("interrupted".to_string()),
            ..Self::default()
        }
    }

    pub fn not_started(duration: Duration, error: String) -> Self {
        Self {
            duration,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.interrupted
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Backend that provisions sandboxes and launches actions inside them.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn provision(
        &self,
        spec: &ExecutorSpec,
        run: &RunContext,
    ) -> Result<SandboxHandle, AppError>;

    /// Create a fresh `jobs/<name>` workspace, wiping any previous one.
    async fn prepare_job_workspace(
        &self,
        sandbox: &Arc<SandboxHandle>,
        job: &str,
    ) -> Result<JobWorkspace, AppError>;

    async fn run(
        &self,
        workspace: &JobWorkspace,
        invocation: ActionInvocation<'_>,
        interrupt: &CancellationToken,
    ) -> Result<ExitResult, AppError>;

    /// Run `<shell> -c <expr>` in the workspace with `env`; true on exit 0.
    async fn test_condition(
        &self,
        workspace: &JobWorkspace,
        shell: &str,
        expr: &str,
        env: &EnvMap,
    ) -> Result<bool, AppError>;

    /// Read a workspace-relative file; `Ok(None)` when it does not exist.
    async fn read_file(&self, workspace: &JobWorkspace, rel_path: &str)
        -> Result<Option<String>, AppError>;

    /// Copy `rel_path` out of the workspace into the host directory `host_dest`.
    /// A trailing `/` copies the directory's contents instead of the directory.
    async fn copy_out(
        &self,
        workspace: &JobWorkspace,
        rel_path: &str,
        host_dest: &Path,
    ) -> Result<(), AppError>;

    /// Copy the contents of `host_source` into `rel_path` inside the workspace.
    async fn copy_in(
        &self,
        host_source: &Path,
        workspace: &JobWorkspace,
        rel_path: &str,
    ) -> Result<(), AppError>;

    async fn teardown(&self, sandbox: &SandboxHandle) -> Result<(), AppError>;
}

/// Builder used to register executors before a run.
pub struct ExecutorRegistryBuilder {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl Default for ExecutorRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistryBuilder {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register<T: Executor>(&mut self, kind: ExecutorKind, executor: T) -> &mut Self {
        self.executors.insert(kind, Arc::new(executor));
        self
    }

    pub fn build(self) -> ExecutorRegistry {
        ExecutorRegistry {
            inner: Arc::new(self.executors),
        }
    }
}

/// Immutable executor lookup available during a run.
#[derive(Clone)]
pub struct ExecutorRegistry {
    inner: Arc<HashMap<ExecutorKind, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::new()
    }

    /// Local, container-mount and container-build executors backed by the
    /// configured container runtime CLI.
    pub fn with_defaults(config: &crate::core::config::EngineConfig) -> Self {
        let runtime: Arc<dyn container::ContainerRuntime> =
            Arc::new(container::CliRuntime::new(config.container.runtime.clone()));
        let mut builder = Self::builder();
        builder
            .register(
                ExecutorKind::Local,
                local::LocalExecutor::new(config.action_store.clone()),
            )
            .register(
                ExecutorKind::ContainerMount,
                container::ContainerExecutor::mount(
                    Arc::clone(&runtime),
                    config.container.clone(),
                    config.action_store.clone(),
                ),
            )
            .register(
                ExecutorKind::ContainerBuild,
                container::ContainerExecutor::build(runtime, config.container.clone()),
            );
        builder.build()
    }

    pub fn get(&self, kind: ExecutorKind) -> Result<Arc<dyn Executor>, AppError> {
        self.inner.get(&kind).cloned().ok_or_else(|| {
            AppError::new(
                ErrorCategory::SandboxError,
                format!("no executor registered for {:?}", kind),
            )
            .with_code("SBX-PROV-002")
        })
    }
}

type SandboxCell = OnceCell<Result<Arc<SandboxHandle>, String>>;

/// Lazily provisioned sandboxes keyed by canonical executor spec.
///
/// The first job to ask provisions; concurrent askers wait and reuse the
/// result. A failed provisioning is remembered and not retried.
#[derive(Default)]
pub struct SandboxRegistry {
    cells: DashMap<String, Arc<SandboxCell>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        spec: &ExecutorSpec,
        executor: &dyn Executor,
        run: &RunContext,
    ) -> Result<Arc<SandboxHandle>, AppError> {
        let key = spec.canonical_key();
        let cell = self.cells.entry(key.clone()).or_default().clone();
        let result = cell
            .get_or_init(|| async {
                tracing::info!(event = "sandbox_provision", sandbox = %key, executor = executor.name(), "provisioning sandbox");
                match executor.provision(spec, run).await {
                    Ok(handle) => Ok(Arc::new(handle)),
                    Err(err) => {
                        tracing::error!(event = "sandbox_failed", sandbox = %key, error = %err, "sandbox provisioning failed");
                        Err(err.message)
                    }
                }
            })
            .await;
        result.clone().map_err(|message| {
            AppError::new(
                ErrorCategory::SandboxError,
                format!("sandbox {} unavailable: {}", key, message),
            )
            .with_code("SBX-PROV-001")
        })
    }

    /// Every sandbox that was successfully provisioned.
    pub fn provisioned(&self) -> Vec<Arc<SandboxHandle>> {
        let mut handles: Vec<_> = self
            .cells
            .iter()
            .filter_map(|entry| match entry.value().get() {
                Some(Ok(handle)) => Some(Arc::clone(handle)),
                _ => None,
            })
            .collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles
    }
}

/// Short stable digest of a sandbox key, usable in container names and paths.
pub fn sandbox_slug(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}

/// Reject names that cannot be used as a single path segment.
pub fn validate_segment(kind: &str, value: &str) -> Result<(), AppError> {
    let valid = !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(AppError::new(
            ErrorCategory::ConfigurationError,
            format!("{} '{}' contains invalid characters for filesystem use", kind, value),
        )
        .with_code("CFG-PATH-001"))
    }
}

/// Reject workspace-relative paths that are absolute or escape the workspace.
pub fn validate_relative(value: &str) -> Result<(), AppError> {
    let path = Path::new(value);
    if path.is_absolute() || path.components().any(|c| c.as_os_str() == "..") {
        return Err(AppError::new(
            ErrorCategory::ConfigurationError,
            format!("path '{}' must stay inside the job workspace", value),
        )
        .with_code("CFG-PATH-002"));
    }
    Ok(())
}

enum Stop {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Interrupted,
}

/// Spawn `command`, forward its output to the log as `stdout`/`stderr` events,
/// and wait for exit.
///
/// The action's timeout and `interrupt` both kill the spawned process. The
/// attempt ends when the process exits; output still open after that gets
/// `OUTPUT_DRAIN_GRACE` to drain.
pub async fn spawn_and_stream(
    mut command: Command,
    invocation: ActionInvocation<'_>,
    interrupt: &CancellationToken,
) -> Result<ExitResult, AppError> {
    if interrupt.is_cancelled() {
        return Ok(ExitResult::interrupted(Duration::ZERO));
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|err| {
        AppError::new(
            ErrorCategory::ActionFailure,
            format!(
                "failed to start action '{}' ({}): {}",
                invocation.action.name, invocation.action.executable, err
            ),
        )
        .with_code("ACT-SPAWN-001")
    })?;

    let mut captured = String::new();
    let (stop, elapsed) = {
        let stdout = forward_lines(child.stdout.take(), invocation, "stdout", Some(&mut captured));
        let stderr = forward_lines(child.stderr.take(), invocation, "stderr", None);
        let streams = async {
            tokio::join!(stdout, stderr);
        };
        tokio::pin!(streams);
        let limit = invocation.action.timeout;
        let deadline = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut drained = false;
        let stop = {
            let wait = child.wait();
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    status = &mut wait => break Stop::Exited(status),
                    _ = &mut streams, if !drained => drained = true,
                    _ = &mut deadline => break Stop::TimedOut,
                    _ = interrupt.cancelled() => break Stop::Interrupted,
                }
            }
        };
        let elapsed = started.elapsed();
        if matches!(stop, Stop::Exited(_))
            && !drained
            && tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut streams)
                .await
                .is_err()
        {
            tracing::debug!(
                job = invocation.job,
                action = %invocation.action.name,
                "output still open after exit; detaching readers"
            );
        }
        (stop, elapsed)
    };

    match stop {
        Stop::Exited(status) => {
            let status = status.map_err(|err| {
                AppError::new(
                    ErrorCategory::ActionFailure,
                    format!("failed to wait for action '{}': {}", invocation.action.name, err),
                )
                .with_code("ACT-WAIT-001")
            })?;
            Ok(ExitResult {
                exit_code: status.code(),
                duration: elapsed,
                stdout: captured,
                error: status
                    .code()
                    .is_none()
                    .then(|| "terminated by signal".to_string()),
                ..ExitResult::default()
            })
        }
        Stop::TimedOut => {
            let _ = child.kill().await;
            tracing::warn!(
                job = invocation.job,
                action = %invocation.action.name,
                event = "action_killed",
                reason = "timeout",
                "action killed after exceeding its timeout"
            );
            Ok(ExitResult::timed_out(elapsed))
        }
        Stop::Interrupted => {
            let _ = child.kill().await;
            tracing::warn!(
                job = invocation.job,
                action = %invocation.action.name,
                event = "action_killed",
                reason = "interrupt",
                "action killed by interrupt"
            );
            Ok(ExitResult::interrupted(elapsed))
        }
    }
}

async fn forward_lines<R>(
    reader: Option<R>,
    invocation: ActionInvocation<'_>,
    stream: &'static str,
    mut capture: Option<&mut String>,
) where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim_end_matches(['\n', '\r']);
                tracing::info!(
                    job = invocation.job,
                    action = %invocation.action.name,
                    event = stream,
                    "{}",
                    trimmed
                );
                if let Some(captured) = capture.as_deref_mut() {
                    if captured.len() < OUTPUT_CAPTURE_LIMIT_BYTES {
                        captured.push_str(&line);
                    }
                }
            }
        }
    }
}
