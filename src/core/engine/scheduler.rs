#![allow(clippy::result_large_err)] // Run orchestration returns AppError so provider and I/O failures keep their codes.

use crate::core::config::EngineConfig;
use crate::core::engine::artifacts::ArtifactStore;
use crate::core::engine::condition::{ConditionEvaluator, ConditionScope};
use crate::core::engine::env::EnvResolver;
use crate::core::engine::executor::{ExecutorRegistry, RunContext, SandboxRegistry};
use crate::core::engine::job::{JobOutcome, JobRunner};
use crate::core::engine::plan::{Level, Plan};
use crate::core::engine::state::{JobRecord, WorkflowRunState};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// File name of the per-run report written under the run directory.
pub const RUN_REPORT_FILE: &str = "run.json";

/// Runs every job of one level concurrently and waits for all of them.
pub struct LevelScheduler {
    runner: JobRunner,
}

/// Outcomes of one level, in plan order.
#[derive(Debug)]
pub struct LevelReport {
    pub index: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl LevelReport {
    /// A non-tolerated failure or a configuration error stops the run here.
    pub fn halts(&self) -> bool {
        self.outcomes.iter().any(JobOutcome::blocks_run)
    }

    pub fn fatal(&self) -> Option<&AppError> {
        self.outcomes.iter().find_map(|outcome| outcome.fatal.as_ref())
    }
}

impl LevelScheduler {
    pub fn new(runner: JobRunner) -> Self {
        Self { runner }
    }

    pub async fn run_level(&self, index: usize, level: &Level, scope: ConditionScope) -> LevelReport {
        tracing::info!(event = "level_started", level = index, jobs = level.jobs.len(), "level started");
        let futures = level
            .jobs
            .iter()
            .map(|job| self.runner.run_job(job, scope));
        let outcomes = join_all(futures).await;
        tracing::info!(event = "level_finished", level = index, "level finished");
        LevelReport { index, outcomes }
    }
}

/// Handle for stopping a run from outside, e.g. a signal handler.
#[derive(Clone)]
pub struct RunControl {
    state: Arc<WorkflowRunState>,
    interrupt: CancellationToken,
}

impl RunControl {
    /// Cooperative cancellation: running actions continue, later levels only
    /// run jobs whose condition is `cancelled`, and `cancelled()` conditions
    /// become true.
    pub fn cancel(&self) {
        if !self.state.is_cancelled() {
            tracing::warn!(event = "run_cancelled", "cancellation requested");
        }
        self.state.cancel();
    }

    /// Cancel and also kill every in-flight action.
    pub fn interrupt(&self) {
        self.cancel();
        tracing::warn!(event = "run_interrupted", "interrupt requested; killing running actions");
        self.interrupt.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failure => write!(f, "failure"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final report of a run, also persisted as `run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub failed_jobs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub jobs: Vec<JobRecord>,
    #[serde(skip)]
    pub run_dir: PathBuf,
}

impl RunSummary {
    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join(RUN_REPORT_FILE)
    }

    /// Per-job status table printed after every run.
    pub fn render_table(&self) -> String {
        let name_width = self
            .jobs
            .iter()
            .map(|job| job.name.len())
            .max()
            .unwrap_or(0)
            .max("JOB".len());
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<name_width$}  {:>5}  {:<8}  {:>7}  {:>9}",
            "JOB", "LEVEL", "STATUS", "ACTIONS", "DURATION"
        );
        for job in &self.jobs {
            let ran = job.actions.iter().filter(|action| action.ran()).count();
            let duration = match (job.started_at, job.completed_at) {
                (Some(start), Some(end)) => {
                    let millis = (end - start).num_milliseconds().max(0);
                    format!("{}.{:03}s", millis / 1000, millis % 1000)
                }
                _ => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "{:<name_width$}  {:>5}  {:<8}  {:>7}  {:>9}",
                job.name,
                job.level,
                job.status.as_str(),
                format!("{}/{}", ran, job.actions.len()),
                duration
            );
        }
        let _ = write!(out, "run {} finished: {}", self.run_id, self.status);
        if let Some(reason) = &self.halted {
            let _ = write!(out, " ({})", reason);
        }
        out.push('\n');
        out
    }
}

/// One execution of a plan.
pub struct WorkflowRun {
    plan: Plan,
    config: EngineConfig,
    executors: ExecutorRegistry,
    runtime_env: HashMap<String, String>,
    workspace: PathBuf,
    run_id: Uuid,
    state: Arc<WorkflowRunState>,
    interrupt: CancellationToken,
}

impl WorkflowRun {
    /// The runtime environment layer defaults to the control process's environment.
    pub fn new(plan: Plan, config: EngineConfig, executors: ExecutorRegistry) -> Self {
        let state = Arc::new(WorkflowRunState::new(&plan));
        Self {
            plan,
            config,
            executors,
            runtime_env: std::env::vars().collect(),
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            run_id: Uuid::new_v4(),
            state,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_runtime_env(mut self, runtime_env: HashMap<String, String>) -> Self {
        self.runtime_env = runtime_env;
        self
    }

    /// Directory environment providers run in and resolve against.
    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.config.run_root.join(self.run_id.to_string())
    }

    pub fn control(&self) -> RunControl {
        RunControl {
            state: Arc::clone(&self.state),
            interrupt: self.interrupt.clone(),
        }
    }

    /// Run every level in order and report the outcome.
    ///
    /// Job and provider failures are part of the summary; `Err` is reserved
    /// for failures that prevent reporting, such as an unusable run directory.
    pub async fn execute(self) -> Result<RunSummary, AppError> {
        let started_at = Utc::now();
        let run_dir = self.run_dir();
        fs::create_dir_all(&run_dir).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to create run directory {}: {}", run_dir.display(), err),
            )
            .with_code("RUN-DIR-001")
        })?;
        tracing::info!(
            event = "run_started",
            run_id = %self.run_id,
            workflow = %self.plan.name,
            levels = self.plan.levels.len(),
            "run started"
        );

        let mut resolver = EnvResolver::new(self.runtime_env.clone(), self.plan.env.clone());
        if let Err(err) = resolver
            .load_providers(&self.plan.providers, &self.workspace)
            .await
        {
            tracing::error!(event = "run_aborted", run_id = %self.run_id, error = %err, "environment provider failed");
            let reason = format!("environment provider failed: {}", err);
            self.state.skip_pending(&reason).await;
            return self
                .summarize(started_at, run_dir, Some(reason), RunStatus::Failure)
                .await;
        }

        let run = RunContext {
            run_id: self.run_id,
            run_dir: run_dir.clone(),
        };
        let sandboxes = Arc::new(SandboxRegistry::new());
        let runner = JobRunner {
            run,
            executors: self.executors.clone(),
            sandboxes: Arc::clone(&sandboxes),
            artifacts: ArtifactStore::new(self.config.run_root.clone()),
            env: Arc::new(resolver),
            conditions: ConditionEvaluator::new(self.config.shell.clone()),
            state: Arc::clone(&self.state),
            interrupt: self.interrupt.clone(),
        };
        let scheduler = LevelScheduler::new(runner);

        let mut halted = None;
        for (index, level) in self.plan.levels.iter().enumerate() {
            let cancelled = self.state.is_cancelled();
            if cancelled && halted.is_none() {
                tracing::warn!(event = "run_halted", code = "RUN-CANCEL-001", level = index, "run cancelled; only cancelled() jobs run from here");
                halted = Some(format!("run cancelled before level {}", index));
            }
            let scope = ConditionScope {
                failed: self.state.has_blocking_failures().await,
                cancelled,
            };
            let report = scheduler.run_level(index, level, scope).await;
            // After a cancel the remaining levels still run their cleanup jobs.
            if report.halts() && !self.state.is_cancelled() {
                let reason = match report.fatal() {
                    Some(err) => format!("level {} hit a configuration error: {}", index, err.message),
                    None => format!("level {} had a failing job", index),
                };
                tracing::warn!(event = "run_halted", level = index, reason = %reason, "run halted");
                halted = Some(reason);
                break;
            }
        }
        if let Some(reason) = &halted {
            self.state.skip_pending(reason).await;
        }

        self.teardown(&sandboxes).await;

        let status = if self.state.is_cancelled() {
            RunStatus::Cancelled
        } else if self.state.failed_jobs().await.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        self.summarize(started_at, run_dir, halted, status).await
    }

    async fn summarize(
        &self,
        started_at: DateTime<Utc>,
        run_dir: PathBuf,
        halted: Option<String>,
        status: RunStatus,
    ) -> Result<RunSummary, AppError> {
        let summary = RunSummary {
            run_id: self.run_id,
            workflow: self.plan.name.clone(),
            status,
            exit_code: status.exit_code(),
            started_at,
            completed_at: Utc::now(),
            failed_jobs: self.state.failed_jobs().await,
            halted,
            jobs: self.state.snapshot().await,
            run_dir,
        };
        write_report(&summary.report_path(), &summary)?;
        tracing::info!(
            event = "run_finished",
            run_id = %self.run_id,
            status = %summary.status,
            exit_code = summary.exit_code,
            "run finished"
        );
        Ok(summary)
    }

    async fn teardown(&self, sandboxes: &SandboxRegistry) {
        for sandbox in sandboxes.provisioned() {
            if self.config.keep_sandboxes {
                tracing::info!(event = "sandbox_kept", sandbox = %sandbox.key, "leaving sandbox for caller cleanup");
                continue;
            }
            let result = match self.executors.get(sandbox.spec.kind()) {
                Ok(executor) => executor.teardown(&sandbox).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    tracing::info!(event = "sandbox_teardown", sandbox = %sandbox.key, "sandbox removed")
                }
                Err(err) => {
                    tracing::warn!(event = "sandbox_teardown_failed", sandbox = %sandbox.key, error = %err, "sandbox teardown failed")
                }
            }
        }
    }
}

/// Load, validate and execute `plan` with the default executors.
pub async fn run_workflow(
    plan: Plan,
    config: EngineConfig,
    workspace: PathBuf,
) -> Result<RunSummary, AppError> {
    let executors = ExecutorRegistry::with_defaults(&config);
    WorkflowRun::new(plan, config, executors)
        .with_workspace(workspace)
        .execute()
        .await
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<(), AppError> {
    let data = serde_json::to_vec_pretty(summary).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("failed to serialize run report: {}", err),
        )
    })?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to write {}: {}", tmp_path.display(), err),
        )
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                err
            ),
        )
    })
}
