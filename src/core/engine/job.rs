#![allow(clippy::result_large_err)]

use crate::core::engine::artifacts::ArtifactStore;
use crate::core::engine::condition::{ConditionEvaluator, ConditionScope, ShellSite};
use crate::core::engine::env::{EnvMap, EnvResolver, JobContext, JOB_ENV_FILE, JOB_ENV_VAR};
use crate::core::engine::executor::{
    ActionInvocation, Executor, ExecutorRegistry, JobWorkspace, RunContext, SandboxRegistry,
};
use crate::core::engine::plan::{ActionSpec, Condition, JobSpec};
use crate::core::engine::retry::RetryPolicy;
use crate::core::engine::state::{ActionRecord, JobStatus, WorkflowRunState};
use crate::core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Terminal result of one job, as seen by the level scheduler.
#[derive(Debug)]
pub struct JobOutcome {
    pub name: String,
    pub status: JobStatus,
    pub continue_on_error: bool,
    /// A configuration error that must halt the run after this level.
    pub fatal: Option<AppError>,
}

impl JobOutcome {
    /// Whether this outcome stops the run from starting further levels.
    pub fn blocks_run(&self) -> bool {
        self.fatal.is_some() || (self.status == JobStatus::Failure && !self.continue_on_error)
    }
}

/// Everything a job needs from its run. Cheap to clone into each job task.
#[derive(Clone)]
pub struct JobRunner {
    pub(crate) run: RunContext,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) sandboxes: Arc<SandboxRegistry>,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) env: Arc<EnvResolver>,
    pub(crate) conditions: ConditionEvaluator,
    pub(crate) state: Arc<WorkflowRunState>,
    pub(crate) interrupt: CancellationToken,
}

struct JobProgress {
    actions: Vec<ActionRecord>,
    failed: bool,
    error: Option<String>,
}

impl JobProgress {
    fn fail(&mut self, err: &AppError) {
        self.failed = true;
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }
}

impl JobRunner {
    /// Run `job` to a terminal state. `scope` carries untolerated failures of
    /// earlier levels.
    pub async fn run_job(&self, job: &JobSpec, scope: ConditionScope) -> JobOutcome {
        let outcome = |status, fatal| JobOutcome {
            name: job.name.clone(),
            status,
            continue_on_error: job.continue_on_error,
            fatal,
        };

        let scope = ConditionScope {
            cancelled: self.state.is_cancelled(),
            ..scope
        };
        // Once cancelled, only cancellation handlers still run.
        if scope.cancelled && !matches!(job.condition, Condition::Cancelled) {
            tracing::info!(job = %job.name, event = "job_skipped", condition = %job.condition, "run cancelled");
            self.state
                .skip_job(&job.name, Some("run cancelled".to_string()))
                .await;
            return outcome(JobStatus::Skipped, None);
        }

        let job_env = self.env.resolve_job(&job.env);
        match self
            .conditions
            .evaluate(&job.condition, scope, &job_env, ShellSite::Host)
            .await
        {
            Ok(decision) if !decision.should_run() => {
                tracing::info!(job = %job.name, event = "job_skipped", condition = %job.condition, "job condition not met");
                self.state
                    .skip_job(&job.name, Some(format!("condition {} not met", job.condition)))
                    .await;
                return outcome(JobStatus::Skipped, None);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(job = %job.name, event = "job_failed", error = %err, "job condition could not be evaluated");
                self.state
                    .finish_job(&job.name, JobStatus::Failure, Vec::new(), Some(err.to_string()))
                    .await;
                return outcome(JobStatus::Failure, Some(err));
            }
        }

        self.state.start_job(&job.name).await;
        tracing::info!(job = %job.name, event = "job_started", executor = %job.executor.canonical_key(), "job started");
        let started = Instant::now();

        let mut progress = JobProgress {
            actions: Vec::new(),
            failed: false,
            error: None,
        };
        let fatal = self.drive(job, &mut progress).await;
        if let Some(err) = &fatal {
            progress.fail(err);
        }

        let status = if progress.failed {
            JobStatus::Failure
        } else {
            JobStatus::Success
        };
        tracing::info!(
            job = %job.name,
            event = "job_finished",
            status = %status,
            duration_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        self.state
            .finish_job(&job.name, status, progress.actions, progress.error)
            .await;
        outcome(status, fatal)
    }

    /// Workspace, inputs, actions, outputs. Returns a fatal error if one occurred.
    async fn drive(&self, job: &JobSpec, progress: &mut JobProgress) -> Option<AppError> {
        let workspace = match self.open_workspace(job).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(job = %job.name, event = "job_failed", error = %err, "job workspace unavailable");
                progress.fail(&err);
                return err.is_fatal().then_some(err);
            }
        };
        let (executor, workspace) = workspace;

        for input in &job.inputs {
            if let Err(err) = self
                .artifacts
                .restore(&self.run.run_id, &input.name, executor.as_ref(), &workspace, &input.path)
                .await
            {
                tracing::error!(job = %job.name, event = "restore_failed", artifact = %input.name, error = %err, "artifact restore failed");
                progress.fail(&err);
                return err.is_fatal().then_some(err);
            }
        }

        let mut context = JobContext::new();
        for action in &job.actions {
            if self.interrupt.is_cancelled() {
                progress.actions.push(ActionRecord::skipped(&action.name));
                continue;
            }
            if let Err(err) = self
                .run_action(job, action, executor.as_ref(), &workspace, &mut context, progress)
                .await
            {
                tracing::error!(job = %job.name, action = %action.name, event = "action_error", error = %err, "action aborted the job");
                progress.fail(&err);
                return Some(err);
            }
        }

        if self.interrupt.is_cancelled() {
            progress.failed = true;
            return None;
        }
        for output in &job.outputs {
            if let Err(err) = self
                .artifacts
                .save(&self.run.run_id, &output.name, executor.as_ref(), &workspace, &output.path)
                .await
            {
                tracing::error!(job = %job.name, event = "save_failed", artifact = %output.name, error = %err, "artifact save failed");
                progress.fail(&err);
            }
        }
        None
    }

    async fn open_workspace(
        &self,
        job: &JobSpec,
    ) -> Result<(Arc<dyn Executor>, JobWorkspace), AppError> {
        let executor = self.executors.get(job.executor.kind())?;
        let sandbox = self
            .sandboxes
            .acquire(&job.executor, executor.as_ref(), &self.run)
            .await?;
        let workspace = executor.prepare_job_workspace(&sandbox, &job.name).await?;
        Ok((executor, workspace))
    }

    /// Evaluate, then run one action through its retry policy.
    ///
    /// Only configuration errors are returned; action failures land in `progress`.
    async fn run_action(
        &self,
        job: &JobSpec,
        action: &ActionSpec,
        executor: &dyn Executor,
        workspace: &JobWorkspace,
        context: &mut JobContext,
        progress: &mut JobProgress,
    ) -> Result<(), AppError> {
        match executor.read_file(workspace, JOB_ENV_FILE).await {
            Ok(Some(contents)) => context.load(&contents),
            Ok(None) => context.clear(),
            Err(err) => {
                tracing::warn!(job = %job.name, action = %action.name, error = %err, "job env file unreadable; keeping previous values")
            }
        }

        let engine_vars = self.engine_vars(job, action, workspace);
        let env = self
            .env
            .resolve_action(&action.env, context, &job.env, &engine_vars);
        let scope = ConditionScope {
            failed: progress.failed,
            cancelled: self.state.is_cancelled(),
        };
        let site = ShellSite::Workspace {
            executor,
            workspace,
        };
        let decision = self
            .conditions
            .evaluate(&action.condition, scope, &env, site)
            .await?;
        if !decision.should_run() {
            tracing::info!(job = %job.name, action = %action.name, event = "action_skipped", condition = %action.condition, "action condition not met");
            progress.actions.push(ActionRecord::skipped(&action.name));
            return Ok(());
        }

        let policy = RetryPolicy::from_spec(action.retry.as_ref());
        tracing::info!(
            job = %job.name,
            action = %action.name,
            event = "action_started",
            max_attempts = policy.max_attempts(),
            "action started"
        );
        let invocation = ActionInvocation {
            job: &job.name,
            action,
            env: &env,
        };
        let report = policy
            .execute(&self.interrupt, |_attempt| {
                executor.run(workspace, invocation, &self.interrupt)
            })
            .await;

        let result = &report.result;
        if result.is_success() {
            tracing::info!(
                job = %job.name,
                action = %action.name,
                event = "action_finished",
                exit_code = result.exit_code.unwrap_or_default(),
                attempt = report.attempts,
                duration_ms = result.duration.as_millis() as u64,
                "action succeeded"
            );
        } else {
            tracing::warn!(
                job = %job.name,
                action = %action.name,
                event = "action_finished",
                exit_code = result.exit_code.unwrap_or(-1),
                attempt = report.attempts,
                duration_ms = result.duration.as_millis() as u64,
                timed_out = result.timed_out,
                error = result.error.as_deref().unwrap_or(""),
                "action failed"
            );
            progress.failed = true;
        }
        progress
            .actions
            .push(ActionRecord::executed(&action.name, report.attempts, report.result));
        Ok(())
    }

    fn engine_vars(&self, job: &JobSpec, action: &ActionSpec, workspace: &JobWorkspace) -> EnvMap {
        let mut vars = EnvMap::new();
        vars.insert("CONVEYOR_WORKSPACE".into(), workspace.path.clone());
        vars.insert("CONVEYOR_JOB".into(), job.name.clone());
        vars.insert("CONVEYOR_ACTION".into(), action.name.clone());
        vars.insert("CONVEYOR_RUN_ID".into(), self.run.run_id.to_string());
        vars.insert(JOB_ENV_VAR.into(), workspace.env_file_path());
        vars
    }
}
