use crate::core::engine::executor::ExitResult;
use crate::core::engine::plan::Plan;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Lifecycle of one job within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Failure,
    Skipped,
}

/// What happened to one action of a job.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub name: String,
    pub status: ActionStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExitResult>,
}

impl ActionRecord {
    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ActionStatus::Skipped,
            attempts: 0,
            result: None,
        }
    }

    pub fn executed(name: &str, attempts: u32, result: ExitResult) -> Self {
        let status = if result.is_success() {
            ActionStatus::Success
        } else {
            ActionStatus::Failure
        };
        Self {
            name: name.to_string(),
            status,
            attempts,
            result: Some(result),
        }
    }

    pub fn ran(&self) -> bool {
        self.status != ActionStatus::Skipped
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub name: String,
    pub level: usize,
    pub status: JobStatus,
    pub continue_on_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actions: Vec<ActionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct JobTable {
    jobs: IndexMap<String, JobRecord>,
    failed_jobs: BTreeSet<String>,
}

/// Run-wide state shared by every concurrently running job.
///
/// Job records and the failed set sit behind one lock; the cancelled flag is
/// readable without it so signal handlers never wait on job bookkeeping.
pub struct WorkflowRunState {
    table: RwLock<JobTable>,
    cancelled: AtomicBool,
}

impl WorkflowRunState {
    /// Every job of the plan starts `Pending`, in plan order.
    pub fn new(plan: &Plan) -> Self {
        let mut jobs = IndexMap::new();
        for (level, spec) in plan.levels.iter().enumerate() {
            for job in &spec.jobs {
                jobs.insert(
                    job.name.clone(),
                    JobRecord {
                        name: job.name.clone(),
                        level,
                        status: JobStatus::Pending,
                        continue_on_error: job.continue_on_error,
                        started_at: None,
                        completed_at: None,
                        actions: Vec::new(),
                        error: None,
                    },
                );
            }
        }
        Self {
            table: RwLock::new(JobTable {
                jobs,
                failed_jobs: BTreeSet::new(),
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    pub async fn start_job(&self, name: &str) {
        let mut guard = self.table.write().await;
        if let Some(record) = guard.jobs.get_mut(name) {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }

    /// Record a terminal status. `Failure` also lands in the failed set.
    pub async fn finish_job(
        &self,
        name: &str,
        status: JobStatus,
        actions: Vec<ActionRecord>,
        error: Option<String>,
    ) {
        let mut guard = self.table.write().await;
        if let Some(record) = guard.jobs.get_mut(name) {
            record.status = status;
            record.completed_at = Some(Utc::now());
            record.actions = actions;
            record.error = error;
        }
        if status == JobStatus::Failure {
            guard.failed_jobs.insert(name.to_string());
        }
    }

    pub async fn skip_job(&self, name: &str, reason: Option<String>) {
        self.finish_job(name, JobStatus::Skipped, Vec::new(), reason)
            .await;
    }

    /// Mark every job still `Pending` as `Skipped`.
    pub async fn skip_pending(&self, reason: &str) {
        let mut guard = self.table.write().await;
        let now = Utc::now();
        for record in guard.jobs.values_mut() {
            if record.status == JobStatus::Pending {
                record.status = JobStatus::Skipped;
                record.completed_at = Some(now);
                record.error = Some(reason.to_string());
            }
        }
    }

    pub async fn status(&self, name: &str) -> Option<JobStatus> {
        self.table.read().await.jobs.get(name).map(|r| r.status)
    }

    /// Whether a job without `continue_on_error` has failed. Tolerated
    /// failures still count in `failed_jobs` but not here.
    pub async fn has_blocking_failures(&self) -> bool {
        let guard = self.table.read().await;
        guard.failed_jobs.iter().any(|name| {
            guard
                .jobs
                .get(name)
                .is_some_and(|record| !record.continue_on_error)
        })
    }

    pub async fn failed_jobs(&self) -> Vec<String> {
        self.table.read().await.failed_jobs.iter().cloned().collect()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<JobRecord> {
        self.table.read().await.jobs.values().cloned().collect()
    }
}
