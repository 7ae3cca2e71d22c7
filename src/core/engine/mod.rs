//! Workflow execution engine: plan model, environment layering, conditions,
//! retry, artifacts, executors and the level scheduler.

pub mod artifacts;
pub mod condition;
pub mod env;
pub mod executor;
pub mod job;
pub mod plan;
pub mod retry;
pub mod scheduler;
pub mod state;

pub use plan::{load_plan, load_plan_str, validate_plan, Plan};
pub use scheduler::{run_workflow, RunControl, RunStatus, RunSummary, WorkflowRun};
pub use state::{JobStatus, WorkflowRunState};
