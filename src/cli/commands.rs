use crate::cli::args::{RunArgs, ValidateArgs};
use crate::core::config::ConfigLoader;
use crate::core::engine::executor::ExecutorRegistry;
use crate::core::engine::plan::load_plan;
use crate::core::engine::scheduler::{RunControl, WorkflowRun};
use crate::logging::{self, LoggingOverrides};
use crate::Result;
use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

pub async fn run(args: RunArgs) -> Result<i32> {
    let workspace = resolve_workspace(args.workspace.as_deref())?;
    let _logging = logging::init(
        &workspace,
        &LoggingOverrides {
            format: args.log_format,
            console_output: None,
        },
    )?;

    let mut config = ConfigLoader::load_from_workspace(&workspace)?;
    if args.keep_sandboxes {
        config.keep_sandboxes = true;
    }
    let plan = load_plan(&args.plan)?;
    tracing::debug!(plan = %args.plan.display(), workspace = %workspace.display(), "plan loaded");

    let executors = ExecutorRegistry::with_defaults(&config);
    let run = WorkflowRun::new(plan, config, executors).with_workspace(workspace);
    let signals = tokio::spawn(watch_signals(run.control()));
    let result = run.execute().await;
    signals.abort();

    let summary = result?;
    print!("{}", summary.render_table());
    println!("report: {}", summary.report_path().display());
    Ok(summary.exit_code)
}

pub async fn validate(args: ValidateArgs) -> Result<i32> {
    let plan = load_plan(&args.plan)?;
    let jobs = plan.jobs().count();
    let actions: usize = plan.jobs().map(|job| job.actions.len()).sum();
    println!(
        "plan '{}' is valid: {} levels, {} jobs, {} actions",
        plan.name,
        plan.levels.len(),
        jobs,
        actions
    );
    Ok(0)
}

/// First Ctrl-C cancels cooperatively, the second kills running actions.
async fn watch_signals(control: RunControl) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("cancelling run; press Ctrl-C again to interrupt running actions");
    control.cancel();
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    control.interrupt();
}

fn resolve_workspace(workspace: Option<&Path>) -> Result<PathBuf> {
    let cwd = env::current_dir().context("failed to read current directory")?;
    Ok(match workspace {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => cwd.join(path),
        None => cwd,
    })
}
