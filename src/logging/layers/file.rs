use crate::logging::config::LoggingConfig;
use crate::logging::layers::{noop_layer, BoxLayer};
use crate::Result;
use anyhow::{anyhow, Context};
use std::fs::{create_dir_all, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self as tracing_fmt, writer::BoxMakeWriter};
use tracing_subscriber::layer::Layer;
use tracing_subscriber::registry::LookupSpan;

/// File name of the run log inside the log directory.
pub const LOG_FILE_NAME: &str = "conveyor.log";

/// Determine the file layout used by the logging file sink.
pub fn log_file_path(config: &LoggingConfig, workspace_root: &Path) -> Result<PathBuf> {
    let directory = resolve_log_dir(config, workspace_root)?;
    Ok(directory.join(LOG_FILE_NAME))
}

/// Build a tracing layer that appends JSON lines to `log_file` via a non-blocking writer.
pub fn file_layer<S>(log_file: &Path, enabled: bool) -> Result<(BoxLayer<S>, Option<WorkerGuard>)>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    if !enabled {
        return Ok((noop_layer(), None));
    }
    ensure_log_dir(log_file)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let writer = BoxMakeWriter::new(move || non_blocking.clone());
    let layer = tracing_fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .json()
        .flatten_event(true)
        .boxed();
    Ok((layer, Some(guard)))
}

fn ensure_log_dir(log_file: &Path) -> Result<()> {
    let directory = log_file.parent().ok_or_else(|| {
        anyhow!(
            "log file path {} has no parent directory",
            log_file.display()
        )
    })?;
    create_dir_all(directory)
        .with_context(|| format!("failed to create log directory {}", directory.display()))?;
    Ok(())
}

fn resolve_log_dir(config: &LoggingConfig, workspace_root: &Path) -> Result<PathBuf> {
    let Some(custom) = &config.log_dir else {
        return Ok(workspace_root.join(".conveyor").join("logs"));
    };
    if custom.is_absolute() {
        return Ok(custom.clone());
    }
    if custom
        .components()
        .any(|component| component.as_os_str() == "..")
    {
        return Err(anyhow!(
            "logging.log_dir resolves outside workspace {}",
            workspace_root.display()
        ));
    }
    Ok(workspace_root.join(custom))
}
