pub mod config;
pub mod layers;

pub use layers::console::{ConsoleOutput, LogFormat};

use crate::logging::config::LoggingConfig;
use crate::logging::layers::{console, file, BoxLayer};
use crate::Result;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Caller-side overrides applied on top of the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingOverrides {
    pub format: Option<LogFormat>,
    pub console_output: Option<ConsoleOutput>,
}

/// Guards that keep logging sinks active for the duration of the command.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    format: LogFormat,
    log_file_path: Option<PathBuf>,
}

impl LoggingGuard {
    /// Returns the console format selected during initialization.
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Returns the log file path when the file sink is enabled.
    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file_path.as_deref()
    }
}

/// Initialize the logging framework for a command operating on `workspace_root`.
///
/// Precedence: defaults, `[logging]` in `conveyor.toml`, `CONVEYOR_LOG_*` env
/// vars, then `overrides`. `RUST_LOG` replaces the configured level when set.
/// Errors when invoked more than once per process.
pub fn init(workspace_root: &Path, overrides: &LoggingOverrides) -> Result<LoggingGuard> {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(anyhow!("logging already initialized"));
    }

    let mut config = LoggingConfig::load(Some(workspace_root))?;
    if let Some(format) = overrides.format {
        config.format = format;
    }
    if let Some(output) = overrides.console_output {
        config.console_output = output;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_level))
        .context("failed to configure tracing level")?;
    let log_file_path = if config.enable_file {
        Some(file::log_file_path(&config, workspace_root)?)
    } else {
        None
    };

    type FileSubscriber = Layered<BoxLayer<Registry>, Registry>;

    let (file_layer, file_guard) = match &log_file_path {
        Some(path) => file::file_layer::<Registry>(path, true)?,
        None => (layers::noop_layer::<Registry>(), None),
    };
    let console_layer =
        console::console_layer::<FileSubscriber>(config.console_output, config.format);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        format: config.format,
        log_file_path,
    })
}

#[cfg(test)]
/// Reset the initialization guard so tests can reconfigure logging multiple times.
pub fn reset_for_tests() {
    LOGGER_INITIALIZED.store(false, Ordering::SeqCst);
}
