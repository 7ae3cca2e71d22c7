#![allow(clippy::result_large_err)]

use super::EngineConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "conveyor.toml";

/// Top-level shape of conveyor.toml; the `[logging]` table is read separately.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: Option<EngineConfig>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from workspace root (workspace/conveyor.toml)
    /// Environment variables override config file values
    pub fn load_from_workspace(workspace_path: &Path) -> Result<EngineConfig, AppError> {
        let config_path = workspace_path.join(CONFIG_FILE_NAME);
        let mut config = Self::load_from_file(&config_path)?.unwrap_or_default();

        Self::apply_env_overrides(&mut config);

        Ok(config.anchored(workspace_path))
    }

    /// Load config from specific file path
    /// Returns Ok(None) if file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<EngineConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let parsed: ConfigFile = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ConfigurationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("CFG-FILE-001")
        })?;

        Ok(Some(parsed.engine.unwrap_or_default()))
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(config: &mut EngineConfig) {
        if let Ok(run_root) = env::var("CONVEYOR_RUN_ROOT") {
            config.run_root = PathBuf::from(run_root);
        }

        if let Ok(action_store) = env::var("CONVEYOR_ACTION_STORE") {
            config.action_store = PathBuf::from(action_store);
        }

        if let Ok(runtime) = env::var("CONVEYOR_CONTAINER_RUNTIME") {
            if !runtime.trim().is_empty() {
                config.container.runtime = runtime;
            }
        }

        if let Ok(shell) = env::var("CONVEYOR_SHELL") {
            if !shell.trim().is_empty() {
                config.shell = shell;
            }
        }

        if let Ok(keep) = env::var("CONVEYOR_KEEP_SANDBOXES") {
            if let Ok(keep) = keep.parse::<bool>() {
                config.keep_sandboxes = keep;
            }
        }
    }
}
