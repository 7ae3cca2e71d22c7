pub mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration loaded from conveyor.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory that holds one directory per run
    #[serde(default = "default_run_root")]
    pub run_root: PathBuf,

    /// Host directory relative executable references resolve against
    #[serde(default = "default_action_store")]
    pub action_store: PathBuf,

    /// Shell used to evaluate shell conditions
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Leave sandboxes in place at run end for caller-driven cleanup
    #[serde(default)]
    pub keep_sandboxes: bool,

    /// Container executor configuration
    #[serde(default)]
    pub container: ContainerConfig,
}

/// Container executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container runtime binary (docker-compatible CLI)
    #[serde(default = "default_container_runtime")]
    pub runtime: String,

    /// Mount point of the action store inside mount-mode containers
    #[serde(default = "default_action_dir")]
    pub action_mount: String,

    /// Directory holding action executables inside build-mode images
    #[serde(default = "default_action_dir")]
    pub image_action_dir: String,

    /// Root of job workspaces inside containers
    #[serde(default = "default_container_workspace")]
    pub workspace_root: String,

    /// Optional directory of `<image>.tar` archives preloaded in build mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_archive_dir: Option<PathBuf>,
}

fn default_run_root() -> PathBuf {
    PathBuf::from(".conveyor/runs")
}

fn default_action_store() -> PathBuf {
    PathBuf::from(".conveyor/actions")
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

fn default_action_dir() -> String {
    "/conveyor/actions".to_string()
}

fn default_container_workspace() -> String {
    "/conveyor/workspace".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            run_root: default_run_root(),
            action_store: default_action_store(),
            shell: default_shell(),
            keep_sandboxes: false,
            container: ContainerConfig::default(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            runtime: default_container_runtime(),
            action_mount: default_action_dir(),
            image_action_dir: default_action_dir(),
            workspace_root: default_container_workspace(),
            image_archive_dir: None,
        }
    }
}

impl EngineConfig {
    /// Make relative host paths absolute against the given workspace.
    pub fn anchored(mut self, workspace: &Path) -> Self {
        if self.run_root.is_relative() {
            self.run_root = workspace.join(&self.run_root);
        }
        if self.action_store.is_relative() {
            self.action_store = workspace.join(&self.action_store);
        }
        if let Some(dir) = &self.container.image_archive_dir {
            if dir.is_relative() {
                self.container.image_archive_dir = Some(workspace.join(dir));
            }
        }
        self
    }
}
