#![allow(dead_code)]

use async_trait::async_trait;
use conveyor::core::config::{ContainerConfig, EngineConfig};
use conveyor::core::engine::env::EnvMap;
use conveyor::core::engine::executor::container::{
    ContainerExecutor, ContainerRuntime, ContainerStart, RuntimeOutput,
};
use conveyor::core::engine::executor::copy::{copy_dir_contents, copy_into};
use conveyor::core::engine::executor::local::LocalExecutor;
use conveyor::core::engine::executor::ExecutorRegistry;
use conveyor::core::engine::plan::{load_plan_str, ExecutorKind, Plan};
use conveyor::core::engine::{RunSummary, WorkflowRun};
use conveyor::core::error::AppError;
use conveyor::core::types::ErrorCategory;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::process::Command;

/// Write an executable `sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(dir).expect("script dir");
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Container runtime that maps every container onto the host filesystem.
///
/// Container paths are host paths, so `workspace_root`, `action_mount` and
/// `image_action_dir` must point at host directories.
#[derive(Default)]
pub struct DirRuntime {
    pub starts: AtomicUsize,
    pub loads: AtomicUsize,
    pub started: Mutex<Vec<ContainerStart>>,
    pub removed: Mutex<Vec<String>>,
    /// Every `run_in` argv, in call order.
    pub commands: Mutex<Vec<Vec<String>>>,
}

impl DirRuntime {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn copy_failure(err: std::io::Error) -> AppError {
    AppError::new(ErrorCategory::ArtifactError, err.to_string()).with_code("ART-COPY-001")
}

#[async_trait]
impl ContainerRuntime for DirRuntime {
    async fn load_image(&self, archive: &Path) -> Result<(), AppError> {
        assert!(archive.is_file(), "preloaded archive must exist");
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, request: &ContainerStart) -> Result<String, AppError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(request.clone());
        Ok(request.name.clone())
    }

    async fn run_in(&self, _id: &str, argv: &[String]) -> Result<RuntimeOutput, AppError> {
        self.commands.lock().unwrap().push(argv.to_vec());
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(AppError::from)?;
        Ok(RuntimeOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn exec_command(&self, _id: &str, workdir: &str, env: &EnvMap, argv: &[String]) -> Command {
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(workdir).envs(env);
        command
    }

    async fn copy_from(&self, _id: &str, source: &str, host_dest: &Path) -> Result<(), AppError> {
        match source.strip_suffix("/.") {
            Some(dir) => copy_dir_contents(Path::new(dir), host_dest),
            None => copy_into(Path::new(source), false, host_dest),
        }
        .map_err(copy_failure)
    }

    async fn copy_to(&self, host_source: &Path, _id: &str, dest: &str) -> Result<(), AppError> {
        copy_dir_contents(host_source, Path::new(dest)).map_err(copy_failure)
    }

    async fn remove(&self, id: &str) -> Result<(), AppError> {
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Temporary workspace with an action store, a run root and a fake container host.
pub struct Fixture {
    pub root: TempDir,
    pub config: EngineConfig,
    pub runtime: Arc<DirRuntime>,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let base = root.path().to_path_buf();
        let config = EngineConfig {
            run_root: base.join("runs"),
            action_store: base.join("actions"),
            container: ContainerConfig {
                action_mount: base.join("actions").display().to_string(),
                image_action_dir: base.join("image-actions").display().to_string(),
                workspace_root: base.join("containers").display().to_string(),
                ..ContainerConfig::default()
            },
            ..EngineConfig::default()
        };
        for dir in ["runs", "actions", "image-actions", "containers", "shared"] {
            fs::create_dir_all(base.join(dir)).expect("fixture dir");
        }
        Self {
            root,
            config,
            runtime: Arc::new(DirRuntime::default()),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Directory outside every sandbox that scripts may use to leave evidence.
    pub fn shared(&self) -> PathBuf {
        self.path().join("shared")
    }

    /// Write an action into the host store and the build-mode image directory.
    pub fn action(&self, name: &str, body: &str) {
        write_script(&self.config.action_store, name, body);
        write_script(&self.path().join("image-actions"), name, body);
    }

    pub fn registry(&self) -> ExecutorRegistry {
        let runtime: Arc<dyn ContainerRuntime> = self.runtime.clone();
        let mut builder = ExecutorRegistry::builder();
        builder
            .register(
                ExecutorKind::Local,
                LocalExecutor::new(self.config.action_store.clone()),
            )
            .register(
                ExecutorKind::ContainerMount,
                ContainerExecutor::mount(
                    Arc::clone(&runtime),
                    self.config.container.clone(),
                    self.config.action_store.clone(),
                ),
            )
            .register(
                ExecutorKind::ContainerBuild,
                ContainerExecutor::build(runtime, self.config.container.clone()),
            );
        builder.build()
    }

    /// Plan text with `{shared}` replaced by the shared evidence directory.
    pub fn plan(&self, yaml: &str) -> Plan {
        let text = yaml.replace("{shared}", &self.shared().display().to_string());
        load_plan_str(&text).expect("valid plan")
    }

    pub fn workflow(&self, plan: Plan) -> WorkflowRun {
        WorkflowRun::new(plan, self.config.clone(), self.registry())
            .with_runtime_env(HashMap::new())
            .with_workspace(self.path().to_path_buf())
    }

    pub async fn run(&self, yaml: &str) -> RunSummary {
        self.workflow(self.plan(yaml))
            .execute()
            .await
            .expect("run executes")
    }

    pub fn evidence(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.shared().join(name)).ok()
    }
}
