#![allow(clippy::result_large_err)] // Provider failures carry AppError codes up to the run.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// Workspace-relative file actions append `KEY=value` lines to.
pub const JOB_ENV_FILE: &str = ".conveyor/env";
/// Variable naming the job env file inside the action's view of the workspace.
pub const JOB_ENV_VAR: &str = "CONVEYOR_ENV";

pub type EnvMap = IndexMap<String, String>;

fn export_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$").expect("valid export regex")
    })
}

fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parse `export KEY=value` lines; other lines are ignored.
pub fn parse_exports(output: &str) -> EnvMap {
    let mut vars = EnvMap::new();
    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("export ") {
            continue;
        }
        if let Some(caps) = export_line().captures(trimmed) {
            vars.insert(caps[1].to_string(), strip_quotes(&caps[2]).to_string());
        }
    }
    vars
}

/// Job-local key/value store fed by the job env file.
///
/// Wiped whenever a fresh job workspace is prepared; never visible to other jobs.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    values: EnvMap,
}

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the context with the assignments found in the env file contents.
    /// Accepts both `KEY=value` and `export KEY=value`; later lines win.
    pub fn load(&mut self, contents: &str) {
        self.values.clear();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(caps) = export_line().captures(trimmed) {
                self.values
                    .insert(caps[1].to_string(), strip_quotes(&caps[2]).to_string());
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn values(&self) -> &EnvMap {
        &self.values
    }
}

/// Layers environment sources into one map per job or action.
///
/// Priority, highest first: runtime, action, job context, job, engine
/// variables, providers, workflow. A lower layer never overwrites a key a
/// higher layer already set.
#[derive(Debug, Clone)]
pub struct EnvResolver {
    runtime: HashMap<String, String>,
    providers: EnvMap,
    workflow: EnvMap,
}

impl EnvResolver {
    pub fn new(runtime: HashMap<String, String>, workflow: EnvMap) -> Self {
        Self {
            runtime,
            providers: EnvMap::new(),
            workflow,
        }
    }

    /// Snapshot the control process environment as the runtime layer.
    pub fn from_process(workflow: EnvMap) -> Self {
        Self::new(std::env::vars().collect(), workflow)
    }

    /// Run every provider once, in order. Later providers override earlier ones.
    pub async fn load_providers(
        &mut self,
        providers: &[PathBuf],
        base_dir: &Path,
    ) -> Result<(), AppError> {
        for provider in providers {
            let path = if provider.is_absolute() {
                provider.clone()
            } else {
                base_dir.join(provider)
            };
            let vars = run_provider(&path, base_dir).await?;
            tracing::info!(
                event = "provider_loaded",
                provider = %path.display(),
                vars = vars.len(),
                "environment provider loaded"
            );
            self.providers.extend(vars);
        }
        Ok(())
    }

    /// Environment for job-level concerns such as job conditions.
    pub fn resolve_job(&self, job_env: &EnvMap) -> EnvMap {
        self.layered(&[job_env, &self.providers, &self.workflow])
    }

    /// Environment handed to one action invocation.
    pub fn resolve_action(
        &self,
        action_env: &EnvMap,
        context: &JobContext,
        job_env: &EnvMap,
        engine_vars: &EnvMap,
    ) -> EnvMap {
        self.layered(&[
            action_env,
            context.values(),
            job_env,
            engine_vars,
            &self.providers,
            &self.workflow,
        ])
    }

    fn layered(&self, layers: &[&EnvMap]) -> EnvMap {
        let mut resolved = EnvMap::new();
        for layer in layers {
            for (key, value) in layer.iter() {
                if !resolved.contains_key(key) {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in resolved.iter_mut() {
            if let Some(runtime) = self.runtime.get(key) {
                *value = runtime.clone();
            }
        }
        resolved
    }
}

async fn run_provider(path: &Path, cwd: &Path) -> Result<EnvMap, AppError> {
    let output = Command::new(path)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| {
            AppError::new(
                ErrorCategory::ConfigurationError,
                format!(
                    "failed to start environment provider {}: {}",
                    path.display(),
                    err
                ),
            )
            .with_code("ENV-PROV-002")
        })?;

    if !output.status.success() {
        let mut err = AppError::new(
            ErrorCategory::ConfigurationError,
            format!(
                "environment provider {} exited with {}",
                path.display(),
                output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "a signal".to_string())
            ),
        )
        .with_code("ENV-PROV-001");
        err.add_context("stderr", String::from_utf8_lossy(&output.stderr).trim());
        return Err(err);
    }

    Ok(parse_exports(&String::from_utf8_lossy(&output.stdout)))
}
