#![allow(clippy::result_large_err)] // Artifact store returns AppError so save/restore failures keep their codes.

use crate::core::engine::executor::{validate_segment, Executor, JobWorkspace};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Host-side artifact storage, one directory per run and artifact name.
///
/// Saves stage into a hidden sibling and swap it in once the copy finished,
/// so a restore never observes a half-written artifact.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    runs_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(runs_root: PathBuf) -> Self {
        Self { runs_root }
    }

    pub fn artifact_dir(&self, run_id: &Uuid, name: &str) -> PathBuf {
        self.runs_root
            .join(run_id.to_string())
            .join("artifacts")
            .join(name)
    }

    pub fn exists(&self, run_id: &Uuid, name: &str) -> bool {
        self.artifact_dir(run_id, name).is_dir()
    }

    /// Copy `source_path` out of the job workspace and store it as `name`.
    pub async fn save(
        &self,
        run_id: &Uuid,
        name: &str,
        executor: &dyn Executor,
        workspace: &JobWorkspace,
        source_path: &str,
    ) -> Result<PathBuf, AppError> {
        validate_segment("artifact name", name)?;
        let final_dir = self.artifact_dir(run_id, name);
        let parent = final_dir.parent().ok_or_else(|| {
            AppError::new(ErrorCategory::ArtifactError, "invalid artifact path")
                .with_code("ART-SAVE-002")
        })?;
        let staging = parent.join(format!(".{}.partial", name));
        reset_dir(&staging)?;

        if let Err(err) = executor.copy_out(workspace, source_path, &staging).await {
            let _ = fs::remove_dir_all(&staging);
            return Err(err
                .with_detail("artifact", name)
                .with_detail("job", &workspace.job));
        }

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).map_err(|err| io_failure(&final_dir, err))?;
        }
        fs::rename(&staging, &final_dir).map_err(|err| io_failure(&final_dir, err))?;
        tracing::info!(
            event = "artifact_saved",
            artifact = name,
            job = %workspace.job,
            source = source_path,
            "artifact saved"
        );
        Ok(final_dir)
    }

    /// Copy the stored artifact `name` into `target_path` of the job workspace.
    ///
    /// A missing artifact means the plan is inconsistent and is reported as a
    /// configuration error.
    pub async fn restore(
        &self,
        run_id: &Uuid,
        name: &str,
        executor: &dyn Executor,
        workspace: &JobWorkspace,
        target_path: &str,
    ) -> Result<(), AppError> {
        validate_segment("artifact name", name)?;
        if !self.exists(run_id, name) {
            return Err(AppError::new(
                ErrorCategory::ConfigurationError,
                format!(
                    "artifact '{}' required by job '{}' was never saved in this run",
                    name, workspace.job
                ),
            )
            .with_code("ART-RESTORE-001"));
        }
        let dir = self.artifact_dir(run_id, name);
        executor
            .copy_in(&dir, workspace, target_path)
            .await
            .map_err(|err| err.with_detail("artifact", name))?;
        tracing::info!(
            event = "artifact_restored",
            artifact = name,
            job = %workspace.job,
            target = target_path,
            "artifact restored"
        );
        Ok(())
    }
}

fn reset_dir(path: &Path) -> Result<(), AppError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|err| io_failure(path, err))?;
    }
    fs::create_dir_all(path).map_err(|err| io_failure(path, err))
}

fn io_failure(path: &Path, err: std::io::Error) -> AppError {
    AppError::new(
        ErrorCategory::IoError,
        format!("failed to prepare artifact directory {}: {}", path.display(), err),
    )
    .with_code("ART-SAVE-002")
}
