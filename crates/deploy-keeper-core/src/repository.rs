//! Repository state: which working copies exist and whether they are deployable.
//!
//! Readiness is recomputed from the filesystem on every call. The working copy
//! may be changed out-of-band, so no cached flag is trusted.

use crate::{
    config::{ConfigError, DeployConfig, RepositoryConfig, SharedConfig},
    git::{SourceSync, SyncError},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info, instrument, warn};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository '{name}' not found or not enabled")]
    NotFound { name: String },

    #[error("branch '{branch}' is not configured for repository '{repository}'")]
    BranchNotConfigured { repository: String, branch: String },

    #[error("repository configuration invalid: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("failed to remove existing working copy: {0}")]
    Cleanup(#[source] SyncError),

    #[error("failed to setup repository: {0}")]
    Setup(#[source] SyncError),

    #[error("docker-compose file {} not found or empty", .path.display())]
    ComposeFileMissing { path: PathBuf },
}

/// Readiness of one branch's working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingCopyStatus {
    Ready,
    NotCloned,
    MissingCompose,
}

impl std::fmt::Display for WorkingCopyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Ready => "ready",
            Self::NotCloned => "not_cloned",
            Self::MissingCompose => "missing_compose",
        };
        f.write_str(text)
    }
}

// ============================================================================
// Repository Manager
// ============================================================================

/// Resolves repositories from configuration and manages their working copies.
#[derive(Clone)]
pub struct RepositoryManager {
    config: SharedConfig,
    sync: Arc<dyn SourceSync>,
}

impl RepositoryManager {
    pub fn new(config: SharedConfig, sync: Arc<dyn SourceSync>) -> Self {
        Self { config, sync }
    }

    pub fn config(&self) -> Arc<DeployConfig> {
        self.config.snapshot()
    }

    pub fn shared_config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn work_dir(&self) -> PathBuf {
        self.config.snapshot().settings.work_dir.clone()
    }

    /// Enabled repository with this name.
    pub fn get_repository(&self, name: &str) -> Option<RepositoryConfig> {
        self.config.snapshot().enabled_repository(name).cloned()
    }

    pub fn list_repositories(&self) -> Vec<RepositoryConfig> {
        self.config
            .snapshot()
            .enabled_repositories()
            .cloned()
            .collect()
    }

    pub fn is_branch_configured(&self, name: &str, branch: &str) -> bool {
        self.get_repository(name)
            .is_some_and(|repo| repo.has_branch(branch))
    }

    pub fn working_copy_path(&self, repo: &RepositoryConfig, branch: &str) -> PathBuf {
        repo.working_copy_path(&self.work_dir(), branch)
    }

    /// True iff the repository is enabled, the branch is configured, and the
    /// working copy has a `.git` directory and a non-empty compose file.
    pub fn is_initialized(&self, name: &str, branch: &str) -> bool {
        let Some(repo) = self.get_repository(name) else {
            return false;
        };
        if !repo.has_branch(branch) {
            return false;
        }
        self.working_copy_status(&repo, branch) == WorkingCopyStatus::Ready
    }

    /// Readiness of a single branch, without the configuration checks.
    pub fn working_copy_status(&self, repo: &RepositoryConfig, branch: &str) -> WorkingCopyStatus {
        let path = self.working_copy_path(repo, branch);
        if !path.is_dir() || !path.join(".git").exists() {
            return WorkingCopyStatus::NotCloned;
        }
        if compose_file_ready(&path.join(&repo.compose_file)) {
            WorkingCopyStatus::Ready
        } else {
            WorkingCopyStatus::MissingCompose
        }
    }

    /// Readiness of every configured branch of a repository.
    pub fn repository_status(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, WorkingCopyStatus>, RepositoryError> {
        let repo = self.require(name)?;
        Ok(repo
            .branches
            .iter()
            .map(|branch| (branch.clone(), self.working_copy_status(&repo, branch)))
            .collect())
    }

    /// Fresh clone of `branch`, replacing whatever is on disk.
    #[instrument(skip(self, repo), fields(repository = %repo.name, branch = %branch))]
    pub async fn initialize_repository(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
    ) -> Result<(), RepositoryError> {
        repo.validate()?;
        if !repo.has_branch(branch) {
            return Err(RepositoryError::BranchNotConfigured {
                repository: repo.name.clone(),
                branch: branch.to_string(),
            });
        }

        let path = self.working_copy_path(repo, branch);
        if path.exists() {
            info!(path = %path.display(), "Removing existing working copy before initialization");
            if let Err(e) = self.sync.cleanup(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove existing working copy");
            }
        }

        self.sync
            .setup_repository(repo, branch, &path)
            .await
            .map_err(RepositoryError::Setup)?;

        self.verify_compose_file(repo, branch)?;

        info!(path = %path.display(), outcome = "success", "Repository initialized");
        Ok(())
    }

    /// Delete and re-clone, failing if the deletion fails.
    #[instrument(skip(self))]
    pub async fn force_reinitialize(&self, name: &str, branch: &str) -> Result<(), RepositoryError> {
        let repo = self.require(name)?;
        if !repo.has_branch(branch) {
            return Err(RepositoryError::BranchNotConfigured {
                repository: repo.name.clone(),
                branch: branch.to_string(),
            });
        }

        let path = self.working_copy_path(&repo, branch);
        warn!(path = %path.display(), "Forcing reinitialization of working copy");
        self.sync
            .cleanup(&path)
            .await
            .map_err(RepositoryError::Cleanup)?;

        self.initialize_repository(&repo, branch).await
    }

    /// Bring every configured branch of a repository up to date.
    #[instrument(skip(self))]
    pub async fn update_repository(&self, name: &str) -> Result<(), RepositoryError> {
        let repo = self.require(name)?;
        for branch in &repo.branches {
            let path = self.working_copy_path(&repo, branch);
            self.sync
                .setup_repository(&repo, branch, &path)
                .await
                .map_err(RepositoryError::Setup)?;
            self.verify_compose_file(&repo, branch)?;
        }
        Ok(())
    }

    /// Clone every enabled repository that is not ready yet.
    ///
    /// Failures are logged per branch; the returned count is the number of
    /// branches that failed.
    pub async fn initialize_all(&self) -> usize {
        let mut failures = 0;
        for repo in self.list_repositories() {
            for branch in &repo.branches {
                if self.is_initialized(&repo.name, branch) {
                    continue;
                }
                if let Err(e) = self.initialize_repository(&repo, branch).await {
                    error!(repository = %repo.name, branch = %branch, error = %e, "Initialization failed");
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Fetch and hard-reset an existing working copy (or clone a missing one).
    pub async fn sync_working_copy(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
    ) -> Result<PathBuf, SyncError> {
        let path = self.working_copy_path(repo, branch);
        self.sync.setup_repository(repo, branch, &path).await?;
        Ok(path)
    }

    pub async fn head_commit(&self, repo: &RepositoryConfig, branch: &str) -> Option<String> {
        let path = self.working_copy_path(repo, branch);
        self.sync.head_commit(&path).await.ok()
    }

    fn require(&self, name: &str) -> Result<RepositoryConfig, RepositoryError> {
        self.get_repository(name)
            .ok_or_else(|| RepositoryError::NotFound {
                name: name.to_string(),
            })
    }

    fn verify_compose_file(&self, repo: &RepositoryConfig, branch: &str) -> Result<(), RepositoryError> {
        let path = self.working_copy_path(repo, branch).join(&repo.compose_file);
        if compose_file_ready(&path) {
            Ok(())
        } else {
            Err(RepositoryError::ComposeFileMissing { path })
        }
    }
}

fn compose_file_ready(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "repository_tests.rs"]
mod tests;
