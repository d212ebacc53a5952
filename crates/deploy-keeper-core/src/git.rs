//! Working copy synchronisation through the `git` command-line client.
//!
//! A working copy moves through `absent -> cloned -> updated` and back to
//! `absent` when it is cleaned up. Clones are shallow and single-branch;
//! updates fetch the branch and hard-reset to the remote tip.

use crate::{
    command::{CommandError, CommandOutput, CommandRunner, CommandSpec},
    config::RepositoryConfig,
    safe_directory::SafeDirectoryRegistry,
    ssh::Transport,
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

/// Substrings `git` prints when it refuses a directory owned by someone else.
const OWNERSHIP_MARKERS: [&str; 3] = [
    "dubious ownership",
    "unsafe repository",
    "is owned by someone else",
];

/// Returns `true` if `git` output reports an ownership mismatch.
pub fn is_ownership_error(output: &str) -> bool {
    OWNERSHIP_MARKERS.iter().any(|marker| output.contains(marker))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("git clone failed: {output}")]
    CloneFailed { output: String },

    #[error("fetch failed: {output}")]
    FetchFailed { output: String },

    #[error("reset failed: {output}")]
    ResetFailed { output: String },

    #[error("git {operation} failed: {output}")]
    CommandFailed { operation: String, output: String },

    #[error("filesystem operation on {} failed: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git could not be started: {0}")]
    Command(#[from] CommandError),
}

// ============================================================================
// Source Sync Trait
// ============================================================================

/// Brings a working copy to the tip of its branch.
#[async_trait]
pub trait SourceSync: Send + Sync {
    /// Clone into `path` if it is absent, otherwise update it in place.
    async fn setup_repository(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        path: &Path,
    ) -> Result<(), SyncError>;

    /// Remove a working copy, repairing ownership first.
    async fn cleanup(&self, path: &Path) -> Result<(), SyncError>;

    /// Commit currently checked out in `path`.
    async fn head_commit(&self, path: &Path) -> Result<String, SyncError>;
}

// ============================================================================
// Git Implementation
// ============================================================================

/// [`SourceSync`] implemented with the `git` client.
pub struct GitSync {
    runner: Arc<dyn CommandRunner>,
    transport: Arc<dyn Transport>,
    safe_directories: Arc<SafeDirectoryRegistry>,
}

impl GitSync {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        transport: Arc<dyn Transport>,
        safe_directories: Arc<SafeDirectoryRegistry>,
    ) -> Self {
        Self {
            runner,
            transport,
            safe_directories,
        }
    }

    /// Run `git`, repairing ownership and retrying once on an ownership error.
    async fn run_git(
        &self,
        args: &[&str],
        working_dir: &Path,
        target: &Path,
    ) -> Result<CommandOutput, SyncError> {
        let command = CommandSpec::new("git")
            .args(args.iter().copied())
            .current_dir(working_dir)
            .envs(self.transport.git_environment());

        let output = self.runner.run(&command).await?;
        if output.success || !is_ownership_error(&output.output) {
            return Ok(output);
        }

        warn!(
            command = %command,
            path = %target.display(),
            "git rejected directory ownership, repairing and retrying once"
        );
        self.safe_directories
            .add_pattern(&target.to_string_lossy())
            .await;
        self.safe_directories.repair_ownership(target).await;

        Ok(self.runner.run(&command).await?)
    }

    async fn clone_repository(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        path: &Path,
    ) -> Result<(), SyncError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| SyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        self.safe_directories.ensure(parent).await;

        info!(url = %repo.git_url, path = %path.display(), "Cloning repository");
        let path_arg = path.to_string_lossy();
        let output = self
            .run_git(
                &[
                    "clone",
                    "-b",
                    branch,
                    "--depth",
                    "1",
                    "--single-branch",
                    &repo.git_url,
                    &path_arg,
                ],
                parent,
                path,
            )
            .await?;

        if !output.success {
            return Err(SyncError::CloneFailed {
                output: output.trimmed().to_string(),
            });
        }

        self.safe_directories.ensure(path).await;
        Ok(())
    }

    async fn update_repository(&self, branch: &str, path: &Path) -> Result<(), SyncError> {
        info!(path = %path.display(), branch = %branch, "Updating repository");

        let fetch = self.run_git(&["fetch", "origin", branch], path, path).await?;
        if !fetch.success {
            return Err(SyncError::FetchFailed {
                output: fetch.trimmed().to_string(),
            });
        }

        let remote_ref = format!("origin/{}", branch);
        let reset = self
            .run_git(&["reset", "--hard", &remote_ref], path, path)
            .await?;
        if !reset.success {
            return Err(SyncError::ResetFailed {
                output: reset.trimmed().to_string(),
            });
        }

        match self.run_git(&["clean", "-fd"], path, path).await {
            Ok(clean) if !clean.success => {
                warn!(path = %path.display(), output = %clean.trimmed(), "git clean failed");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "git clean failed"),
            Ok(_) => {}
        }

        Ok(())
    }
}

#[async_trait]
impl SourceSync for GitSync {
    #[instrument(skip(self, repo), fields(repository = %repo.name, branch = %branch))]
    async fn setup_repository(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        path: &Path,
    ) -> Result<(), SyncError> {
        self.safe_directories.ensure(path).await;

        if path.exists() {
            self.update_repository(branch, path).await
        } else {
            self.clone_repository(repo, branch, path).await
        }
    }

    async fn cleanup(&self, path: &Path) -> Result<(), SyncError> {
        if !path.exists() {
            debug!(path = %path.display(), "Nothing to clean up");
            return Ok(());
        }

        self.safe_directories.repair_ownership(path).await;
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|source| SyncError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        info!(path = %path.display(), "Removed working copy");
        Ok(())
    }

    async fn head_commit(&self, path: &Path) -> Result<String, SyncError> {
        let output = self.run_git(&["rev-parse", "HEAD"], path, path).await?;
        if !output.success {
            return Err(SyncError::CommandFailed {
                operation: "rev-parse".to_string(),
                output: output.trimmed().to_string(),
            });
        }
        Ok(output.trimmed().to_string())
    }
}

#[cfg(test)]
#[path = "git_tests.rs"]
mod tests;
