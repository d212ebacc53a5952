//! Container-compose redeployment with conflict recovery.
//!
//! The runtime treats container names as host-wide unique, independent of the
//! compose project. Redeploying therefore needs a layered recovery strategy:
//! remove the specific conflicting container, then sweep by project name, then
//! sweep by similar names. Each layer is only used when the previous one found
//! nothing to remove.

use crate::{
    command::{CommandError, CommandOutput, CommandRunner, CommandSpec},
    config::{RepositoryConfig, Settings},
    conflict::{self, ConflictTarget},
};
use async_trait::async_trait;
use std::{
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Service list reported when the project cannot be enumerated after a deployment.
pub const UNKNOWN_SERVICE: &str = "unknown";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("docker compose up failed: {output}")]
    ComposeUpFailed { output: String },

    #[error("failed to start services after {attempts} attempts: {last_output}")]
    StartExhausted { attempts: u32, last_output: String },

    #[error("docker {operation} failed: {output}")]
    CommandFailed { operation: String, output: String },

    #[error("container runtime could not be started: {0}")]
    Command(#[from] CommandError),
}

// ============================================================================
// Deployer Trait
// ============================================================================

/// Brings a compose project to the state described by a working copy.
#[async_trait]
pub trait ContainerDeployer: Send + Sync {
    /// Stop, clean and restart the project for `branch`, returning its services.
    async fn deploy(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        working_copy: &Path,
    ) -> Result<Vec<String>, ContainerError>;

    /// Best-effort host-wide prune. Failures are logged, never returned.
    async fn cleanup(&self);
}

// ============================================================================
// Compose Runtime
// ============================================================================

/// Flavour of the compose client installed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeCommand {
    /// `docker compose` (CLI plugin)
    Plugin,
    /// `docker-compose` (standalone binary)
    Standalone,
}

impl ComposeCommand {
    /// Prefer the plugin, fall back to the standalone binary.
    pub async fn detect(runner: &dyn CommandRunner) -> Self {
        let plugin = CommandSpec::new("docker").args(["compose", "version"]);
        if matches!(runner.run(&plugin).await, Ok(output) if output.success) {
            return Self::Plugin;
        }

        let standalone = CommandSpec::new("docker-compose").arg("version");
        if matches!(runner.run(&standalone).await, Ok(output) if output.success) {
            return Self::Standalone;
        }

        warn!("No compose client detected, assuming 'docker compose'");
        Self::Plugin
    }

    fn base(self) -> CommandSpec {
        match self {
            Self::Plugin => CommandSpec::new("docker").arg("compose"),
            Self::Standalone => CommandSpec::new("docker-compose"),
        }
    }
}

/// Retry policy for `compose up`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRetryPolicy {
    pub max_attempts: u32,
    /// Flat delay between attempts
    pub backoff: Duration,
}

impl Default for StartRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(3),
        }
    }
}

impl StartRetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.container_start_attempts.max(1),
            backoff: Duration::from_secs(settings.container_retry_backoff_seconds),
        }
    }
}

/// [`ContainerDeployer`] driving the compose client through a [`CommandRunner`].
pub struct ComposeRuntime {
    runner: Arc<dyn CommandRunner>,
    compose: ComposeCommand,
    retry: RwLock<StartRetryPolicy>,
}

impl ComposeRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>, compose: ComposeCommand, retry: StartRetryPolicy) -> Self {
        Self {
            runner,
            compose,
            retry: RwLock::new(retry),
        }
    }

    /// Construct with the compose client found on the host.
    pub async fn detect(runner: Arc<dyn CommandRunner>, retry: StartRetryPolicy) -> Self {
        let compose = ComposeCommand::detect(runner.as_ref()).await;
        info!(compose = ?compose, "Using compose client");
        Self::new(runner, compose, retry)
    }

    /// Replace the retry policy used by subsequent starts.
    pub fn set_retry_policy(&self, policy: StartRetryPolicy) {
        *self.retry.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn retry_policy(&self) -> StartRetryPolicy {
        self.retry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `docker ps` table for operator status output.
    pub async fn status_output(&self) -> Result<String, ContainerError> {
        let command = CommandSpec::new("docker").args([
            "ps",
            "--format",
            "table {{.Names}}\t{{.Status}}\t{{.Ports}}",
        ]);
        let output = self.runner.run(&command).await?;
        if !output.success {
            return Err(ContainerError::CommandFailed {
                operation: "ps".to_string(),
                output: output.trimmed().to_string(),
            });
        }
        Ok(output.output)
    }

    fn compose_command(
        &self,
        repo: &RepositoryConfig,
        project: &str,
        working_copy: &Path,
        subcommand: &[&str],
    ) -> CommandSpec {
        let compose_file = working_copy.join(&repo.compose_file);
        self.compose
            .base()
            .arg("-f")
            .arg(compose_file.to_string_lossy())
            .args(["-p", project])
            .args(subcommand.iter().copied())
            .current_dir(working_copy)
            .env("COMPOSE_PROJECT_NAME", project)
    }

    // ------------------------------------------------------------------------
    // Stop phase
    // ------------------------------------------------------------------------

    async fn stop(&self, repo: &RepositoryConfig, project: &str, working_copy: &Path) {
        let down = self.compose_command(repo, project, working_copy, &["down", "--remove-orphans"]);
        match self.runner.run(&down).await {
            Ok(output) if output.success => {
                debug!(project = %project, "Project stopped");
                return;
            }
            Ok(output) => {
                warn!(project = %project, output = %output.trimmed(), "compose down failed, forcing cleanup");
            }
            Err(e) => {
                warn!(project = %project, error = %e, "compose down failed, forcing cleanup");
            }
        }

        self.remove_project_containers(repo, project, working_copy).await;
        self.remove_by_pattern(project).await;
    }

    async fn remove_project_containers(&self, repo: &RepositoryConfig, project: &str, working_copy: &Path) {
        let ps = self.compose_command(repo, project, working_copy, &["ps", "-q"]);
        let ids: Vec<String> = match self.runner.run(&ps).await {
            Ok(output) if output.success => output.lines().map(str::to_string).collect(),
            Ok(output) => {
                warn!(project = %project, output = %output.trimmed(), "Unable to list project containers");
                return;
            }
            Err(e) => {
                warn!(project = %project, error = %e, "Unable to list project containers");
                return;
            }
        };

        for id in ids {
            self.remove_container(&id).await;
        }
    }

    // ------------------------------------------------------------------------
    // Start phase
    // ------------------------------------------------------------------------

    async fn start(
        &self,
        repo: &RepositoryConfig,
        project: &str,
        working_copy: &Path,
    ) -> Result<(), ContainerError> {
        let up = self.compose_command(
            repo,
            project,
            working_copy,
            &["up", "-d", "--build", "--force-recreate", "--remove-orphans"],
        );

        let retry = self.retry_policy();
        let mut last_output = String::new();
        for attempt in 1..=retry.max_attempts {
            let output = self.runner.run(&up).await?;
            if output.success {
                info!(project = %project, attempt, "Services started");
                return Ok(());
            }

            if !conflict::is_conflict(&output.output) {
                return Err(ContainerError::ComposeUpFailed {
                    output: output.trimmed().to_string(),
                });
            }

            warn!(
                project = %project,
                attempt,
                max_attempts = retry.max_attempts,
                "Container conflict detected, cleaning up before retrying"
            );
            self.resolve_conflict(&output.output, project).await;
            last_output = output.trimmed().to_string();

            if attempt < retry.max_attempts {
                tokio::time::sleep(retry.backoff).await;
            }
        }

        Err(ContainerError::StartExhausted {
            attempts: retry.max_attempts,
            last_output,
        })
    }

    /// Specific removal, then project sweep, then similarity sweep.
    async fn resolve_conflict(&self, output: &str, project: &str) {
        let name = match conflict::extract_conflicting_container(output) {
            ConflictTarget::Name(name) => Some(name),
            ConflictTarget::Id(id) => self.resolve_container_name(&id).await,
            ConflictTarget::Unknown => None,
        };

        if let Some(name) = name {
            if self.remove_container(&name).await {
                info!(container = %name, "Removed conflicting container");
                return;
            }
        }

        if self.remove_by_pattern(project).await == 0 {
            self.remove_similar(project).await;
        }
    }

    async fn resolve_container_name(&self, id: &str) -> Option<String> {
        let inspect = CommandSpec::new("docker").args(["inspect", "--format", "{{.Name}}", id]);
        match self.runner.run(&inspect).await {
            Ok(output) if output.success => {
                let name = output.trimmed().trim_start_matches('/');
                (!name.is_empty()).then(|| name.to_string())
            }
            _ => {
                debug!(id = %id, "Could not resolve container id");
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Removal helpers
    // ------------------------------------------------------------------------

    async fn remove_container(&self, name_or_id: &str) -> bool {
        let rm = CommandSpec::new("docker").args(["rm", "-f", name_or_id]);
        match self.runner.run(&rm).await {
            Ok(output) if output.success => true,
            Ok(output) => {
                debug!(container = %name_or_id, output = %output.trimmed(), "Container removal failed");
                false
            }
            Err(e) => {
                debug!(container = %name_or_id, error = %e, "Container removal failed");
                false
            }
        }
    }

    async fn container_names(&self) -> Vec<String> {
        let ps = CommandSpec::new("docker").args(["ps", "-a", "--format", "{{.Names}}"]);
        match self.runner.run(&ps).await {
            Ok(output) if output.success => output.lines().map(str::to_string).collect(),
            Ok(output) => {
                warn!(output = %output.trimmed(), "Unable to list containers");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Unable to list containers");
                Vec::new()
            }
        }
    }

    /// Remove every container whose name contains the project name.
    async fn remove_by_pattern(&self, project: &str) -> usize {
        self.remove_matching(project, |name| conflict::matches_project(name, project))
            .await
    }

    /// Remove every container sharing a hyphen-delimited token with the project.
    async fn remove_similar(&self, project: &str) -> usize {
        self.remove_matching(project, |name| conflict::is_similar(name, project))
            .await
    }

    async fn remove_matching<F>(&self, project: &str, matches: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        for name in self.container_names().await {
            if matches(&name) && self.remove_container(&name).await {
                debug!(container = %name, project = %project, "Removed leftover container");
                removed += 1;
            }
        }
        removed
    }

    async fn list_services(&self, repo: &RepositoryConfig, project: &str, working_copy: &Path) -> Vec<String> {
        let ps = self.compose_command(repo, project, working_copy, &["ps", "--services"]);
        match self.runner.run(&ps).await {
            Ok(output) if output.success => output.lines().map(str::to_string).collect(),
            Ok(CommandOutput { output, .. }) => {
                warn!(project = %project, output = %output.trim(), "Unable to list services");
                vec![UNKNOWN_SERVICE.to_string()]
            }
            Err(e) => {
                warn!(project = %project, error = %e, "Unable to list services");
                vec![UNKNOWN_SERVICE.to_string()]
            }
        }
    }

    async fn prune(&self, target: &str) {
        let prune = CommandSpec::new("docker").args([target, "prune", "-f"]);
        match self.runner.run(&prune).await {
            Ok(output) if output.success => debug!(target = %target, "Pruned"),
            Ok(output) => warn!(target = %target, output = %output.trimmed(), "Prune failed"),
            Err(e) => warn!(target = %target, error = %e, "Prune failed"),
        }
    }
}

#[async_trait]
impl ContainerDeployer for ComposeRuntime {
    #[instrument(skip(self, repo, working_copy), fields(repository = %repo.name, branch = %branch, project))]
    async fn deploy(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        working_copy: &Path,
    ) -> Result<Vec<String>, ContainerError> {
        let project = repo.project_name(branch);
        tracing::Span::current().record("project", project.as_str());

        info!(project = %project, "Stopping existing services");
        self.stop(repo, &project, working_copy).await;

        let swept = self.remove_by_pattern(&project).await;
        if swept > 0 {
            info!(project = %project, removed = swept, "Removed leftover containers before start");
        }

        info!(project = %project, "Starting services");
        self.start(repo, &project, working_copy).await?;

        let services = self.list_services(repo, &project, working_copy).await;
        info!(project = %project, services = ?services, outcome = "success", "Deployment of containers complete");
        Ok(services)
    }

    async fn cleanup(&self) {
        info!("Pruning unused containers, images and volumes");
        for target in ["container", "image", "volume"] {
            self.prune(target).await;
        }
    }
}

#[cfg(test)]
#[path = "docker_tests.rs"]
mod tests;
