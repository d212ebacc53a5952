//! Deployment orchestration.
//!
//! Two locks govern a deployment:
//! - the active-job set, held only to test-and-set or clear a [`JobKey`];
//! - the build lock, held across the whole update-and-redeploy sequence so
//!   that only one sequence runs in the process at a time.
//!
//! A second request for a key that is already active fails immediately with
//! [`DeployError::AlreadyInProgress`]; nothing is queued.

use crate::{
    config::{DeployConfig, RepositoryConfig},
    docker::{ContainerDeployer, ContainerError},
    git::SyncError,
    repository::{RepositoryError, RepositoryManager},
    ssh::TransportError,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};
use tracing::{error, info, instrument, warn};

/// Interval between active-job checks while draining.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Job Key
// ============================================================================

/// Deduplication unit for concurrent deployments: `repository:branch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub repository: String,
    pub branch: String,
}

impl JobKey {
    pub fn new(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.branch)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("deployment already in progress for {key}")]
    AlreadyInProgress { key: JobKey },

    #[error("repository '{name}' not found or not enabled")]
    RepositoryNotFound { name: String },

    #[error("branch '{branch}' is not configured for repository '{repository}'")]
    BranchNotConfigured { repository: String, branch: String },

    #[error("auto-initialization failed: {0}")]
    Initialization(#[source] RepositoryError),

    #[error("repository validation failed: {key} not properly initialized")]
    NotInitialized { key: JobKey },

    #[error("repository update failed: {0}")]
    Sync(#[source] SyncError),

    #[error("docker-compose file not found after update: {compose_file}")]
    ComposeFileMissing { compose_file: String },

    #[error("docker deployment failed: {0}")]
    Container(#[source] ContainerError),

    #[error("SSH not configured")]
    TransportNotReady,

    #[error("SSH connectivity test failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("deployment timeout after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    #[error("deployment cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("shutdown timeout exceeded with {active} active jobs")]
    ShutdownTimeout { active: usize },
}

impl DeployError {
    /// Failures that may succeed if the same deployment is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInProgress { .. }
                | Self::Sync(_)
                | Self::Container(_)
                | Self::Transport { .. }
                | Self::TimedOut { .. }
        )
    }
}

// ============================================================================
// Reports and Statistics
// ============================================================================

/// Result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentReport {
    pub key: JobKey,
    pub services: Vec<String>,
    pub working_copy: PathBuf,
    pub commit: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Snapshot of orchestrator counters.
///
/// `queue_size` and `queue_capacity` are always zero: jobs are never queued.
/// `max_workers` echoes `settings.max_concurrent` and is not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStats {
    pub active_jobs: usize,
    pub active_job_details: Vec<String>,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub max_workers: usize,
}

// ============================================================================
// Active Job Tracking
// ============================================================================

#[derive(Debug, Default)]
struct ActiveJobs {
    keys: Mutex<HashSet<JobKey>>,
}

impl ActiveJobs {
    fn try_acquire(&self, key: &JobKey) -> Option<ActiveJobGuard<'_>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(ActiveJobGuard {
            jobs: self,
            key: key.clone(),
        })
    }

    fn snapshot(&self) -> Vec<JobKey> {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<JobKey> = keys.iter().cloned().collect();
        snapshot.sort();
        snapshot
    }

    fn len(&self) -> usize {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Clears the key when dropped, including during unwinding.
struct ActiveJobGuard<'a> {
    jobs: &'a ActiveJobs,
    key: JobKey,
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        self.jobs
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs deployments for configured repositories.
///
/// All state is owned by the instance, so independent orchestrators never
/// share active jobs or counters.
pub struct DeploymentOrchestrator {
    repositories: RepositoryManager,
    deployer: Arc<dyn ContainerDeployer>,
    active: ActiveJobs,
    build_lock: tokio::sync::Mutex<()>,
    total_jobs: AtomicU64,
    completed_jobs: AtomicU64,
    failed_jobs: AtomicU64,
}

impl DeploymentOrchestrator {
    pub fn new(repositories: RepositoryManager, deployer: Arc<dyn ContainerDeployer>) -> Self {
        info!("Deployment orchestrator started with auto-initialization");
        Self {
            repositories,
            deployer,
            active: ActiveJobs::default(),
            build_lock: tokio::sync::Mutex::new(()),
            total_jobs: AtomicU64::new(0),
            completed_jobs: AtomicU64::new(0),
            failed_jobs: AtomicU64::new(0),
        }
    }

    pub fn repositories(&self) -> &RepositoryManager {
        &self.repositories
    }

    /// Resolve `name` from configuration and deploy `branch`.
    pub async fn deploy(&self, name: &str, branch: &str) -> Result<DeploymentReport, DeployError> {
        let repo = self
            .repositories
            .get_repository(name)
            .ok_or_else(|| DeployError::RepositoryNotFound {
                name: name.to_string(),
            })?;
        if !repo.has_branch(branch) {
            return Err(DeployError::BranchNotConfigured {
                repository: repo.name.clone(),
                branch: branch.to_string(),
            });
        }
        self.deploy_direct(&repo, branch).await
    }

    /// Deploy `branch` of an already resolved repository.
    #[instrument(skip(self, repo), fields(repository = %repo.name, branch = %branch))]
    pub async fn deploy_direct(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
    ) -> Result<DeploymentReport, DeployError> {
        let key = JobKey::new(&repo.name, branch);
        let Some(_guard) = self.active.try_acquire(&key) else {
            warn!(job_key = %key, "Deployment already in progress");
            return Err(DeployError::AlreadyInProgress { key });
        };

        let started = Instant::now();
        info!(job_key = %key, "Starting deployment");

        if !self.repositories.is_initialized(&repo.name, branch) {
            info!(job_key = %key, "Repository not initialized, setting up automatically");
            if let Err(e) = self.repositories.initialize_repository(repo, branch).await {
                error!(job_key = %key, error = %e, "Auto-initialization failed");
                self.failed_jobs.fetch_add(1, Ordering::SeqCst);
                return Err(DeployError::Initialization(e));
            }
            info!(job_key = %key, outcome = "success", "Repository auto-initialized");
        }

        self.total_jobs.fetch_add(1, Ordering::SeqCst);

        match self.execute(repo, branch, &key).await {
            Ok((services, working_copy)) => {
                let duration = started.elapsed();
                self.completed_jobs.fetch_add(1, Ordering::SeqCst);
                info!(
                    job_key = %key,
                    duration_ms = duration.as_millis() as u64,
                    services = ?services,
                    outcome = "success",
                    "Deployment completed"
                );
                let commit = self.repositories.head_commit(repo, branch).await;
                Ok(DeploymentReport {
                    key,
                    services,
                    working_copy,
                    commit,
                    duration,
                })
            }
            Err(e) => {
                self.failed_jobs.fetch_add(1, Ordering::SeqCst);
                error!(
                    job_key = %key,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Deployment failed"
                );
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        key: &JobKey,
    ) -> Result<(Vec<String>, PathBuf), DeployError> {
        let _build = self.build_lock.lock().await;

        if !self.repositories.is_initialized(&repo.name, branch) {
            return Err(DeployError::NotInitialized { key: key.clone() });
        }

        info!(job_key = %key, "Updating repository to latest changes");
        let working_copy = self
            .repositories
            .sync_working_copy(repo, branch)
            .await
            .map_err(DeployError::Sync)?;

        if !working_copy.join(&repo.compose_file).is_file() {
            return Err(DeployError::ComposeFileMissing {
                compose_file: repo.compose_file.clone(),
            });
        }

        info!(job_key = %key, compose_file = %repo.compose_file, "Starting container deployment");
        let services = self
            .deployer
            .deploy(repo, branch, &working_copy)
            .await
            .map_err(DeployError::Container)?;
        info!(job_key = %key, count = services.len(), "Deployed services");

        if self.repositories.config().settings.cleanup_enabled {
            info!(job_key = %key, "Running cleanup");
            self.deployer.cleanup().await;
        }

        Ok((services, working_copy))
    }

    pub fn is_active(&self, key: &JobKey) -> bool {
        self.active.snapshot().contains(key)
    }

    pub fn get_active_jobs(&self) -> Vec<JobKey> {
        self.active.snapshot()
    }

    pub fn stats(&self) -> DeploymentStats {
        let active = self.active.snapshot();
        DeploymentStats {
            active_jobs: active.len(),
            active_job_details: active.iter().map(JobKey::to_string).collect(),
            total_jobs: self.total_jobs.load(Ordering::SeqCst),
            completed_jobs: self.completed_jobs.load(Ordering::SeqCst),
            failed_jobs: self.failed_jobs.load(Ordering::SeqCst),
            queue_size: 0,
            queue_capacity: 0,
            max_workers: self.repositories.config().settings.max_concurrent,
        }
    }

    /// Swap in a new configuration snapshot for subsequent deployments.
    pub fn update_config(&self, config: DeployConfig) {
        let repositories = config.repositories.len();
        self.repositories.shared_config().replace(config);
        info!(repositories, "Configuration updated");
    }

    /// Wait for active jobs to drain. In-flight jobs are never cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DeployError> {
        info!("Shutting down deployment orchestrator");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.active.len();
            if active == 0 {
                info!(outcome = "success", "Deployment orchestrator shut down gracefully");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "Deployment orchestrator shutdown timeout reached");
                return Err(DeployError::ShutdownTimeout { active });
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
#[path = "deployment_tests.rs"]
mod tests;
