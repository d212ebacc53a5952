//! Construction of the deployment engine from configuration.

use deploy_keeper_core::{
    docker::StartRetryPolicy, CommandRunner, ComposeRuntime, DeployConfig, DeploymentOrchestrator, GitSync,
    OwnershipPolicy, RepositoryManager, SafeDirectoryRegistry, SharedConfig, SshTransport,
    Transport,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Every long-lived component, wired to one [`CommandRunner`].
#[derive(Clone)]
pub struct Services {
    pub config: SharedConfig,
    pub transport: Arc<SshTransport>,
    pub safe_directories: Arc<SafeDirectoryRegistry>,
    pub runtime: Arc<ComposeRuntime>,
    pub repositories: RepositoryManager,
    pub orchestrator: Arc<DeploymentOrchestrator>,
}

impl Services {
    /// Wire the engine.
    ///
    /// Seeds the safe-directory list for the work directory and detects the
    /// installed compose client.
    pub async fn build(config: SharedConfig, runner: Arc<dyn CommandRunner>, ownership: OwnershipPolicy) -> Self {
        let snapshot = config.snapshot();

        let safe_directories = Arc::new(SafeDirectoryRegistry::new(Arc::clone(&runner), ownership));
        safe_directories.seed(&snapshot.settings.work_dir).await;

        let transport = Arc::new(SshTransport::new(Arc::clone(&runner), snapshot.ssh.clone()));
        if transport.is_ready() {
            info!(outcome = "success", "SSH authentication is configured and ready");
        } else {
            warn!("SSH authentication not configured, deployments will be refused");
        }

        let sync = Arc::new(GitSync::new(
            Arc::clone(&runner),
            transport.clone(),
            Arc::clone(&safe_directories),
        ));
        let runtime = Arc::new(
            ComposeRuntime::detect(Arc::clone(&runner), StartRetryPolicy::from_settings(&snapshot.settings)).await,
        );

        let repositories = RepositoryManager::new(config.clone(), sync);
        let orchestrator = Arc::new(DeploymentOrchestrator::new(repositories.clone(), runtime.clone()));

        Self {
            config,
            transport,
            safe_directories,
            runtime,
            repositories,
            orchestrator,
        }
    }

    /// Push a reloaded configuration into every component that caches part of it.
    ///
    /// Deployments already running keep the settings they started with.
    pub fn apply_config(&self, config: DeployConfig) {
        self.runtime
            .set_retry_policy(StartRetryPolicy::from_settings(&config.settings));
        self.transport.reconfigure(config.ssh.clone());
        self.orchestrator.update_config(config);
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}
