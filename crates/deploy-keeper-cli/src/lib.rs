//! # Deploy-Keeper CLI
//!
//! Command-line interface for the Deploy-Keeper deployment agent.
//!
//! This module provides CLI commands for:
//! - Running the webhook service
//! - Manual deployments
//! - Repository management
//! - Configuration inspection and validation
//! - Status and SSH diagnostics

pub mod output;
pub mod wiring;

use clap::{Parser, Subcommand};
use deploy_keeper_api::{start_server, AppState, ServiceError, ServiceMetrics};
use deploy_keeper_core::{
    loader::{load_config, resolve_config_path, ConfigWatcher},
    CommandRunner, ConfigError, DeployConfig, DeployError, NotificationDispatcher, OwnershipPolicy,
    ProcessCommandRunner, RepositoryError, SharedConfig, Transport, TransportError, WebhookPipeline,
};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wiring::Services;

// ============================================================================
// CLI Structure
// ============================================================================

/// Deploy-Keeper - push-to-deploy for docker-compose stacks
#[derive(Parser, Debug)]
#[command(name = "deploy-keeper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Redeploys docker-compose stacks when a git branch is pushed")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DEPLOY_KEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (overrides the configured level)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the webhook service
    Serve {
        /// Port to bind HTTP server
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind HTTP server
        #[arg(long)]
        host: Option<String>,
    },

    /// Deploy a branch now
    Deploy {
        repository: String,
        branch: String,
    },

    /// Repository management commands
    Repo {
        #[command(subcommand)]
        action: RepoCommands,
    },

    /// Show repository readiness, SSH state and running containers
    Status,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// SSH diagnostics
    Ssh {
        #[command(subcommand)]
        action: SshCommands,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum RepoCommands {
    /// List enabled repositories
    List,

    /// Show one repository and the state of its working copies
    Info { name: String },

    /// Update every branch of a repository
    Update { name: String },

    /// Clone every configured branch that is not yet present
    Init,

    /// Delete and re-clone one branch
    Reinit { name: String, branch: String },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Load and validate the configuration
    Validate,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum SshCommands {
    /// Test connectivity to the configured git host
    Test,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Deployment error: {0}")]
    Deployment(#[from] DeployError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Deployment(_) => 2,
            Self::Repository(_) | Self::Service(_) | Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

impl From<TransportError> for CliError {
    fn from(e: TransportError) -> Self {
        Self::CommandFailed { message: e.to_string() }
    }
}

// ============================================================================
// Command Execution
// ============================================================================

/// Load configuration, initialize logging and run the selected command.
pub async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = load_config(config_path.as_deref())?;

    if let Commands::Serve { port, host } = &cli.command {
        apply_listen_overrides(&mut config, *port, host.as_deref())?;
    }

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    initialize_logging(&level, cli.json_logs || config.logging.json_format)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "Configuration loaded");
    }

    let config = SharedConfig::new(config);
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner::new());

    match cli.command {
        Commands::Config { action } => execute_config_command(action, &config),
        Commands::Serve { .. } => {
            let services = Services::build(config, runner, OwnershipPolicy::detect()).await;
            execute_serve_command(services, config_path).await
        }
        Commands::Deploy { repository, branch } => {
            let services = Services::build(config, runner, OwnershipPolicy::detect()).await;
            execute_deploy_command(&services, &repository, &branch).await
        }
        Commands::Repo { action } => {
            let services = Services::build(config, runner, OwnershipPolicy::detect()).await;
            execute_repo_command(&services, action).await
        }
        Commands::Status => {
            let services = Services::build(config, runner, OwnershipPolicy::detect()).await;
            execute_status_command(&services).await
        }
        Commands::Ssh { action: SshCommands::Test } => {
            let services = Services::build(config, runner, OwnershipPolicy::detect()).await;
            execute_ssh_test_command(&services).await
        }
    }
}

/// Apply `serve --host/--port` on top of the loaded configuration.
pub fn apply_listen_overrides(
    config: &mut DeployConfig,
    port: Option<u16>,
    host: Option<&str>,
) -> Result<(), CliError> {
    if let Some(port) = port {
        if port == 0 {
            return Err(CliError::InvalidArgument {
                arg: "--port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }
        config.webhook.port = port;
    }
    if let Some(host) = host {
        if host.trim().is_empty() {
            return Err(CliError::InvalidArgument {
                arg: "--host".to_string(),
                message: "host must not be empty".to_string(),
            });
        }
        config.webhook.host = host.to_string();
    }
    Ok(())
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("failed to initialize logging: {}", e),
    })
}

async fn execute_serve_command(services: Services, config_path: Option<PathBuf>) -> Result<(), CliError> {
    let snapshot = services.config.snapshot();

    if snapshot.settings.auto_clone {
        info!("Initializing repositories");
        let failures = services.repositories.initialize_all().await;
        if failures > 0 {
            warn!(failures, "Some repositories failed to initialize, continuing");
        }
    }

    let watcher = config_path.filter(|p| p.is_file()).map(|path| {
        let services = services.clone();
        let listen = (snapshot.webhook.host.clone(), snapshot.webhook.port);
        ConfigWatcher::new(path, Duration::from_secs(snapshot.settings.config_poll_seconds.max(1))).spawn(
            move |mut config| {
                // The listener is already bound.
                config.webhook.host = listen.0.clone();
                config.webhook.port = listen.1;
                services.apply_config(config);
                info!(outcome = "success", "Configuration reloaded");
            },
        )
    });

    let transport = services.transport();
    let pipeline = Arc::new(WebhookPipeline::new(
        services.config.clone(),
        Arc::clone(&services.orchestrator),
        Arc::clone(&transport),
        Arc::clone(&services.safe_directories),
        NotificationDispatcher::new(snapshot.settings.notification_url.clone()),
    ));
    let metrics = ServiceMetrics::new().map_err(ServiceError::from)?;
    let state = AppState::new(services.config.clone(), pipeline, transport, metrics);

    info!(
        endpoint = %format!("http://{}:{}{}", snapshot.webhook.host, snapshot.webhook.port, snapshot.webhook.path),
        repositories = snapshot.enabled_repositories().count(),
        "Server is ready to receive webhooks"
    );

    let result = start_server(state).await;
    if let Some(handle) = watcher {
        handle.abort();
    }
    result.map_err(CliError::from)
}

async fn execute_deploy_command(services: &Services, repository: &str, branch: &str) -> Result<(), CliError> {
    let Some(repo) = services.repositories.get_repository(repository) else {
        let available = output::render_repository_list(&services.repositories.list_repositories());
        println!("Repository '{}' not found or disabled\n\n{}", repository, available);
        return Err(DeployError::RepositoryNotFound {
            name: repository.to_string(),
        }
        .into());
    };
    if !repo.has_branch(branch) {
        println!(
            "Branch '{}' not configured for repository '{}' (available: {})",
            branch,
            repository,
            repo.branches.join(", ")
        );
        return Err(DeployError::BranchNotConfigured {
            repository: repository.to_string(),
            branch: branch.to_string(),
        }
        .into());
    }
    if !services.transport.is_ready() {
        return Err(DeployError::TransportNotReady.into());
    }

    println!("Starting manual deployment: {}:{}", repository, branch);
    info!(repository, branch, "Manual deployment requested");

    let path = services.repositories.working_copy_path(&repo, branch);
    services.safe_directories.ensure(&path).await;

    let started = Instant::now();
    let result = services.orchestrator.deploy(repository, branch).await;
    print!("{}", output::render_deploy_result(repository, branch, &result, started.elapsed()));

    match result {
        Ok(_) => {
            match services.runtime.status_output().await {
                Ok(table) => println!("\nContainers:\n{}", table.trim_end()),
                Err(e) => warn!(error = %e, "Could not get container status"),
            }
            Ok(())
        }
        Err(e) => {
            error!(repository, branch, error = %e, "Manual deployment failed");
            Err(e.into())
        }
    }
}

async fn execute_repo_command(services: &Services, action: RepoCommands) -> Result<(), CliError> {
    let repositories = &services.repositories;
    match action {
        RepoCommands::List => {
            print!("{}", output::render_repository_list(&repositories.list_repositories()));
            Ok(())
        }
        RepoCommands::Info { name } => {
            let repo = repositories
                .get_repository(&name)
                .ok_or_else(|| RepositoryError::NotFound { name: name.clone() })?;
            let statuses = repositories.repository_status(&name)?;
            let mut commits = BTreeMap::new();
            for branch in &repo.branches {
                if let Some(commit) = repositories.head_commit(&repo, branch).await {
                    commits.insert(branch.clone(), commit);
                }
            }
            print!(
                "{}",
                output::render_repository_info(&repo, &repositories.work_dir(), &statuses, &commits)
            );
            Ok(())
        }
        RepoCommands::Update { name } => {
            repositories.update_repository(&name).await?;
            println!("Repository '{}' updated", name);
            Ok(())
        }
        RepoCommands::Init => {
            let failures = repositories.initialize_all().await;
            if failures > 0 {
                return Err(CliError::CommandFailed {
                    message: format!("{} working copies failed to initialize", failures),
                });
            }
            println!("All repositories initialized");
            Ok(())
        }
        RepoCommands::Reinit { name, branch } => {
            repositories.force_reinitialize(&name, &branch).await?;
            println!("Repository '{}:{}' re-initialized", name, branch);
            Ok(())
        }
    }
}

async fn execute_status_command(services: &Services) -> Result<(), CliError> {
    let stats = services.orchestrator.stats();
    println!("Max workers: {}", stats.max_workers);
    println!(
        "SSH:         {}",
        if services.transport.is_ready() { "ready" } else { "not configured" }
    );

    for repo in services.repositories.list_repositories() {
        let statuses = services.repositories.repository_status(&repo.name)?;
        print!(
            "\n{}",
            output::render_repository_info(&repo, &services.repositories.work_dir(), &statuses, &BTreeMap::new())
        );
    }

    match services.runtime.status_output().await {
        Ok(table) if table.trim().is_empty() => println!("\nNo containers running"),
        Ok(table) => println!("\nContainers:\n{}", table.trim_end()),
        Err(e) => println!("\nCould not get container status: {}", e),
    }
    Ok(())
}

fn execute_config_command(action: ConfigCommands, config: &SharedConfig) -> Result<(), CliError> {
    let snapshot = config.snapshot();
    match action {
        ConfigCommands::Show { format } => {
            print!("{}", output::render_config(&snapshot, format)?);
            Ok(())
        }
        ConfigCommands::Validate => {
            println!(
                "Configuration is valid ({} repositories, {} enabled)",
                snapshot.repositories.len(),
                snapshot.enabled_repositories().count()
            );
            Ok(())
        }
    }
}

async fn execute_ssh_test_command(services: &Services) -> Result<(), CliError> {
    if !services.transport.is_ready() {
        return Err(TransportError::NotReady.into());
    }
    if let Some(key) = services.transport.key_path() {
        println!("Using SSH key {}", key.display());
    }
    services.transport.test_connection().await?;
    println!("SSH connection test succeeded");
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
