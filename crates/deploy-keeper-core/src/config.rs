//! Configuration model for repositories, deployment settings and the webhook listener.
//!
//! The core only ever reads configuration. Replacement at runtime happens through
//! [`SharedConfig::replace`], which swaps the whole snapshot atomically.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

/// Compose file name used when a repository does not name one.
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid repository '{repository}': {field} {message}")]
    InvalidRepository {
        repository: String,
        field: &'static str,
        message: String,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {message}")]
    Load { message: String },
}

// ============================================================================
// Repository Configuration
// ============================================================================

/// Per-branch overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSettings {
    /// Compose project name used instead of `<repo>-<branch>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

/// A repository that may be deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Unique repository name, matched against the webhook payload
    pub name: String,

    /// Clone URL (`https://...` or `git@host:owner/repo.git`)
    pub git_url: String,

    /// Branches that are allowed to deploy
    #[serde(default)]
    pub branches: Vec<String>,

    /// Compose file path relative to the working copy root
    #[serde(default = "default_compose_file")]
    pub compose_file: String,

    /// Branch specific settings keyed by branch name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branch_config: BTreeMap<String, BranchSettings>,

    /// Deploy automatically when a push webhook arrives
    #[serde(default = "default_true")]
    pub auto_deploy: bool,

    /// Disabled repositories are invisible to lookups
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RepositoryConfig {
    pub fn new<I, S>(name: impl Into<String>, git_url: impl Into<String>, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            git_url: git_url.into(),
            branches: branches.into_iter().map(Into::into).collect(),
            compose_file: default_compose_file(),
            branch_config: BTreeMap::new(),
            auto_deploy: true,
            enabled: true,
        }
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b == branch)
    }

    /// Compose project name for a branch.
    ///
    /// A non-empty `branch_config[branch].project_name` wins, otherwise the
    /// name is `<repo>-<branch>`.
    pub fn project_name(&self, branch: &str) -> String {
        self.branch_config
            .get(branch)
            .and_then(|settings| settings.project_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", self.name, branch))
    }

    /// Working copy location: `<work_dir>/<repo>/<branch>`.
    pub fn working_copy_path(&self, work_dir: &Path, branch: &str) -> PathBuf {
        work_dir.join(&self.name).join(branch)
    }

    pub fn compose_file_path(&self, work_dir: &Path, branch: &str) -> PathBuf {
        self.working_copy_path(work_dir, branch)
            .join(&self.compose_file)
    }

    /// Check the repository definition is complete enough to clone and deploy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, message: &str| ConfigError::InvalidRepository {
            repository: self.name.clone(),
            field,
            message: message.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.name.contains('/') || self.name.contains("..") {
            return Err(invalid("name", "must not contain path separators"));
        }
        if self.git_url.trim().is_empty() {
            return Err(invalid("git_url", "must not be empty"));
        }
        if !(self.git_url.starts_with("http") || self.git_url.starts_with("git@")) {
            return Err(invalid("git_url", "must use an http(s) or git@ transport"));
        }
        if self.branches.iter().all(|b| b.trim().is_empty()) {
            return Err(invalid("branches", "must list at least one branch"));
        }
        if self.branches.iter().any(|b| b.contains("..")) {
            return Err(invalid("branches", "must not contain '..'"));
        }
        if self.compose_file.trim().is_empty() {
            return Err(invalid("compose_file", "must not be empty"));
        }

        Ok(())
    }
}

fn default_compose_file() -> String {
    DEFAULT_COMPOSE_FILE.to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Settings
// ============================================================================

/// Deployment engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory holding all working copies
    pub work_dir: PathBuf,

    /// Reported worker ceiling; not used as an admission gate
    pub max_concurrent: usize,

    /// Prune stopped containers, dangling images and unused volumes after each deployment
    pub cleanup_enabled: bool,

    /// Clone every enabled repository when the server starts
    pub auto_clone: bool,

    /// Endpoint that receives deployment status notifications
    pub notification_url: Option<String>,

    /// Attempts for `compose up` before giving up
    pub container_start_attempts: u32,

    /// Flat delay between `compose up` attempts
    pub container_retry_backoff_seconds: u64,

    /// Attempts for the SSH connectivity check
    pub ssh_test_attempts: u32,

    /// Linear backoff unit for the SSH connectivity check
    pub ssh_retry_base_seconds: u64,

    /// Interval at which the configuration file is checked for changes
    pub config_poll_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./repository"),
            max_concurrent: 3,
            cleanup_enabled: false,
            auto_clone: false,
            notification_url: None,
            container_start_attempts: 3,
            container_retry_backoff_seconds: 3,
            ssh_test_attempts: 3,
            ssh_retry_base_seconds: 1,
            config_poll_seconds: 5,
        }
    }
}

/// Webhook listener configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Path receiving push events
    pub path: String,

    /// Shared secret; when absent signatures are not checked
    pub secret: Option<String>,

    /// Maximum request size in bytes
    pub max_body_size: usize,

    /// Overall deadline for a webhook-driven deployment
    pub deploy_timeout_seconds: u64,

    /// Interval between "still deploying" log lines
    pub heartbeat_seconds: u64,

    /// Graceful HTTP shutdown timeout
    pub shutdown_timeout_seconds: u64,

    /// Time allowed for active deployments to finish on shutdown
    pub drain_timeout_seconds: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/webhook".to_string(),
            secret: None,
            max_body_size: 10 * 1024 * 1024, // 10MB
            deploy_timeout_seconds: 15 * 60,
            heartbeat_seconds: 30,
            shutdown_timeout_seconds: 30,
            drain_timeout_seconds: 25,
        }
    }
}

impl fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .field("max_body_size", &self.max_body_size)
            .field("deploy_timeout_seconds", &self.deploy_timeout_seconds)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .field("shutdown_timeout_seconds", &self.shutdown_timeout_seconds)
            .field("drain_timeout_seconds", &self.drain_timeout_seconds)
            .finish()
    }
}

/// SSH transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Use SSH for git operations; disable for https-only setups
    pub enabled: bool,

    /// Private key; discovered under the home directory when absent
    pub key_path: Option<PathBuf>,

    /// Target of the connectivity test
    pub test_host: String,

    /// Per-attempt connection timeout
    pub connect_timeout_seconds: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            key_path: None,
            test_host: "git@github.com".to_string(),
            connect_timeout_seconds: 15,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub repositories: Vec<RepositoryConfig>,
    pub settings: Settings,
    pub webhook: WebhookSettings,
    pub ssh: SshSettings,
    pub logging: LoggingConfig,
}

impl DeployConfig {
    /// Any repository with the given name, enabled or not.
    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Only returns the repository if it is enabled.
    pub fn enabled_repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repository(name).filter(|r| r.enabled)
    }

    pub fn enabled_repositories(&self) -> impl Iterator<Item = &RepositoryConfig> {
        self.repositories.iter().filter(|r| r.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for repository in &self.repositories {
            repository.validate()?;
            if !seen.insert(repository.name.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate repository name '{}'", repository.name),
                });
            }
        }

        if !self.webhook.path.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: format!("webhook path '{}' must start with '/'", self.webhook.path),
            });
        }
        if self.webhook.port == 0 {
            return Err(ConfigError::Invalid {
                message: "webhook port must not be 0".to_string(),
            });
        }
        if self.webhook.max_body_size == 0 {
            return Err(ConfigError::Invalid {
                message: "webhook max_body_size must be positive".to_string(),
            });
        }
        if self.settings.container_start_attempts == 0 || self.settings.ssh_test_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "retry attempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Shared Snapshot
// ============================================================================

/// Atomically swappable configuration snapshot.
///
/// Readers take an `Arc` to the current snapshot and keep using it for the
/// remainder of their operation even if a replacement is installed meanwhile.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<DeployConfig>>>,
}

impl SharedConfig {
    pub fn new(config: DeployConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<DeployConfig> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install a new snapshot, returning the previous one.
    pub fn replace(&self, config: DeployConfig) -> Arc<DeployConfig> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(DeployConfig::default())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
