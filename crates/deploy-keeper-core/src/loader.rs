//! Loading configuration from disk and the environment, and watching it for changes.

use crate::config::{ConfigError, DeployConfig};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Directory searched for `config.{json,yaml,yml,toml}` when no file is given.
pub const CONFIG_DIR_ENV: &str = "DEPLOY_KEEPER_CONFIG_DIR";

/// Prefix for environment overrides, e.g. `DEPLOY_KEEPER__WEBHOOK__SECRET`.
pub const ENV_PREFIX: &str = "DEPLOY_KEEPER";

const CONFIG_FILE_CANDIDATES: [&str; 4] = ["config.json", "config.yaml", "config.yml", "config.toml"];

/// Resolve the configuration file to load.
///
/// An explicit path is returned as-is. Otherwise the configuration directory
/// (`$DEPLOY_KEEPER_CONFIG_DIR`, falling back to `./config`) is searched for the
/// first existing candidate file.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let dir = std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config"));

    CONFIG_FILE_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Load and validate configuration.
///
/// Sources are layered: serde defaults, then the file (if any), then
/// `DEPLOY_KEEPER__*` environment variables.
pub fn load_config(path: Option<&Path>) -> Result<DeployConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        debug!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let config: DeployConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })?;

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Hot Reload
// ============================================================================

/// Polls a configuration file's modification time and reloads it on change.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            interval,
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload if the file changed since the last check.
    ///
    /// Returns `Ok(None)` when nothing changed. A failed reload still records the
    /// new modification time so a broken file is reported once, not every poll.
    pub fn check(&mut self) -> Result<Option<DeployConfig>, ConfigError> {
        let current = modified_time(&self.path);
        if current.is_none() || current == self.last_modified {
            return Ok(None);
        }

        self.last_modified = current;
        load_config(Some(&self.path)).map(Some)
    }

    /// Spawn the polling loop; `on_change` receives every valid reload.
    pub fn spawn<F>(mut self, on_change: F) -> JoinHandle<()>
    where
        F: Fn(DeployConfig) + Send + 'static,
    {
        info!(
            path = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "Watching configuration file for changes"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.check() {
                    Ok(Some(config)) => {
                        info!(path = %self.path.display(), "Configuration file changed, reloading");
                        on_change(config);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            path = %self.path.display(),
                            error = %e,
                            "Configuration reload failed, keeping previous configuration"
                        );
                    }
                }
            }
        })
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(time) => Some(time),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read configuration file metadata");
            None
        }
    }
}

#[cfg(test)]
#[path = "loader_tests.rs"]
mod tests;
