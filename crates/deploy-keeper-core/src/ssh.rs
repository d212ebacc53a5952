//! Authenticated transport for outbound version-control operations.

use crate::{
    command::{CommandError, CommandRunner, CommandSpec},
    config::SshSettings,
};
use async_trait::async_trait;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use tracing::{debug, info, instrument, warn};

/// Marker printed by hosting providers when key authentication succeeds.
const AUTHENTICATED_MARKER: &str = "successfully authenticated";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SSH not configured")]
    NotReady,

    #[error("no SSH private key found (looked in: {})", display_paths(.tried))]
    KeyNotFound { tried: Vec<PathBuf> },

    #[error("SSH connection test failed: {output}")]
    ConnectionFailed { output: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Supplies authentication for `git` and reports transport readiness.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether deployments may rely on this transport.
    fn is_ready(&self) -> bool;

    /// Environment variables to add to every `git` invocation.
    fn git_environment(&self) -> Vec<(String, String)>;

    /// Check that the remote host accepts our credentials.
    async fn test_connection(&self) -> Result<(), TransportError>;
}

// ============================================================================
// SSH Transport
// ============================================================================

/// Key-based SSH transport driven through the `ssh` client.
///
/// Settings can be replaced at runtime with [`SshTransport::reconfigure`].
pub struct SshTransport {
    runner: Arc<dyn CommandRunner>,
    state: RwLock<SshState>,
}

#[derive(Debug, Clone)]
struct SshState {
    settings: SshSettings,
    key_path: Option<PathBuf>,
}

impl SshState {
    fn load(settings: SshSettings) -> Self {
        let key_path = if settings.enabled {
            match discover_key(&settings) {
                Ok(path) => {
                    fix_key_permissions(&path);
                    info!(key = %path.display(), "SSH key found");
                    Some(path)
                }
                Err(e) => {
                    warn!(error = %e, "SSH transport is not ready");
                    None
                }
            }
        } else {
            debug!("SSH transport disabled, git uses its default credentials");
            None
        };
        Self { settings, key_path }
    }
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("SshTransport")
            .field("settings", &state.settings)
            .field("key_path", &state.key_path)
            .finish()
    }
}

impl SshTransport {
    /// Locate the private key and prepare its permissions.
    ///
    /// A transport without a key is still constructed; it simply reports not
    /// ready. When SSH is disabled in settings the transport is always ready and
    /// adds nothing to the `git` environment.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: SshSettings) -> Self {
        Self {
            runner,
            state: RwLock::new(SshState::load(settings)),
        }
    }

    /// Apply new settings, rediscovering the key. Unchanged settings are a no-op.
    pub fn reconfigure(&self, settings: SshSettings) {
        if self.state().settings == settings {
            return;
        }
        let state = SshState::load(settings);
        info!(ready = !state.settings.enabled || state.key_path.is_some(), "SSH settings reloaded");
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.state().key_path
    }

    fn state(&self) -> SshState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn ssh_options(key: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        key.to_string_lossy().into_owned(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ]
}

/// Quote `word` for `sh`, which is how git runs `GIT_SSH_COMMAND`.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn is_ready(&self) -> bool {
        let state = self.state();
        !state.settings.enabled || state.key_path.is_some()
    }

    fn git_environment(&self) -> Vec<(String, String)> {
        match self.state().key_path {
            Some(key) => {
                let command = std::iter::once("ssh".to_string())
                    .chain(ssh_options(&key).iter().map(|word| shell_quote(word)))
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![("GIT_SSH_COMMAND".to_string(), command)]
            }
            None => Vec::new(),
        }
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> Result<(), TransportError> {
        let state = self.state();
        if !state.settings.enabled {
            return Ok(());
        }
        let key = state.key_path.as_deref().ok_or(TransportError::NotReady)?;
        debug!(host = %state.settings.test_host, "Testing SSH connection");

        let command = CommandSpec::new("ssh")
            .arg("-T")
            .args(ssh_options(key))
            .args([
                "-o".to_string(),
                format!("ConnectTimeout={}", state.settings.connect_timeout_seconds),
                state.settings.test_host.clone(),
            ]);

        let output = self.runner.run(&command).await?;

        // `ssh -T` exits non-zero even on success because no shell is granted.
        if output.output.contains(AUTHENTICATED_MARKER) {
            debug!("SSH connection test succeeded");
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed {
                output: output.trimmed().to_string(),
            })
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Candidate key locations in lookup order.
fn key_candidates(settings: &SshSettings) -> Vec<PathBuf> {
    if let Some(path) = &settings.key_path {
        return vec![path.clone()];
    }

    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".ssh").join("id_rsa"));
    }
    let root_key = PathBuf::from("/root/.ssh/id_rsa");
    if !candidates.contains(&root_key) {
        candidates.push(root_key);
    }
    candidates
}

fn discover_key(settings: &SshSettings) -> Result<PathBuf, TransportError> {
    let tried = key_candidates(settings);
    match tried.iter().find(|candidate| candidate.is_file()) {
        Some(path) => Ok(path.clone()),
        None => Err(TransportError::KeyNotFound { tried }),
    }
}

#[cfg(unix)]
fn fix_key_permissions(key: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let mut targets = vec![(key.to_path_buf(), 0o600)];
    let public = key.with_extension("pub");
    if public.exists() {
        targets.push((public, 0o644));
    }
    if let Some(dir) = key.parent() {
        targets.push((dir.to_path_buf(), 0o700));
    }

    for (path, mode) in targets {
        if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %e, "Failed to adjust SSH file permissions");
        }
    }
}

#[cfg(not(unix))]
fn fix_key_permissions(_key: &Path) {}

#[cfg(test)]
#[path = "ssh_tests.rs"]
mod tests;
