//! Trust list for the version-control tool.
//!
//! `git` refuses to operate in directories owned by a different user, which is
//! common when the agent alternates between privileged and unprivileged
//! execution. The registry records which path patterns have been added to
//! `safe.directory` and which working copies have already been prepared, so each
//! is applied at most once per registry instance.

use crate::command::{CommandRunner, CommandSpec};
use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

/// Whether the process may reassign file ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipPolicy {
    /// Ownership repair is skipped.
    Unprivileged,
    /// Ownership is reassigned to `owner` (`uid:gid`).
    Privileged { owner: String },
}

impl OwnershipPolicy {
    /// Inspect the effective user of the current process.
    pub fn detect() -> Self {
        let uid = nix::unistd::geteuid();
        if uid.is_root() {
            Self::Privileged {
                owner: format!("{}:{}", uid, nix::unistd::getegid()),
            }
        } else {
            Self::Unprivileged
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Privileged { .. })
    }
}

/// Idempotent registry of trusted directories.
pub struct SafeDirectoryRegistry {
    runner: Arc<dyn CommandRunner>,
    ownership: OwnershipPolicy,
    patterns: Mutex<BTreeSet<String>>,
    applied: Mutex<HashSet<PathBuf>>,
}

impl SafeDirectoryRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>, ownership: OwnershipPolicy) -> Self {
        Self {
            runner,
            ownership,
            patterns: Mutex::new(BTreeSet::new()),
            applied: Mutex::new(HashSet::new()),
        }
    }

    pub fn ownership(&self) -> &OwnershipPolicy {
        &self.ownership
    }

    /// Trust the work directory and everything up to three levels below it.
    pub async fn seed(&self, work_dir: &Path) {
        let root = absolute(work_dir);
        let root = root.to_string_lossy();
        for pattern in [
            root.to_string(),
            format!("{}/*", root),
            format!("{}/*/*", root),
            format!("{}/*/*/*", root),
        ] {
            self.add_pattern(&pattern).await;
        }
    }

    /// Add a pattern to the global `safe.directory` list.
    ///
    /// Returns `true` if the pattern is registered after the call. Adding a pattern
    /// that is already present is a no-op.
    pub async fn add_pattern(&self, pattern: &str) -> bool {
        {
            let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
            if !patterns.insert(pattern.to_string()) {
                return true;
            }
        }

        let command = CommandSpec::new("git").args([
            "config",
            "--global",
            "--add",
            "safe.directory",
            pattern,
        ]);

        let registered = match self.runner.run(&command).await {
            Ok(output) if output.success => true,
            Ok(output) => {
                warn!(pattern = %pattern, output = %output.trimmed(), "Failed to register safe directory");
                false
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Failed to register safe directory");
                false
            }
        };

        if registered {
            debug!(pattern = %pattern, "Registered safe directory");
        } else {
            // Forget the pattern so a later call can try again.
            self.patterns
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(pattern);
        }

        registered
    }

    /// Prepare a working copy path for version-control commands.
    ///
    /// The path, its parent and its grandparent are trusted and, when privileged,
    /// the path's ownership is repaired. Repeated calls for the same path return
    /// immediately.
    pub async fn ensure(&self, path: &Path) {
        let path = absolute(path);
        if self.is_applied(&path) {
            return;
        }

        let candidates: Vec<&Path> = path.ancestors().take(3).collect();
        for candidate in candidates {
            if candidate.as_os_str().is_empty() || candidate == Path::new("/") {
                continue;
            }
            self.add_pattern(&candidate.to_string_lossy()).await;
        }

        if path.exists() {
            self.repair_ownership(&path).await;
        }

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
    }

    /// Recursively reassign `path` to the process identity.
    ///
    /// Returns `true` only if the ownership was changed.
    pub async fn repair_ownership(&self, path: &Path) -> bool {
        let owner = match &self.ownership {
            OwnershipPolicy::Privileged { owner } => owner,
            OwnershipPolicy::Unprivileged => {
                debug!(path = %path.display(), "Not privileged, skipping ownership repair");
                return false;
            }
        };

        let command = CommandSpec::new("chown")
            .args(["-R", owner.as_str()])
            .arg(path.to_string_lossy());

        match self.runner.run(&command).await {
            Ok(output) if output.success => {
                info!(path = %path.display(), owner = %owner, "Repaired directory ownership");
                true
            }
            Ok(output) => {
                warn!(path = %path.display(), output = %output.trimmed(), "Ownership repair failed");
                false
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ownership repair failed");
                false
            }
        }
    }

    pub fn is_applied(&self, path: &Path) -> bool {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&absolute(path))
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
#[path = "safe_directory_tests.rs"]
mod tests;
