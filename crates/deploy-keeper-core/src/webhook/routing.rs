//! Deployment authorization for parsed push events.

use super::payload::PushNotification;
use crate::config::{DeployConfig, RepositoryConfig};
use tracing::info;

/// What to do with a push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Deploy `branch` of `repository`.
    Deploy {
        repository: RepositoryConfig,
        branch: String,
    },
    /// Policy skip: not a branch, no commit, or branch not deployed.
    Ignored { reason: String },
    /// The repository exists but `auto_deploy` is off.
    Disabled { reason: String },
    /// The repository is unknown or not enabled.
    NotConfigured { reason: String },
}

/// Decide whether a push should trigger a deployment.
///
/// Checks run in order: branch ref, head commit, repository lookup,
/// `auto_deploy`, configured branch.
pub fn route(push: &PushNotification, config: &DeployConfig) -> RoutingDecision {
    let Some(branch) = push.branch() else {
        info!(git_ref = %push.git_ref, "Ignoring non-branch ref");
        return RoutingDecision::Ignored {
            reason: format!("non-branch ref: {}", push.git_ref),
        };
    };

    if push.commit_id.is_none() {
        info!(repository = %push.repository, branch, "Ignoring push without commits");
        return RoutingDecision::Ignored {
            reason: "no commits in push".to_string(),
        };
    }

    let Some(repository) = config.enabled_repository(&push.repository) else {
        info!(repository = %push.repository, "Repository not found in configuration");
        return RoutingDecision::NotConfigured {
            reason: format!("repository '{}' not configured", push.repository),
        };
    };

    if !repository.auto_deploy {
        info!(repository = %repository.name, "Auto-deploy disabled for repository");
        return RoutingDecision::Disabled {
            reason: format!("auto-deploy disabled for repository {}", repository.name),
        };
    }

    if !repository.has_branch(branch) {
        info!(repository = %repository.name, branch, "Branch not configured for deployment");
        return RoutingDecision::Ignored {
            reason: format!("branch '{}' not configured for deployment", branch),
        };
    }

    RoutingDecision::Deploy {
        repository: repository.clone(),
        branch: branch.to_string(),
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
