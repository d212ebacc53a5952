//! Common test utilities for deploy-keeper integration tests
//!
//! Builds the full HTTP application over in-memory collaborators so scenarios
//! exercise routing, signature checks, the pipeline and the orchestrator
//! together without touching git, ssh or docker.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
};
use deploy_keeper_api::{AppState, ServiceMetrics};
use deploy_keeper_core::{
    docker::{ComposeCommand, StartRetryPolicy},
    testing::{sign_sha256, FakeContainerDeployer, FakeSourceSync, FakeTransport, ScriptedCommandRunner},
    ComposeRuntime, ContainerDeployer, DeployConfig, DeploymentOrchestrator, NotificationDispatcher,
    OwnershipPolicy, RepositoryConfig, RepositoryManager, SafeDirectoryRegistry, Settings, SharedConfig,
    Transport, WebhookPipeline, WebhookSettings,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

pub const SECRET: &str = "integration-secret";

// ============================================================================
// Test Environment
// ============================================================================

/// Everything a scenario needs to drive and observe the service.
pub struct TestEnv {
    _work: TempDir,
    pub state: AppState,
    pub config: SharedConfig,
    pub sync: Arc<FakeSourceSync>,
    pub safe_directory_runner: Arc<ScriptedCommandRunner>,
}

impl TestEnv {
    /// Service over a fake deployer.
    pub fn new(repositories: Vec<RepositoryConfig>, deployer: Arc<FakeContainerDeployer>) -> Self {
        Self::with_deployer(repositories, deployer)
    }

    /// Service over the compose runtime driven by `runner`.
    ///
    /// Retries back off for zero seconds so exhausted starts finish promptly.
    pub fn with_compose(repositories: Vec<RepositoryConfig>, runner: Arc<ScriptedCommandRunner>) -> Self {
        let retry = StartRetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        };
        let runtime = Arc::new(ComposeRuntime::new(runner, ComposeCommand::Plugin, retry));
        Self::with_deployer(repositories, runtime)
    }

    fn with_deployer(repositories: Vec<RepositoryConfig>, deployer: Arc<dyn ContainerDeployer>) -> Self {
        let work = TempDir::new().unwrap();
        let config = SharedConfig::new(DeployConfig {
            repositories,
            settings: Settings {
                work_dir: work.path().to_path_buf(),
                ssh_retry_base_seconds: 0,
                ..Default::default()
            },
            webhook: WebhookSettings {
                secret: Some(SECRET.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let sync = Arc::new(FakeSourceSync::new());
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport::ready());
        let safe_directory_runner = Arc::new(ScriptedCommandRunner::new());
        let safe_directories = Arc::new(SafeDirectoryRegistry::new(
            safe_directory_runner.clone(),
            OwnershipPolicy::Unprivileged,
        ));

        let repositories = RepositoryManager::new(config.clone(), sync.clone());
        let orchestrator = Arc::new(DeploymentOrchestrator::new(repositories, deployer));
        let pipeline = Arc::new(WebhookPipeline::new(
            config.clone(),
            orchestrator,
            transport.clone(),
            safe_directories,
            NotificationDispatcher::disabled(),
        ));
        let state = AppState::new(config.clone(), pipeline, transport, ServiceMetrics::new().unwrap());

        Self {
            _work: work,
            state,
            config,
            sync,
            safe_directory_runner,
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Repository `app` deploying `main` automatically.
pub fn app_repository() -> RepositoryConfig {
    RepositoryConfig::new("app", "git@github.com:acme/app.git", ["main"])
}

pub fn github_push(repository: &str, git_ref: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": git_ref,
        "repository": { "name": repository },
        "head_commit": {
            "id": "9f8e7d6c5b4a39281706f5e4d3c2b1a098765432",
            "message": "Bump image tag",
            "author": { "name": "Jane Doe" }
        },
        "pusher": { "name": "jdoe" }
    }))
    .unwrap()
}

pub fn gitlab_push(repository: &str, git_ref: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "object_kind": "push",
        "ref": git_ref,
        "checkout_sha": "00aa11bb22cc33dd44ee55ff66778899aabbccdd",
        "user_name": "gitlab-user",
        "repository": { "name": repository },
        "commits": [{ "id": "00aa11bb22cc33dd44ee55ff66778899aabbccdd", "message": "Update compose" }]
    }))
    .unwrap()
}

/// Webhook request signed the way GitHub signs it.
pub fn signed_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("x-github-event", "push")
        .header("x-hub-signature-256", sign_sha256(SECRET, &body))
        .body(Body::from(body))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
