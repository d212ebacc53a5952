//! Tests for the webhook ingestion pipeline.

use super::*;
use crate::{
    config::{DeployConfig, RepositoryConfig, Settings, WebhookSettings},
    repository::RepositoryManager,
    safe_directory::OwnershipPolicy,
    ssh::MockTransport,
    testing::{sign_sha256, FakeContainerDeployer, FakeSourceSync, FakeTransport, ScriptedCommandRunner},
};
use mockall::Sequence;
use tempfile::TempDir;

const SECRET: &str = "webhook-secret";

struct Harness {
    _work: TempDir,
    config: SharedConfig,
    deployer: Arc<FakeContainerDeployer>,
    git_runner: Arc<ScriptedCommandRunner>,
    pipeline: Arc<WebhookPipeline>,
}

struct HarnessBuilder {
    secret: Option<String>,
    deployer: FakeContainerDeployer,
    transport: Arc<dyn Transport>,
    notification_url: Option<String>,
    deploy_timeout_seconds: u64,
    max_body_size: usize,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            secret: Some(SECRET.to_string()),
            deployer: FakeContainerDeployer::new(),
            transport: Arc::new(FakeTransport::ready()),
            notification_url: None,
            deploy_timeout_seconds: 900,
            max_body_size: 1024 * 1024,
        }
    }

    fn deployer(mut self, deployer: FakeContainerDeployer) -> Self {
        self.deployer = deployer;
        self
    }

    fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    fn build(self) -> Harness {
        let work = TempDir::new().unwrap();
        let mut manual = RepositoryConfig::new("manual", "git@github.com:acme/manual.git", ["main"]);
        manual.auto_deploy = false;
        let config = SharedConfig::new(DeployConfig {
            repositories: vec![
                RepositoryConfig::new("app", "git@github.com:acme/app.git", ["main"]),
                manual,
            ],
            settings: Settings {
                work_dir: work.path().to_path_buf(),
                notification_url: self.notification_url.clone(),
                ..Default::default()
            },
            webhook: WebhookSettings {
                secret: self.secret,
                deploy_timeout_seconds: self.deploy_timeout_seconds,
                max_body_size: self.max_body_size,
                ..Default::default()
            },
            ..Default::default()
        });

        let deployer = Arc::new(self.deployer);
        let repositories = RepositoryManager::new(config.clone(), Arc::new(FakeSourceSync::new()));
        let orchestrator = Arc::new(DeploymentOrchestrator::new(repositories, deployer.clone()));
        let git_runner = Arc::new(ScriptedCommandRunner::new());
        let safe_directories = Arc::new(SafeDirectoryRegistry::new(
            git_runner.clone(),
            OwnershipPolicy::Unprivileged,
        ));
        let pipeline = Arc::new(WebhookPipeline::new(
            config.clone(),
            orchestrator,
            self.transport,
            safe_directories,
            NotificationDispatcher::new(self.notification_url),
        ));

        Harness {
            _work: work,
            config,
            deployer,
            git_runner,
            pipeline,
        }
    }
}

fn push_body(repository: &str, git_ref: &str) -> Bytes {
    Bytes::from(
        serde_json::to_vec(&json!({
            "ref": git_ref,
            "repository": { "name": repository },
            "head_commit": {
                "id": "a1b2c3d4e5f60718293a4b5c6d7e8f9012345678",
                "message": "Ship it",
                "author": { "name": "Mona Lisa" }
            },
            "pusher": { "name": "octocat" }
        }))
        .unwrap(),
    )
}

fn signed(body: Bytes) -> IncomingWebhook {
    let headers = HashMap::from([
        ("content-type".to_string(), "application/json".to_string()),
        ("x-hub-signature-256".to_string(), sign_sha256(SECRET, &body)),
    ]);
    IncomingWebhook::new("POST", headers, body)
}

/// Notifications received by `server`, waiting up to a second for `count`.
async fn received_statuses(server: &wiremock::MockServer, count: usize) -> Vec<DeploymentStatus> {
    let mut received = Vec::new();
    for _ in 0..100 {
        received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    received
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

mod rejection_tests {
    use super::*;

    #[tokio::test]
    async fn test_non_post_method_is_rejected() {
        let h = HarnessBuilder::new().build();
        let request = IncomingWebhook::new("GET", HashMap::new(), Bytes::new());

        let outcome = h.pipeline.process(request).await;

        assert_eq!(outcome.http_status, 405);
        assert_eq!(outcome.stage, PipelineStage::Method);
        assert_eq!(outcome.response.status, WebhookStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_body_is_rejected() {
        let h = HarnessBuilder::new().build();

        let outcome = h.pipeline.process(IncomingWebhook::new("POST", HashMap::new(), Bytes::new())).await;

        assert_eq!(outcome.http_status, 400);
        assert_eq!(outcome.response.message, "empty request body");
    }

    #[tokio::test]
    async fn test_oversize_body_is_rejected() {
        let mut builder = HarnessBuilder::new();
        builder.max_body_size = 16;
        let h = builder.build();

        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 413);
    }

    #[tokio::test]
    async fn test_unsigned_request_is_unauthorized() {
        let h = HarnessBuilder::new().build();
        let request = IncomingWebhook::new("POST", HashMap::new(), push_body("app", "refs/heads/main"));

        let outcome = h.pipeline.process(request).await;

        assert_eq!(outcome.http_status, 401);
        assert_eq!(outcome.stage, PipelineStage::Signature);
        assert_eq!(outcome.response.error.as_deref(), Some("Unauthorized"));
        assert!(h.deployer.deployments().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_body_is_unauthorized() {
        let h = HarnessBuilder::new().build();
        let mut request = signed(push_body("app", "refs/heads/main"));
        request.body = push_body("app", "refs/heads/master");

        let outcome = h.pipeline.process(request).await;

        assert_eq!(outcome.http_status, 401);
    }

    #[tokio::test]
    async fn test_payload_without_ref_is_invalid() {
        let h = HarnessBuilder::new().build();

        let outcome = h
            .pipeline
            .process(signed(Bytes::from_static(br#"{"repository":{"name":"app"}}"#)))
            .await;

        assert_eq!(outcome.http_status, 400);
        assert_eq!(outcome.response.message, "missing ref");
        assert_eq!(outcome.response.error.as_deref(), Some("Invalid payload"));
    }
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_branch_is_ignored() {
        let h = HarnessBuilder::new().build();

        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/feature-x"))).await;

        assert_eq!(outcome.http_status, 200);
        assert_eq!(outcome.response.status, WebhookStatus::Ignored);
        assert_eq!(outcome.response.details["ref"], json!("refs/heads/feature-x"));
        assert!(h.deployer.deployments().is_empty());
    }

    #[tokio::test]
    async fn test_auto_deploy_off_is_disabled() {
        let h = HarnessBuilder::new().build();

        let outcome = h.pipeline.process(signed(push_body("manual", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 200);
        assert_eq!(outcome.response.status, WebhookStatus::Disabled);
        assert!(h.deployer.deployments().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let h = HarnessBuilder::new().build();

        let outcome = h.pipeline.process(signed(push_body("ghost", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 404);
        assert_eq!(outcome.response.status, WebhookStatus::Failed);
    }

    #[tokio::test]
    async fn test_secret_change_applies_to_next_request() {
        let h = HarnessBuilder::new().build();
        let mut config = (*h.config.snapshot()).clone();
        config.webhook.secret = None;
        h.config.replace(config);
        let request = IncomingWebhook::new("POST", HashMap::new(), push_body("app", "refs/heads/feature-x"));

        let outcome = h.pipeline.process(request).await;

        assert_eq!(outcome.response.status, WebhookStatus::Ignored);
    }
}

mod execution_tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_push_is_deployed() {
        // Arrange
        let h = HarnessBuilder::new().build();
        let request = signed(push_body("app", "refs/heads/main")).with_request_id("req-1");

        // Act
        let outcome = h.pipeline.process(request).await;

        // Assert
        assert_eq!(outcome.http_status, 200);
        assert_eq!(outcome.response.status, WebhookStatus::Success);
        assert_eq!(outcome.response.request_id, "req-1");
        let details = &outcome.response.details;
        assert_eq!(details["repository"], json!("app"));
        assert_eq!(details["branch"], json!("main"));
        assert_eq!(details["commit"], json!("a1b2c3d"));
        assert_eq!(details["pusher"], json!("octocat"));
        assert_eq!(details["commit_message"], json!("Ship it"));
        assert_eq!(details["services"], json!(["web"]));

        let deployments = h.deployer.deployments();
        assert_eq!(deployments.len(), 1);
        assert_eq!((deployments[0].0.as_str(), deployments[0].1.as_str()), ("app", "main"));
        assert!(h.git_runner.count("safe.directory") >= 1);
    }

    #[tokio::test]
    async fn test_transport_not_ready_fails_fast() {
        let mut transport = MockTransport::new();
        transport.expect_is_ready().return_const(false);
        transport.expect_test_connection().times(0);
        let h = HarnessBuilder::new().transport(transport).build();

        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 503);
        assert_eq!(outcome.stage, PipelineStage::Transport);
        assert!(h.deployer.deployments().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ssh_test_retries_with_linear_backoff() {
        // Arrange
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport.expect_is_ready().return_const(true);
        transport
            .expect_test_connection()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| {
                Err(TransportError::ConnectionFailed {
                    output: "Connection timed out".to_string(),
                })
            });
        transport
            .expect_test_connection()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let h = HarnessBuilder::new().transport(transport).build();
        let started = Instant::now();

        // Act
        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        // Assert
        assert_eq!(outcome.response.status, WebhookStatus::Success);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ssh_test_exhaustion_fails_before_deploying() {
        let transport = FakeTransport::ready().failing_tests(10);
        let h = HarnessBuilder::new().transport(transport).build();

        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 500);
        assert_eq!(outcome.response.details["stage"], json!("ssh_test"));
        assert!(outcome
            .response
            .message
            .starts_with("SSH connectivity test failed after 3 attempts"));
        assert!(h.deployer.deployments().is_empty());
    }

    #[tokio::test]
    async fn test_deployment_failure_is_reported() {
        let h = HarnessBuilder::new().build();
        h.deployer.fail_with("failed to solve: dockerfile parse error");

        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 500);
        assert_eq!(outcome.response.error.as_deref(), Some("Deployment failed"));
        assert_eq!(outcome.response.details["stage"], json!("deployment"));
        assert!(outcome.response.message.starts_with("docker deployment failed"));
    }

    #[tokio::test]
    async fn test_concurrent_push_for_same_branch_conflicts() {
        let h = HarnessBuilder::new().deployer(FakeContainerDeployer::gated()).build();
        let pipeline = h.pipeline.clone();
        let first = tokio::spawn(async move { pipeline.process(signed(push_body("app", "refs/heads/main"))).await });
        h.deployer.wait_until_entered().await;

        let second = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        assert_eq!(second.http_status, 409);
        assert!(second.response.message.contains("already in progress"));
        h.deployer.release(1);
        assert_eq!(first.await.unwrap().http_status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_reports_timeout_and_leaves_job_running() {
        // Arrange
        let mut builder = HarnessBuilder::new().deployer(FakeContainerDeployer::gated());
        builder.deploy_timeout_seconds = 60;
        let h = builder.build();

        // Act
        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        // Assert
        assert_eq!(outcome.http_status, 500);
        assert_eq!(outcome.response.message, "deployment timeout after 60s");
        let orchestrator = h.pipeline.orchestrator().clone();
        assert_eq!(orchestrator.get_active_jobs().len(), 1);

        h.deployer.release(1);
        orchestrator.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(orchestrator.stats().completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_panicking_deployment_becomes_internal_error() {
        let h = HarnessBuilder::new().build();
        h.deployer.panic_on_deploy();

        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        assert_eq!(outcome.http_status, 500);
        assert_eq!(outcome.response.message, "internal error: deployment task panicked");
        assert!(h.pipeline.orchestrator().get_active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_result_is_sent_to_notification_endpoint() {
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        let mut builder = HarnessBuilder::new();
        builder.notification_url = Some(mock_server.uri());
        let h = builder.build();

        h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        let received = received_statuses(&mock_server, 1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].status, "success");
        assert_eq!(received[0].commit, "a1b2c3d4e5f60718293a4b5c6d7e8f9012345678");
    }

    #[tokio::test]
    async fn test_reloaded_notification_url_is_used_by_next_request() {
        // Arrange
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        let h = HarnessBuilder::new().build();
        let mut config = (*h.config.snapshot()).clone();
        config.settings.notification_url = Some(mock_server.uri());
        h.config.replace(config);

        // Act
        h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;

        // Assert
        let received = received_statuses(&mock_server, 1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].repository, "app");
    }

    #[tokio::test]
    async fn test_deployment_outliving_deadline_reports_final_result() {
        // Arrange
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        let mut builder = HarnessBuilder::new().deployer(FakeContainerDeployer::gated());
        builder.deploy_timeout_seconds = 1;
        builder.notification_url = Some(mock_server.uri());
        let h = builder.build();

        // Act
        let outcome = h.pipeline.process(signed(push_body("app", "refs/heads/main"))).await;
        h.deployer.release(1);
        let received = received_statuses(&mock_server, 2).await;

        // Assert
        assert_eq!(outcome.response.message, "deployment timeout after 1s");
        assert_eq!(received.len(), 2);
        let timed_out = received
            .iter()
            .find(|s| s.status == "failed")
            .expect("timeout notification");
        assert_eq!(timed_out.message, "deployment timeout after 1s (still running)");
        let finished = received
            .iter()
            .find(|s| s.status == "success")
            .expect("final notification");
        assert_eq!(finished.message, "Deployment completed after timeout");
        assert_eq!(finished.branch, "main");
        assert_eq!(finished.commit, "a1b2c3d4e5f60718293a4b5c6d7e8f9012345678");
        assert_eq!(h.pipeline.orchestrator().stats().completed_jobs, 1);
    }
}
