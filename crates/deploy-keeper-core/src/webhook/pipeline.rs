//! Webhook ingestion pipeline.
//!
//! [`WebhookPipeline::process`] walks a request through every stage and always
//! produces a [`PipelineOutcome`]; the HTTP layer only has to translate it.

use super::{
    payload::{parse_push, PushNotification},
    routing::{route, RoutingDecision},
    signature::SignatureValidator,
};
use crate::{
    config::{DeployConfig, RepositoryConfig, Settings, SharedConfig},
    deployment::{DeployError, DeploymentOrchestrator, DeploymentReport, JobKey},
    notification::{DeploymentStatus, NotificationDispatcher},
    safe_directory::SafeDirectoryRegistry,
    ssh::{Transport, TransportError},
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{error, info, instrument, warn};

// ============================================================================
// Request and Response Types
// ============================================================================

/// A webhook request as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct IncomingWebhook {
    pub method: String,
    /// Header names are expected in lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub request_id: String,
}

impl IncomingWebhook {
    pub fn new(method: impl Into<String>, headers: HashMap<String, String>, body: Bytes) -> Self {
        Self {
            method: method.into(),
            headers,
            body,
            request_id: new_request_id(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// `<unix seconds>-<6 hex chars>`
pub fn new_request_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp(), &suffix[..6])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Success,
    Failed,
    Ignored,
    Disabled,
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
            Self::Disabled => "disabled",
        };
        f.write_str(text)
    }
}

/// JSON body returned to the webhook sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
    pub request_id: String,
}

/// Stage at which processing finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Method,
    Body,
    Signature,
    Payload,
    Routing,
    Transport,
    Deployment,
}

/// HTTP status plus response body.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub http_status: u16,
    pub stage: PipelineStage,
    pub response: WebhookResponse,
}

impl PipelineOutcome {
    fn new(http_status: u16, stage: PipelineStage, status: WebhookStatus, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            http_status,
            stage,
            response: WebhookResponse {
                status,
                message: message.into(),
                details: BTreeMap::new(),
                error: None,
                timestamp: Utc::now().timestamp(),
                request_id: request_id.to_string(),
            },
        }
    }

    fn with_error(mut self, error: &str) -> Self {
        self.response.error = Some(error.to_string());
        self
    }

    fn with_details(mut self, details: BTreeMap<String, Value>) -> Self {
        self.response.details = details;
        self
    }
}

/// Why the request body could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFailure {
    Empty,
    TooLarge { limit: usize },
    Unreadable { message: String },
}

// ============================================================================
// Pipeline
// ============================================================================

/// What a late completion needs to report itself.
struct FollowUp {
    url: Option<String>,
    commit: String,
    started: Instant,
}

/// Notifications go to `settings.notification_url` of the configuration
/// snapshot taken when the request arrived.
pub struct WebhookPipeline {
    config: SharedConfig,
    orchestrator: Arc<DeploymentOrchestrator>,
    transport: Arc<dyn Transport>,
    safe_directories: Arc<SafeDirectoryRegistry>,
    notifier: NotificationDispatcher,
}

impl WebhookPipeline {
    pub fn new(
        config: SharedConfig,
        orchestrator: Arc<DeploymentOrchestrator>,
        transport: Arc<dyn Transport>,
        safe_directories: Arc<SafeDirectoryRegistry>,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            config,
            orchestrator,
            transport,
            safe_directories,
            notifier,
        }
    }

    pub fn orchestrator(&self) -> &Arc<DeploymentOrchestrator> {
        &self.orchestrator
    }

    /// Run a request through every stage.
    #[instrument(skip_all, fields(request_id = %request.request_id, method = %request.method))]
    pub async fn process(&self, request: IncomingWebhook) -> PipelineOutcome {
        let request_id = request.request_id.as_str();
        let snapshot = self.config.snapshot();

        if !request.method.eq_ignore_ascii_case("POST") {
            warn!(method = %request.method, "Invalid method (expected POST)");
            return PipelineOutcome::new(
                405,
                PipelineStage::Method,
                WebhookStatus::Failed,
                format!("Invalid HTTP method: {}", request.method),
                request_id,
            )
            .with_error("Method not allowed");
        }

        if request.body.is_empty() {
            return self.reject_body(BodyFailure::Empty, request_id);
        }
        if request.body.len() > snapshot.webhook.max_body_size {
            return self.reject_body(
                BodyFailure::TooLarge {
                    limit: snapshot.webhook.max_body_size,
                },
                request_id,
            );
        }

        let validator = SignatureValidator::new(snapshot.webhook.secret.clone());
        if let Err(e) = validator.validate(&request.headers, &request.body) {
            warn!(error = %e, "Webhook signature validation failed");
            return PipelineOutcome::new(
                401,
                PipelineStage::Signature,
                WebhookStatus::Failed,
                "Webhook signature validation failed",
                request_id,
            )
            .with_error("Unauthorized");
        }

        let push = match parse_push(&request.body) {
            Ok(push) => push,
            Err(e) => {
                warn!(error = %e, "Invalid webhook payload");
                return PipelineOutcome::new(400, PipelineStage::Payload, WebhookStatus::Failed, e.to_string(), request_id)
                    .with_error("Invalid payload");
            }
        };

        let (repository, branch) = match route(&push, &snapshot) {
            RoutingDecision::Deploy { repository, branch } => (repository, branch),
            RoutingDecision::Ignored { reason } => {
                let details = BTreeMap::from([
                    ("repository".to_string(), json!(push.repository)),
                    ("ref".to_string(), json!(push.git_ref)),
                ]);
                return PipelineOutcome::new(200, PipelineStage::Routing, WebhookStatus::Ignored, reason, request_id)
                    .with_details(details);
            }
            RoutingDecision::Disabled { reason } => {
                return PipelineOutcome::new(200, PipelineStage::Routing, WebhookStatus::Disabled, reason, request_id);
            }
            RoutingDecision::NotConfigured { reason } => {
                return PipelineOutcome::new(404, PipelineStage::Routing, WebhookStatus::Failed, reason, request_id)
                    .with_error("Configuration error");
            }
        };

        info!(
            repository = %repository.name,
            branch = %branch,
            commit = push.short_commit().unwrap_or_default(),
            pusher = push.pusher_display(),
            "Processing push"
        );

        if !self.transport.is_ready() {
            error!("SSH authentication not available");
            return PipelineOutcome::new(
                503,
                PipelineStage::Transport,
                WebhookStatus::Failed,
                "SSH authentication not configured",
                request_id,
            )
            .with_error("Configuration error");
        }

        self.execute(repository, branch, &push, &snapshot, request_id).await
    }

    /// Outcome for a body the HTTP layer could not read.
    pub fn reject_body(&self, failure: BodyFailure, request_id: &str) -> PipelineOutcome {
        let (code, message) = match &failure {
            BodyFailure::Empty => (400, "empty request body".to_string()),
            BodyFailure::TooLarge { limit } => (413, format!("request body exceeds {} bytes", limit)),
            BodyFailure::Unreadable { message } => {
                error!(error = %message, "Error reading request body");
                (400, "failed to read request body".to_string())
            }
        };
        warn!(failure = ?failure, "Rejecting request body");
        let error = if code == 413 { "Payload too large" } else { "Bad request" };
        PipelineOutcome::new(code, PipelineStage::Body, WebhookStatus::Failed, message, request_id).with_error(error)
    }

    async fn execute(
        &self,
        repository: RepositoryConfig,
        branch: String,
        push: &PushNotification,
        config: &DeployConfig,
        request_id: &str,
    ) -> PipelineOutcome {
        let settings = &config.settings;
        let webhook = &config.webhook;
        let started = Instant::now();
        let started_at = Utc::now();
        let timeout = Duration::from_secs(webhook.deploy_timeout_seconds);
        let deadline = started + timeout;
        let heartbeat = Duration::from_secs(webhook.heartbeat_seconds.max(1));

        info!(repository = %repository.name, branch = %branch, "Starting deployment");

        let result = match self.verify_transport(settings, deadline, timeout).await {
            Err(e) => Err(("ssh_test", e)),
            Ok(()) => {
                let path = repository.working_copy_path(&settings.work_dir, &branch);
                self.safe_directories.ensure(&path).await;
                let follow_up = FollowUp {
                    url: settings.notification_url.clone(),
                    commit: push.commit_id.clone().unwrap_or_default(),
                    started,
                };
                self.run_deployment(repository.clone(), branch.clone(), deadline, timeout, heartbeat, follow_up)
                    .await
                    .map_err(|e| ("deployment", e))
            }
        };

        let elapsed = started.elapsed();
        let mut details = BTreeMap::from([
            ("repository".to_string(), json!(repository.name)),
            ("branch".to_string(), json!(branch)),
            ("commit".to_string(), json!(push.short_commit().unwrap_or_default())),
            ("pusher".to_string(), json!(push.pusher_display())),
            ("duration".to_string(), json!(format!("{}s", elapsed.as_secs()))),
            ("duration_ms".to_string(), json!(elapsed.as_millis() as u64)),
            ("timestamp".to_string(), json!(started_at.timestamp())),
        ]);
        if let Some(author) = &push.author {
            details.insert("author".to_string(), json!(author));
        }
        if let Some(message) = push.truncated_message() {
            details.insert("commit_message".to_string(), json!(message));
        }

        let (outcome, notification_message) = match result {
            Ok(report) => {
                info!(
                    repository = %repository.name,
                    branch = %branch,
                    duration_ms = elapsed.as_millis() as u64,
                    outcome = "success",
                    "Deployment completed successfully"
                );
                details.insert("services".to_string(), json!(report.services));
                let outcome = PipelineOutcome::new(
                    200,
                    PipelineStage::Deployment,
                    WebhookStatus::Success,
                    "Deployment completed successfully",
                    request_id,
                )
                .with_details(details);
                (outcome, "Deployment completed successfully".to_string())
            }
            Err((stage, e)) => {
                error!(
                    repository = %repository.name,
                    branch = %branch,
                    duration_ms = elapsed.as_millis() as u64,
                    stage,
                    error = %e,
                    "Deployment failed"
                );
                details.insert("stage".to_string(), json!(stage));
                let code = match e {
                    DeployError::AlreadyInProgress { .. } => 409,
                    _ => 500,
                };
                let notification_message = if stage == "deployment" && matches!(e, DeployError::TimedOut { .. }) {
                    format!("{} (still running)", e)
                } else {
                    e.to_string()
                };
                let outcome = PipelineOutcome::new(code, PipelineStage::Deployment, WebhookStatus::Failed, e.to_string(), request_id)
                    .with_error("Deployment failed")
                    .with_details(details);
                (outcome, notification_message)
            }
        };

        self.notifier.send_to(settings.notification_url.as_deref(), DeploymentStatus {
            repository: repository.name.clone(),
            branch: branch.clone(),
            commit: push.commit_id.clone().unwrap_or_default(),
            status: outcome.response.status.to_string(),
            message: notification_message,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });

        outcome
    }

    /// Test connectivity with linear backoff, bounded by the deadline.
    async fn verify_transport(&self, settings: &Settings, deadline: Instant, timeout: Duration) -> Result<(), DeployError> {
        let attempts = settings.ssh_test_attempts.max(1);
        let base = Duration::from_secs(settings.ssh_retry_base_seconds);
        let mut last_error = TransportError::NotReady;

        for attempt in 1..=attempts {
            match tokio::time::timeout_at(deadline, self.transport.test_connection()).await {
                Err(_) => return Err(DeployError::TimedOut { after: timeout }),
                Ok(Ok(())) => {
                    info!(attempt, outcome = "success", "SSH connection verified");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "SSH test attempt failed");
                    last_error = e;
                }
            }

            if attempt < attempts {
                let delay = base * attempt;
                if tokio::time::timeout_at(deadline, tokio::time::sleep(delay)).await.is_err() {
                    return Err(DeployError::TimedOut { after: timeout });
                }
            }
        }

        Err(DeployError::Transport {
            attempts,
            source: last_error,
        })
    }

    /// Run the deployment in its own task and wait for it, the deadline, or
    /// cancellation. On timeout the task keeps running to completion and its
    /// final result is reported by [`WebhookPipeline::report_late_result`].
    async fn run_deployment(
        &self,
        repository: RepositoryConfig,
        branch: String,
        deadline: Instant,
        timeout: Duration,
        heartbeat: Duration,
        follow_up: FollowUp,
    ) -> Result<DeploymentReport, DeployError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let key = JobKey::new(&repository.name, &branch);
        let mut task = tokio::spawn(async move { orchestrator.deploy_direct(&repository, &branch).await });

        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(DeployError::Cancelled),
                        Err(e) => {
                            error!(error = %e, "Deployment task panicked");
                            Err(DeployError::Internal {
                                message: "deployment task panicked".to_string(),
                            })
                        }
                    };
                }
                _ = ticker.tick() => {
                    info!("Deployment still in progress");
                }
                _ = &mut expiry => {
                    error!(timeout_secs = timeout.as_secs(), "Deployment timeout exceeded");
                    self.report_late_result(task, key, follow_up);
                    return Err(DeployError::TimedOut { after: timeout });
                }
            }
        }
    }

    /// Wait for a deployment that outlived its deadline and notify its outcome.
    fn report_late_result(
        &self,
        task: JoinHandle<Result<DeploymentReport, DeployError>>,
        key: JobKey,
        follow_up: FollowUp,
    ) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let (status, message) = match task.await {
                Ok(Ok(_)) => (WebhookStatus::Success, "Deployment completed after timeout".to_string()),
                Ok(Err(e)) => (WebhookStatus::Failed, format!("Deployment failed after timeout: {}", e)),
                Err(e) => (WebhookStatus::Failed, format!("Deployment task ended after timeout: {}", e)),
            };
            let elapsed = follow_up.started.elapsed();
            info!(
                job_key = %key,
                status = %status,
                duration_ms = elapsed.as_millis() as u64,
                "Deployment finished after the webhook deadline"
            );
            notifier.send_to(
                follow_up.url.as_deref(),
                DeploymentStatus {
                    repository: key.repository,
                    branch: key.branch,
                    commit: follow_up.commit,
                    status: status.to_string(),
                    message,
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: Utc::now(),
                },
            );
        });
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
