//! # Deploy-Keeper HTTP Service
//!
//! HTTP server receiving push webhooks and running the resulting deployments.
//!
//! This service provides:
//! - The webhook endpoint (any method; non-POST requests get a structured 405)
//! - `GET /health` and `GET /status`
//! - `GET /metrics` in Prometheus text format

pub mod errors;
pub mod metrics;
pub mod responses;

pub use errors::{ApiError, ServiceError};
pub use metrics::ServiceMetrics;
pub use responses::{HealthResponse, StatusResponse, WebhookReply};

use axum::{
    extract::{
        rejection::{BytesRejection, FailedToBufferBody},
        DefaultBodyLimit, Extension, Request, State,
    },
    http::{HeaderMap, HeaderValue, Method},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{any, get},
    Router,
};
use bytes::Bytes;
use chrono::Utc;
use deploy_keeper_core::{
    webhook::{
        pipeline::{new_request_id, BodyFailure},
        REQUEST_ID_HEADER,
    },
    DeploymentOrchestrator, IncomingWebhook, SharedConfig, Transport, WebhookPipeline,
};
use std::{
    collections::HashMap,
    future::{Future, IntoFuture},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, sync::Notify};
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Current configuration snapshot handle
    pub config: SharedConfig,

    /// Webhook ingestion pipeline
    pub pipeline: Arc<WebhookPipeline>,

    /// Job registry and statistics
    pub orchestrator: Arc<DeploymentOrchestrator>,

    /// Outbound authentication for version-control operations
    pub transport: Arc<dyn Transport>,

    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    pub fn new(
        config: SharedConfig,
        pipeline: Arc<WebhookPipeline>,
        transport: Arc<dyn Transport>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let orchestrator = Arc::clone(pipeline.orchestrator());
        Self {
            config,
            pipeline,
            orchestrator,
            transport,
            metrics,
        }
    }
}

/// Correlation id of the current request, set by the logging middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints.
///
/// The webhook path and body limit are taken from the configuration snapshot
/// current at construction time.
pub fn create_router(state: AppState) -> Router {
    let snapshot = state.config.snapshot();

    let router = Router::new()
        .route(&snapshot.webhook.path, any(handle_webhook))
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/metrics", get(metrics_endpoint))
        .layer(DefaultBodyLimit::max(snapshot.webhook.max_body_size))
        .with_state(state);

    with_middleware(router)
}

fn with_middleware(router: Router) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_logging_middleware))
            .layer(CatchPanicLayer::custom(responses::panic_response))
            .into_inner(),
    )
}

/// Start HTTP server on the configured host and port.
///
/// Runs until SIGINT or SIGTERM, then drains active deployments and shuts
/// the listener down gracefully.
pub async fn start_server(state: AppState) -> Result<(), ServiceError> {
    let snapshot = state.config.snapshot();
    let address = format!("{}:{}", snapshot.webhook.host, snapshot.webhook.port);

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    info!(
        address = %address,
        webhook_path = %snapshot.webhook.path,
        repositories = snapshot.enabled_repositories().count(),
        "Starting HTTP server"
    );

    serve(listener, state, os_shutdown_signal()).await
}

/// Serve on `listener` until `signal` resolves.
///
/// After the signal, active deployments get `drain_timeout_seconds` to finish
/// and in-flight requests get `shutdown_timeout_seconds`.
pub async fn serve<S>(listener: TcpListener, state: AppState, signal: S) -> Result<(), ServiceError>
where
    S: Future<Output = ()> + Send + 'static,
{
    let snapshot = state.config.snapshot();
    let drain_timeout = Duration::from_secs(snapshot.webhook.drain_timeout_seconds);
    let shutdown_timeout = Duration::from_secs(snapshot.webhook.shutdown_timeout_seconds);

    let orchestrator = Arc::clone(&state.orchestrator);
    let shutdown_started = Arc::new(Notify::new());
    let started = Arc::clone(&shutdown_started);

    let graceful = async move {
        signal.await;
        info!(drain_timeout_secs = drain_timeout.as_secs(), "Shutting down deployment service");
        if let Err(e) = orchestrator.shutdown(drain_timeout).await {
            warn!(error = %e, "Deployment service shutdown error");
        }
        info!(shutdown_timeout_secs = shutdown_timeout.as_secs(), "Shutting down HTTP server");
        started.notify_one();
    };

    let app = create_router(state);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| ServiceError::ServerFailed {
                message: e.to_string(),
            })?;
            info!(outcome = "success", "HTTP server shutdown complete");
        }
        _ = async {
            shutdown_started.notified().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!("HTTP shutdown timeout exceeded, closing remaining connections");
        }
    }

    Ok(())
}

async fn os_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

// ============================================================================
// Webhook Handler
// ============================================================================

/// Run a webhook request through the ingestion pipeline.
#[instrument(skip_all, fields(request_id = %request_id.0))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> WebhookReply {
    let started = Instant::now();

    let outcome = match body {
        Ok(body) => {
            let request = IncomingWebhook::new(method.as_str(), header_map(&headers), body)
                .with_request_id(request_id.0.clone());
            state.pipeline.process(request).await
        }
        Err(rejection) => {
            let failure = match rejection {
                BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => BodyFailure::TooLarge {
                    limit: state.config.snapshot().webhook.max_body_size,
                },
                other => BodyFailure::Unreadable {
                    message: other.body_text(),
                },
            };
            state.pipeline.reject_body(failure, &request_id.0)
        }
    };

    state.metrics.record_webhook(&outcome, started.elapsed());
    info!(
        status = %outcome.response.status,
        http_status = outcome.http_status,
        duration_ms = started.elapsed().as_millis() as u64,
        "Webhook request finished"
    );

    WebhookReply(outcome)
}

/// Lowercased header names; values that are not valid UTF-8 become empty.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_lowercase(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

// ============================================================================
// Health and Status Handlers
// ============================================================================

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_jobs = state.orchestrator.get_active_jobs().len();

    Json(HealthResponse {
        status: "healthy".to_string(),
        active_jobs,
        queue_size: 0,
        timestamp: Utc::now().timestamp(),
    })
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.orchestrator.stats();
    let repositories = state.config.snapshot().enabled_repositories().count();

    Json(StatusResponse {
        status: "running".to_string(),
        active_jobs: stats.active_jobs,
        active_job_details: stats.active_job_details,
        queue_size: stats.queue_size,
        max_workers: stats.max_workers,
        total_jobs: stats.total_jobs,
        completed_jobs: stats.completed_jobs,
        failed_jobs: stats.failed_jobs,
        repositories,
        ssh_available: state.transport.is_ready(),
        timestamp: Utc::now().timestamp(),
    })
}

/// Prometheus metrics endpoint
#[instrument(skip_all)]
async fn metrics_endpoint(State(state): State<AppState>) -> Result<String, ApiError> {
    state.metrics.encode().map_err(|e| ApiError::MetricsEncoding {
        message: e.to_string(),
    })
}

// ============================================================================
// Middleware
// ============================================================================

/// Assigns the request correlation id and logs request start and completion.
///
/// An incoming `x-request-id` is reused; otherwise a new id is generated. The
/// id is echoed on every response.
async fn request_logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    request.extensions_mut().insert(RequestId(request_id.clone()));
    info!(request_id = %request_id, method = %method, path = %path, "Request started");

    let mut response = next.run(request).await;

    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;
    if status.is_server_error() {
        error!(request_id = %request_id, method = %method, path = %path, status = %status, duration_ms, "Request failed");
    } else {
        info!(request_id = %request_id, method = %method, path = %path, status = %status, duration_ms, "Request completed");
    }

    response
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
