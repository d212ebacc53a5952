//! Response types for the API.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use deploy_keeper_core::{webhook::REQUEST_ID_HEADER, PipelineOutcome};
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::error;

// ============================================================================
// Response Types
// ============================================================================

/// Liveness response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_jobs: usize,
    pub queue_size: usize,
    pub timestamp: i64,
}

/// Extended service status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub active_jobs: usize,
    pub active_job_details: Vec<String>,
    pub queue_size: usize,
    pub max_workers: usize,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub repositories: usize,
    pub ssh_available: bool,
    pub timestamp: i64,
}

/// A pipeline outcome rendered as an HTTP response.
///
/// The body is the structured webhook response and the correlation id is
/// echoed in the `x-request-id` header.
#[derive(Debug)]
pub struct WebhookReply(pub PipelineOutcome);

impl IntoResponse for WebhookReply {
    fn into_response(self) -> Response {
        let PipelineOutcome {
            http_status,
            response,
            ..
        } = self.0;

        let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let request_id = HeaderValue::from_str(&response.request_id).ok();

        let mut http_response = (status, Json(response)).into_response();
        if let Some(value) = request_id {
            http_response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        http_response
    }
}

// ============================================================================
// Panic Handling
// ============================================================================

/// Converts a handler panic into a 500 JSON body.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    error!(panic = %details, "Request handler panicked");

    let body = serde_json::json!({
        "status": "error",
        "message": "An unexpected error occurred",
        "error": "Internal server error",
        "timestamp": chrono::Utc::now().timestamp(),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
