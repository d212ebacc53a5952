//! Error types for the HTTP service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::error;

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Failed to initialize metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failures of the observability endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Failed to encode metrics: {message}")]
    MetricsEncoding { message: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self, "API request failed");

        let body = serde_json::json!({
            "status": "error",
            "error": self.to_string(),
            "timestamp": chrono::Utc::now().timestamp(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
