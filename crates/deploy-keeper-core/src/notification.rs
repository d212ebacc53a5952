//! Fire-and-forget deployment notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Deployment result posted to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub status: String,
    pub message: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Posts [`DeploymentStatus`] documents to an optional endpoint.
///
/// Each send runs in a detached task; delivery failures are logged and
/// never reported back to the caller.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    client: reqwest::Client,
    url: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build notification client, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Dispatch in the background. The handle is returned for tests; callers
    /// in the request path drop it.
    pub fn send(&self, status: DeploymentStatus) -> Option<JoinHandle<()>> {
        self.send_to(self.url.as_deref(), status)
    }

    /// Like [`NotificationDispatcher::send`], to `url` instead of the
    /// configured endpoint. `None` or a blank URL sends nothing.
    pub fn send_to(&self, url: Option<&str>, status: DeploymentStatus) -> Option<JoinHandle<()>> {
        let url = url.map(str::trim).filter(|u| !u.is_empty())?.to_string();
        let client = self.client.clone();

        Some(tokio::spawn(async move {
            debug!(url = %url, repository = %status.repository, "Sending deployment notification");
            match client.post(&url).json(&status).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        repository = %status.repository,
                        branch = %status.branch,
                        "Notification sent"
                    );
                }
                Ok(response) => {
                    error!(
                        repository = %status.repository,
                        http_status = response.status().as_u16(),
                        "Notification endpoint rejected deployment status"
                    );
                }
                Err(e) => {
                    error!(repository = %status.repository, error = %e, "Failed to send notification");
                }
            }
        }))
    }
}

#[cfg(test)]
#[path = "notification_tests.rs"]
mod tests;
