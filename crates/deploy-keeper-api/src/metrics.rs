//! Prometheus metrics for the webhook service.
//!
//! Each [`ServiceMetrics`] owns its own [`Registry`], so independent routers
//! (for example in tests) never collide on metric registration.

use deploy_keeper_core::{webhook::pipeline::PipelineStage, PipelineOutcome, WebhookStatus};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::{sync::Arc, time::Duration};

/// Service metrics for observability
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    /// Webhook requests by response status (`success`, `failed`, `ignored`, `disabled`)
    pub webhook_requests_total: IntCounterVec,

    /// Deployments attempted through the webhook, by outcome
    pub deployments_total: IntCounterVec,

    pub deployment_duration_seconds: Histogram,

    pub signature_validation_failures_total: IntCounter,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let webhook_requests_total = IntCounterVec::new(
            Opts::new("webhook_requests_total", "Webhook requests by response status"),
            &["status"],
        )?;
        let deployments_total = IntCounterVec::new(
            Opts::new("deployments_total", "Webhook-driven deployments by outcome"),
            &["outcome"],
        )?;
        let deployment_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "deployment_duration_seconds",
                "Time from accepted push to deployment result",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0]),
        )?;
        let signature_validation_failures_total = IntCounter::new(
            "signature_validation_failures_total",
            "Webhook requests rejected for a missing or invalid signature",
        )?;

        registry.register(Box::new(webhook_requests_total.clone()))?;
        registry.register(Box::new(deployments_total.clone()))?;
        registry.register(Box::new(deployment_duration_seconds.clone()))?;
        registry.register(Box::new(signature_validation_failures_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            webhook_requests_total,
            deployments_total,
            deployment_duration_seconds,
            signature_validation_failures_total,
        }))
    }

    /// Record a finished webhook request.
    pub fn record_webhook(&self, outcome: &PipelineOutcome, elapsed: Duration) {
        let status = outcome.response.status;
        self.webhook_requests_total
            .with_label_values(&[status.to_string().as_str()])
            .inc();

        match outcome.stage {
            PipelineStage::Signature => self.signature_validation_failures_total.inc(),
            PipelineStage::Deployment => {
                let label = if status == WebhookStatus::Success {
                    "success"
                } else {
                    "failed"
                };
                self.deployments_total.with_label_values(&[label]).inc();
                self.deployment_duration_seconds.observe(elapsed.as_secs_f64());
            }
            _ => {}
        }
    }

    /// Text exposition of every metric in this instance's registry.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
