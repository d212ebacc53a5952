use super::*;
use deploy_keeper_core::WebhookResponse;
use std::collections::BTreeMap;

fn outcome(stage: PipelineStage, status: WebhookStatus) -> PipelineOutcome {
    PipelineOutcome {
        http_status: 200,
        stage,
        response: WebhookResponse {
            status,
            message: String::new(),
            details: BTreeMap::new(),
            error: None,
            timestamp: 0,
            request_id: "test".to_string(),
        },
    }
}

#[test]
fn test_instances_do_not_share_registrations() {
    let first = ServiceMetrics::new();
    let second = ServiceMetrics::new();

    assert!(first.is_ok());
    assert!(second.is_ok());
}

#[test]
fn test_deployment_outcome_is_counted() {
    let metrics = ServiceMetrics::new().unwrap();

    metrics.record_webhook(
        &outcome(PipelineStage::Deployment, WebhookStatus::Success),
        Duration::from_secs(12),
    );
    metrics.record_webhook(
        &outcome(PipelineStage::Deployment, WebhookStatus::Failed),
        Duration::from_secs(3),
    );

    assert_eq!(metrics.deployments_total.with_label_values(&["success"]).get(), 1);
    assert_eq!(metrics.deployments_total.with_label_values(&["failed"]).get(), 1);
    assert_eq!(metrics.deployment_duration_seconds.get_sample_count(), 2);
}

#[test]
fn test_routing_outcome_is_not_a_deployment() {
    let metrics = ServiceMetrics::new().unwrap();

    metrics.record_webhook(
        &outcome(PipelineStage::Routing, WebhookStatus::Ignored),
        Duration::from_millis(2),
    );

    assert_eq!(metrics.webhook_requests_total.with_label_values(&["ignored"]).get(), 1);
    assert_eq!(metrics.deployment_duration_seconds.get_sample_count(), 0);
}

#[test]
fn test_signature_rejection_is_counted() {
    let metrics = ServiceMetrics::new().unwrap();

    metrics.record_webhook(
        &outcome(PipelineStage::Signature, WebhookStatus::Failed),
        Duration::ZERO,
    );

    assert_eq!(metrics.signature_validation_failures_total.get(), 1);
    assert_eq!(metrics.webhook_requests_total.with_label_values(&["failed"]).get(), 1);
}

#[test]
fn test_encode_includes_all_families() {
    let metrics = ServiceMetrics::new().unwrap();
    metrics.record_webhook(
        &outcome(PipelineStage::Deployment, WebhookStatus::Success),
        Duration::from_secs(1),
    );
    metrics.record_webhook(
        &outcome(PipelineStage::Signature, WebhookStatus::Failed),
        Duration::ZERO,
    );

    let text = metrics.encode().unwrap();

    assert!(text.contains("webhook_requests_total{status=\"success\"} 1"));
    assert!(text.contains("deployments_total{outcome=\"success\"} 1"));
    assert!(text.contains("deployment_duration_seconds_count 1"));
    assert!(text.contains("signature_validation_failures_total 1"));
}
