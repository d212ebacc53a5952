//! # Webhook Processing Module
//!
//! Turns an inbound push-event request into a deployment decision and, when
//! the decision is to deploy, runs the deployment under a deadline.
//!
//! Stages, each of which may short-circuit to a response:
//! method check, body read, signature validation, payload parse, routing,
//! execution.

pub mod payload;
pub mod pipeline;
pub mod routing;
pub mod signature;

pub use payload::{parse_push, PayloadError, PushNotification};
pub use routing::{route, RoutingDecision};
pub use signature::{SignatureCheck, SignatureError, SignatureScheme, SignatureValidator};

use std::collections::HashMap;

/// Header carrying the GitHub HMAC-SHA256 signature.
pub const GITHUB_SHA256_HEADER: &str = "x-hub-signature-256";

/// Header carrying the legacy GitHub HMAC-SHA1 signature.
pub const GITHUB_SHA1_HEADER: &str = "x-hub-signature";

/// Header carrying the GitLab shared token.
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";

/// Response header holding the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Case-insensitive header lookup over a lowercased header map.
pub(crate) fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .or_else(|| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}
