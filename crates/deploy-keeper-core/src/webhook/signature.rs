//! Webhook signature validation.
//!
//! | Header | Scheme | Comparison |
//! |--------|--------|------------|
//! | `X-Hub-Signature-256` | HMAC-SHA256 over the raw body | constant time |
//! | `X-Hub-Signature` | HMAC-SHA1 over the raw body (legacy) | constant time |
//! | `X-Gitlab-Token` | shared token | constant time equality |
//!
//! Without a configured secret validation is skipped.

use super::{header, GITHUB_SHA1_HEADER, GITHUB_SHA256_HEADER, GITLAB_TOKEN_HEADER};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::{collections::HashMap, fmt};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing webhook signature")]
    Missing,

    #[error("invalid signature format: {message}")]
    InvalidFormat { message: String },

    #[error("invalid webhook signature ({scheme})")]
    Mismatch { scheme: SignatureScheme },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    HmacSha256,
    HmacSha1,
    GitLabToken,
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha1 => "hmac-sha1",
            Self::GitLabToken => "gitlab-token",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified(SignatureScheme),
    /// No secret is configured.
    Skipped,
}

/// Validates webhook requests against an optional shared secret.
#[derive(Clone)]
pub struct SignatureValidator {
    secret: Option<String>,
}

impl fmt::Debug for SignatureValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureValidator")
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl SignatureValidator {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Validate a request given its (lowercased) headers and raw body.
    ///
    /// GitHub headers take precedence over the GitLab token when both are sent.
    pub fn validate(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<SignatureCheck, SignatureError> {
        let Some(secret) = self.secret.as_deref() else {
            warn!("No webhook secret configured - skipping validation");
            return Ok(SignatureCheck::Skipped);
        };

        let github = header(headers, GITHUB_SHA256_HEADER).or_else(|| header(headers, GITHUB_SHA1_HEADER));
        if let Some(signature) = github {
            return verify_hmac(signature, body, secret).map(SignatureCheck::Verified);
        }

        if let Some(token) = header(headers, GITLAB_TOKEN_HEADER) {
            debug!("Validating GitLab token");
            if bool::from(token.as_bytes().ct_eq(secret.as_bytes())) {
                info!(scheme = %SignatureScheme::GitLabToken, outcome = "success", "Webhook signature validated");
                return Ok(SignatureCheck::Verified(SignatureScheme::GitLabToken));
            }
            warn!("GitLab token validation failed");
            return Err(SignatureError::Mismatch {
                scheme: SignatureScheme::GitLabToken,
            });
        }

        warn!("No signature header found in webhook request");
        Err(SignatureError::Missing)
    }
}

fn verify_hmac(signature: &str, body: &[u8], secret: &str) -> Result<SignatureScheme, SignatureError> {
    let (scheme, hex_digest) = if let Some(digest) = signature.strip_prefix("sha256=") {
        (SignatureScheme::HmacSha256, digest)
    } else if let Some(digest) = signature.strip_prefix("sha1=") {
        (SignatureScheme::HmacSha1, digest)
    } else {
        return Err(SignatureError::InvalidFormat {
            message: "expected sha256= or sha1= prefix".to_string(),
        });
    };

    let expected = hex::decode(hex_digest).map_err(|_| SignatureError::InvalidFormat {
        message: "signature is not valid hex".to_string(),
    })?;

    let verified = match scheme {
        SignatureScheme::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(invalid_key)?;
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        _ => {
            let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).map_err(invalid_key)?;
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
    };

    if verified {
        info!(scheme = %scheme, outcome = "success", "Webhook signature validated");
        Ok(scheme)
    } else {
        warn!(scheme = %scheme, "Webhook signature validation failed");
        Err(SignatureError::Mismatch { scheme })
    }
}

fn invalid_key(_: hmac::digest::InvalidLength) -> SignatureError {
    SignatureError::InvalidFormat {
        message: "secret cannot be used as HMAC key".to_string(),
    }
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
