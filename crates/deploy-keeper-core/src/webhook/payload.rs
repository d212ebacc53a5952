//! Push-event payload parsing for GitHub and GitLab.
//!
//! Only the fields needed for routing and reporting are read; everything else
//! in the payload is ignored.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prefix of a branch ref.
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Commit messages longer than this are truncated for responses.
pub const MAX_COMMIT_MESSAGE_LEN: usize = 100;

const SHORT_COMMIT_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid JSON format: {message}")]
    InvalidJson { message: String },

    #[error("missing repository name")]
    MissingRepositoryName,

    #[error("missing ref")]
    MissingRef,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPush {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    repository: Option<RawRepository>,
    head_commit: Option<RawCommit>,
    pusher: Option<RawNamed>,
    sender: Option<RawSender>,
    // GitLab
    checkout_sha: Option<String>,
    user_name: Option<String>,
    commits: Vec<RawCommit>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRepository {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCommit {
    id: Option<String>,
    message: Option<String>,
    author: Option<RawNamed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNamed {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSender {
    login: Option<String>,
}

// ============================================================================
// Push Notification
// ============================================================================

/// Provider-neutral view of a push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub repository: String,
    pub git_ref: String,
    pub commit_id: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub pusher: Option<String>,
}

impl PushNotification {
    /// Branch name when the ref is a branch ref.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix(BRANCH_REF_PREFIX)
    }

    pub fn short_commit(&self) -> Option<&str> {
        self.commit_id
            .as_deref()
            .map(|id| id.get(..SHORT_COMMIT_LEN).unwrap_or(id))
    }

    /// Commit message capped at [`MAX_COMMIT_MESSAGE_LEN`] characters.
    pub fn truncated_message(&self) -> Option<String> {
        self.commit_message
            .as_deref()
            .map(|message| truncate(message, MAX_COMMIT_MESSAGE_LEN))
    }

    /// Who pushed: pusher, then sender, then commit author.
    pub fn pusher_display(&self) -> &str {
        self.pusher
            .as_deref()
            .or(self.author.as_deref())
            .unwrap_or("unknown")
    }
}

/// Parse a GitHub or GitLab push payload.
pub fn parse_push(body: &[u8]) -> Result<PushNotification, PayloadError> {
    let raw: RawPush = serde_json::from_slice(body).map_err(|e| {
        let sample = String::from_utf8_lossy(body);
        debug!(body_sample = %truncate(&sample, 200), "Error parsing webhook JSON");
        PayloadError::InvalidJson {
            message: e.to_string(),
        }
    })?;

    let repository = raw
        .repository
        .and_then(|r| r.name)
        .filter(|name| !name.is_empty())
        .ok_or(PayloadError::MissingRepositoryName)?;
    let git_ref = raw
        .git_ref
        .filter(|r| !r.is_empty())
        .ok_or(PayloadError::MissingRef)?;

    let head = raw.head_commit.unwrap_or_else(|| {
        // GitLab sends the pushed commits and the new tip separately.
        let checkout = raw.checkout_sha.filter(|sha| !is_null_commit(sha));
        let mut commits = raw.commits;
        let position = commits
            .iter()
            .position(|c| c.id.is_some() && c.id == checkout)
            .or_else(|| commits.len().checked_sub(1));
        let mut commit = position.map(|i| commits.swap_remove(i)).unwrap_or_default();
        if commit.id.is_none() {
            commit.id = checkout;
        }
        commit
    });

    let commit_id = head.id.filter(|id| !is_null_commit(id));
    let commit_message = head.message.filter(|m| !m.is_empty());
    let author = head.author.and_then(|a| a.name).filter(|n| !n.is_empty());

    let pusher = raw
        .pusher
        .and_then(|p| p.name)
        .or_else(|| raw.sender.and_then(|s| s.login))
        .or(raw.user_name)
        .filter(|p| !p.is_empty());

    Ok(PushNotification {
        repository,
        git_ref,
        commit_id,
        commit_message,
        author,
        pusher,
    })
}

/// Branch deletions carry an all-zero commit id.
fn is_null_commit(id: &str) -> bool {
    id.is_empty() || id.bytes().all(|b| b == b'0')
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
#[path = "payload_tests.rs"]
mod tests;
