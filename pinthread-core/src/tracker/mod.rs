//! Remote issue-tracker capability and its concrete providers.
//!
//! The engine is written once against [`IssueTracker`]. Each provider is a
//! request/response wrapper with no state of its own beyond its HTTP client.

pub mod github;
pub mod gitlab;
mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::markers::IssueMeta;
use crate::types::{RemoteId, Scope, ThreadStatus};

pub use github::GithubTracker;
pub use gitlab::GitlabTracker;
pub use memory::MemoryTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    Github,
    Gitlab,
    Memory,
}

impl TrackerKind {
    pub const fn as_key(self) -> &'static str {
        match self {
            TrackerKind::Github => "github",
            TrackerKind::Gitlab => "gitlab",
            TrackerKind::Memory => "memory",
        }
    }
}

/// Request for a new remote issue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIssue {
    pub id: RemoteId,
    pub url: String,
}

/// An issue as returned by [`IssueTracker::fetch_issues_for_scope`].
///
/// `meta` is the decoded scope metadata; providers only return issues whose
/// metadata decoded and matched the requested scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteIssue {
    pub id: RemoteId,
    pub url: String,
    pub title: String,
    pub status: ThreadStatus,
    pub meta: IssueMeta,
    pub created_at: DateTime<Utc>,
}

/// Issues listed for a scope.
///
/// `complete` is false when the provider stopped at its page limit. An issue
/// missing from a truncated listing may still exist remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueListing {
    pub issues: Vec<RemoteIssue>,
    pub complete: bool,
}

impl IssueListing {
    pub fn complete(issues: Vec<RemoteIssue>) -> Self {
        Self { issues, complete: true }
    }
}

/// A comment as returned by [`IssueTracker::fetch_comments`]. `body` is raw,
/// markers included.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteComment {
    pub id: RemoteId,
    pub author: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A repository file and the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub text: String,
    pub revision: String,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    fn kind(&self) -> TrackerKind;

    async fn create_issue(&self, issue: NewIssue) -> Result<CreatedIssue, TrackerError>;

    async fn close_issue(&self, issue: &RemoteId) -> Result<(), TrackerError>;

    async fn reopen_issue(&self, issue: &RemoteId) -> Result<(), TrackerError>;

    /// Every issue (open and closed) carrying metadata for `scope`, following
    /// pagination up to the provider's page limit.
    async fn fetch_issues_for_scope(&self, scope: &Scope) -> Result<IssueListing, TrackerError>;

    /// Every comment on `issue`. A thread cut short by the page limit is an
    /// error ([`TrackerError::Truncated`]), never a partial list.

    async fn create_comment(&self, issue: &RemoteId, body: &str) -> Result<RemoteId, TrackerError>;

    async fn fetch_comments(&self, issue: &RemoteId) -> Result<Vec<RemoteComment>, TrackerError>;

    async fn update_comment(&self, comment: &RemoteId, body: &str) -> Result<(), TrackerError>;

    async fn delete_comment(&self, comment: &RemoteId) -> Result<(), TrackerError>;

    /// Reads a repository file; `Ok(None)` when it does not exist.
    async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, TrackerError>;

    /// Writes a repository file and returns its new revision. When
    /// `expected_revision` is given the write must fail if the file moved on.
    async fn put_file(
        &self,
        path: &str,
        text: &str,
        message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, TrackerError>;
}

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_PAGES: u32 = 50;

/// Provider settings as read from the `[tracker]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub provider: Option<TrackerKind>,
    /// `owner/repo` for GitHub, `group/project` (or numeric id) for GitLab.
    pub repository: Option<String>,
    pub api_url: Option<String>,
    /// Name of the environment variable holding the access token.
    pub token_env: Option<String>,
    /// Branch used by `get_file` / `put_file`.
    pub branch: Option<String>,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub max_pages: u32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            provider: None,
            repository: None,
            api_url: None,
            token_env: None,
            branch: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl TrackerSettings {
    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    fn token(&self, default_env: &str) -> Option<String> {
        let env = self.token_env.as_deref().unwrap_or(default_env);
        std::env::var(env)
            .ok()
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
    }
}

/// Builds the configured tracker.
///
/// Returns `Ok(None)` when no provider is selected or its token is missing:
/// the engine then runs local-only and every remote step is skipped.
pub fn build_tracker(settings: &TrackerSettings) -> Result<Option<Arc<dyn IssueTracker>>, TrackerError> {
    let Some(kind) = settings.provider else {
        return Ok(None);
    };
    let tracker: Arc<dyn IssueTracker> = match kind {
        TrackerKind::Memory => Arc::new(MemoryTracker::new()),
        TrackerKind::Github => {
            let Some(token) = settings.token(github::DEFAULT_TOKEN_ENV) else {
                tracing::info!("github tracker selected but no token is set; running local-only");
                return Ok(None);
            };
            Arc::new(GithubTracker::new(settings, token)?)
        }
        TrackerKind::Gitlab => {
            let Some(token) = settings.token(gitlab::DEFAULT_TOKEN_ENV) else {
                tracing::info!("gitlab tracker selected but no token is set; running local-only");
                return Ok(None);
            };
            Arc::new(GitlabTracker::new(settings, token)?)
        }
    };
    Ok(Some(tracker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_provider_means_not_configured() {
        let tracker = build_tracker(&TrackerSettings::default()).expect("build");
        assert!(tracker.is_none());
    }

    #[test]
    fn missing_token_means_not_configured() {
        let settings = TrackerSettings {
            provider: Some(TrackerKind::Github),
            repository: Some("acme/site".to_owned()),
            token_env: Some("PINTHREAD_TEST_TOKEN_THAT_IS_NEVER_SET".to_owned()),
            ..TrackerSettings::default()
        };
        let tracker = build_tracker(&settings).expect("build");
        assert!(tracker.is_none());
    }

    #[test]
    fn memory_provider_needs_no_token() {
        let settings = TrackerSettings {
            provider: Some(TrackerKind::Memory),
            ..TrackerSettings::default()
        };
        let tracker = build_tracker(&settings).expect("build").expect("configured");
        assert_eq!(tracker.kind(), TrackerKind::Memory);
    }

    #[test]
    fn settings_parse_from_json_with_defaults() {
        let settings: TrackerSettings =
            serde_json::from_str(r#"{"provider":"gitlab","repository":"group/site"}"#).expect("parse");
        assert_eq!(settings.provider, Some(TrackerKind::Gitlab));
        assert_eq!(settings.max_pages, DEFAULT_MAX_PAGES);
        assert_eq!(settings.retry_max_attempts, DEFAULT_RETRY_MAX_ATTEMPTS);
    }
}
