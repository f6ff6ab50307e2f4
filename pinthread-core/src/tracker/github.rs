//! GitHub REST v3 provider.
//!
//! Threads map to issues labelled [`ISSUE_LABEL`](crate::markers::ISSUE_LABEL),
//! comments to issue comments. Issue ids are issue numbers.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::HttpClient;
use super::{
    CreatedIssue, IssueListing, IssueTracker, NewIssue, RemoteComment, RemoteFile, RemoteIssue, TrackerKind,
    TrackerSettings,
};
use crate::error::TrackerError;
use crate::markers::{self, ISSUE_LABEL};
use crate::types::{RemoteId, Scope, ThreadStatus};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RepoRef {
    owner: String,
    name: String,
}

impl RepoRef {
    fn parse(raw: &str) -> Result<Self, TrackerError> {
        let invalid = || TrackerError::Configuration(format!("invalid github repository '{raw}', expected owner/repo"));
        let (owner, name) = raw.trim().split_once('/').ok_or_else(invalid)?;
        let (owner, name) = (owner.trim(), name.trim());
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            owner: owner.to_owned(),
            name: name.to_owned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GithubIssue {
    number: u64,
    html_url: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    pull_request: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: Option<GithubUser>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GithubCreated {
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubContent {
    content: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GithubContentWrite {
    content: GithubContentSha,
}

#[derive(Debug, Deserialize)]
struct GithubContentSha {
    sha: String,
}

#[derive(Clone)]
pub struct GithubTracker {
    http: HttpClient,
    repo: RepoRef,
    branch: Option<String>,
    max_pages: u32,
}

impl GithubTracker {
    pub fn new(settings: &TrackerSettings, token: String) -> Result<Self, TrackerError> {
        let repository = settings.repository.as_deref().ok_or_else(|| {
            TrackerError::Configuration("github tracker requires `repository = \"owner/repo\"`".to_owned())
        })?;
        let repo = RepoRef::parse(repository)?;

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("pinthread"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|error| TrackerError::Configuration(format!("invalid github token: {error}")))?;
        headers.insert(header::AUTHORIZATION, auth);

        let api_base = settings.api_url.as_deref().unwrap_or(DEFAULT_API_URL);
        Ok(Self {
            http: HttpClient::new("github", api_base, headers, settings)?,
            repo,
            branch: settings.branch.clone(),
            max_pages: settings.max_pages.max(1),
        })
    }

    fn repo_url(&self, suffix: &str) -> String {
        self.http
            .url(&format!("repos/{}/{}/{}", self.repo.owner, self.repo.name, suffix))
    }

    async fn set_state(&self, issue: &RemoteId, state: &str) -> Result<(), TrackerError> {
        let url = self.repo_url(&format!("issues/{issue}"));
        let payload = json!({ "state": state });
        self.http
            .status_only("update issue state", || self.http.client().patch(&url).json(&payload))
            .await
    }

    /// Follows `page=N` until a short page or `max_pages`. The flag is false
    /// when the page limit cut the listing short.
    async fn paginate<T>(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<(Vec<T>, bool), TrackerError>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut rows = Vec::new();
        for page in 1..=self.max_pages {
            let page = page.to_string();
            let per_page = PAGE_SIZE.to_string();
            let chunk: Vec<T> = self
                .http
                .json(operation, || {
                    self.http
                        .client()
                        .get(url)
                        .query(query)
                        .query(&[("per_page", per_page.as_str()), ("page", page.as_str())])
                })
                .await?;
            let len = chunk.len();
            rows.extend(chunk);
            if len < PAGE_SIZE {
                return Ok((rows, true));
            }
        }
        tracing::warn!(operation, max_pages = self.max_pages, "github pagination stopped at page limit");
        Ok((rows, false))
    }
}

#[async_trait]
impl IssueTracker for GithubTracker {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Github
    }

    async fn create_issue(&self, issue: NewIssue) -> Result<CreatedIssue, TrackerError> {
        let url = self.repo_url("issues");
        let payload = json!({ "title": issue.title, "body": issue.body, "labels": issue.labels });
        let created: GithubCreated = self
            .http
            .json("create issue", || self.http.client().post(&url).json(&payload))
            .await?;
        let number = created
            .number
            .ok_or_else(|| TrackerError::Decode("github create issue: missing issue number".to_owned()))?;
        Ok(CreatedIssue {
            id: RemoteId::from(number),
            url: created.html_url.unwrap_or_default(),
        })
    }

    async fn close_issue(&self, issue: &RemoteId) -> Result<(), TrackerError> {
        self.set_state(issue, "closed").await
    }

    async fn reopen_issue(&self, issue: &RemoteId) -> Result<(), TrackerError> {
        self.set_state(issue, "open").await
    }

    async fn fetch_issues_for_scope(&self, scope: &Scope) -> Result<IssueListing, TrackerError> {
        let url = self.repo_url("issues");
        let (issues, complete): (Vec<GithubIssue>, bool) = self
            .paginate(
                "list issues",
                &url,
                &[("labels", ISSUE_LABEL), ("state", "all"), ("sort", "created"), ("direction", "asc")],
            )
            .await?;
        let issues = issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .filter_map(|issue| {
                let meta = markers::parse_issue_meta(issue.body.as_deref().unwrap_or_default())?;
                meta.matches(scope).then(|| RemoteIssue {
                    id: RemoteId::from(issue.number),
                    url: issue.html_url,
                    title: issue.title,
                    status: if issue.state == "closed" { ThreadStatus::Closed } else { ThreadStatus::Open },
                    meta,
                    created_at: issue.created_at,
                })
            })
            .collect();
        Ok(IssueListing { issues, complete })
    }

    async fn create_comment(&self, issue: &RemoteId, body: &str) -> Result<RemoteId, TrackerError> {
        let url = self.repo_url(&format!("issues/{issue}/comments"));
        let payload = json!({ "body": body });
        let created: GithubCreated = self
            .http
            .json("create comment", || self.http.client().post(&url).json(&payload))
            .await?;
        created
            .id
            .map(RemoteId::from)
            .ok_or_else(|| TrackerError::Decode("github create comment: missing comment id".to_owned()))
    }

    async fn fetch_comments(&self, issue: &RemoteId) -> Result<Vec<RemoteComment>, TrackerError> {
        let url = self.repo_url(&format!("issues/{issue}/comments"));
        let (comments, complete): (Vec<GithubComment>, bool) = self.paginate("list comments", &url, &[]).await?;
        if !complete {
            return Err(TrackerError::Truncated {
                operation: "github list comments".to_owned(),
                max_pages: self.max_pages,
            });
        }
        Ok(comments
            .into_iter()
            .map(|c| RemoteComment {
                id: RemoteId::from(c.id),
                author: c.user.map(|u| u.login),
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            })
            .collect())
    }

    async fn update_comment(&self, comment: &RemoteId, body: &str) -> Result<(), TrackerError> {
        let url = self.repo_url(&format!("issues/comments/{comment}"));
        let payload = json!({ "body": body });
        self.http
            .status_only("update comment", || self.http.client().patch(&url).json(&payload))
            .await
    }

    async fn delete_comment(&self, comment: &RemoteId) -> Result<(), TrackerError> {
        let url = self.repo_url(&format!("issues/comments/{comment}"));
        self.http
            .status_only("delete comment", || self.http.client().delete(&url))
            .await
    }

    async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, TrackerError> {
        let url = self.repo_url(&format!("contents/{}", path.trim_start_matches('/')));
        let result: Result<GithubContent, TrackerError> = self
            .http
            .json("get file", || {
                let request = self.http.client().get(&url);
                match &self.branch {
                    Some(branch) => request.query(&[("ref", branch.as_str())]),
                    None => request,
                }
            })
            .await;
        let content = match result {
            Ok(content) => content,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error),
        };
        let packed: String = content.content.split_whitespace().collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(packed)
            .map_err(|error| TrackerError::Decode(format!("github get file: {error}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|error| TrackerError::Decode(format!("github get file: {error}")))?;
        Ok(Some(RemoteFile {
            text,
            revision: content.sha,
        }))
    }

    async fn put_file(
        &self,
        path: &str,
        text: &str,
        message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, TrackerError> {
        let url = self.repo_url(&format!("contents/{}", path.trim_start_matches('/')));
        let mut payload = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(text),
        });
        if let Some(sha) = expected_revision {
            payload["sha"] = json!(sha);
        }
        if let Some(branch) = &self.branch {
            payload["branch"] = json!(branch);
        }
        let written: GithubContentWrite = self
            .http
            .json("put file", || self.http.client().put(&url).json(&payload))
            .await?;
        Ok(written.content.sha)
    }
}

#[cfg(test)]
mod tests {
    use super::RepoRef;

    #[test]
    fn repo_ref_parse_accepts_owner_repo_shape() {
        let repo = RepoRef::parse(" acme / site ").expect("parse");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "site");
    }

    #[test]
    fn repo_ref_parse_rejects_other_shapes() {
        assert!(RepoRef::parse("acme").is_err());
        assert!(RepoRef::parse("acme/site/extra").is_err());
        assert!(RepoRef::parse("/site").is_err());
    }
}
