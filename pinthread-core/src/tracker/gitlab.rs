//! GitLab REST v4 provider.
//!
//! Issue ids are project-scoped `iid`s. Notes live under their issue, so a
//! comment's remote id is the composite `<iid>:<note id>`.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;

use super::http::HttpClient;
use super::{
    CreatedIssue, IssueListing, IssueTracker, NewIssue, RemoteComment, RemoteFile, RemoteIssue, TrackerKind,
    TrackerSettings,
};
use crate::error::TrackerError;
use crate::markers::{self, ISSUE_LABEL};
use crate::types::{RemoteId, Scope, ThreadStatus};

pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";
pub const DEFAULT_TOKEN_ENV: &str = "GITLAB_TOKEN";
const DEFAULT_BRANCH: &str = "main";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct GitlabIssue {
    iid: u64,
    web_url: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GitlabAuthor {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GitlabNote {
    id: u64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    author: Option<GitlabAuthor>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    system: bool,
}

#[derive(Debug, Deserialize)]
struct GitlabCreatedIssue {
    iid: u64,
    web_url: String,
}

#[derive(Debug, Deserialize)]
struct GitlabCreatedNote {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GitlabFile {
    content: String,
    last_commit_id: String,
}

#[derive(Clone)]
pub struct GitlabTracker {
    http: HttpClient,
    project: String,
    branch: String,
    max_pages: u32,
}

impl GitlabTracker {
    pub fn new(settings: &TrackerSettings, token: String) -> Result<Self, TrackerError> {
        let project = settings
            .repository
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                TrackerError::Configuration("gitlab tracker requires `repository = \"group/project\"`".to_owned())
            })?;

        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(token.trim())
            .map_err(|error| TrackerError::Configuration(format!("invalid gitlab token: {error}")))?;
        headers.insert("PRIVATE-TOKEN", token);

        let api_base = settings.api_url.as_deref().unwrap_or(DEFAULT_API_URL);
        Ok(Self {
            http: HttpClient::new("gitlab", api_base, headers, settings)?,
            project: encode_path(project),
            branch: settings.branch.clone().unwrap_or_else(|| DEFAULT_BRANCH.to_owned()),
            max_pages: settings.max_pages.max(1),
        })
    }

    fn project_url(&self, suffix: &str) -> String {
        self.http.url(&format!("projects/{}/{}", self.project, suffix))
    }

    async fn set_state(&self, issue: &RemoteId, event: &str) -> Result<(), TrackerError> {
        let url = self.project_url(&format!("issues/{issue}"));
        let payload = json!({ "state_event": event });
        self.http
            .status_only("update issue state", || self.http.client().put(&url).json(&payload))
            .await
    }

    /// Follows the `x-next-page` header until it is empty or `max_pages`.
    /// The flag is false when the page limit cut the listing short.
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
        let mut page = "1".to_owned();
        for _ in 0..self.max_pages {
            let (chunk, headers): (Vec<T>, HeaderMap) = self
                .http
                .json_with_headers(operation, || {
                    self.http
                        .client()
                        .get(url)
                        .query(query)
                        .query(&[("per_page", PAGE_SIZE), ("page", page.as_str())])
                })
                .await?;
            rows.extend(chunk);
            let next = headers
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            match next {
                Some(next) => page = next.to_owned(),
                None => return Ok((rows, true)),
            }
        }
        tracing::warn!(operation, max_pages = self.max_pages, "gitlab pagination stopped at page limit");
        Ok((rows, false))
    }

    async fn read_file(&self, path: &str) -> Result<Option<RemoteFile>, TrackerError> {
        let url = self.project_url(&format!("repository/files/{}", encode_path(path)));
        let result: Result<GitlabFile, TrackerError> = self
            .http
            .json("get file", || self.http.client().get(&url).query(&[("ref", self.branch.as_str())]))
            .await;
        let file = match result {
            Ok(file) => file,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error),
        };
        let packed: String = file.content.split_whitespace().collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(packed)
            .map_err(|error| TrackerError::Decode(format!("gitlab get file: {error}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|error| TrackerError::Decode(format!("gitlab get file: {error}")))?;
        Ok(Some(RemoteFile {
            text,
            revision: file.last_commit_id,
        }))
    }
}

fn encode_path(raw: &str) -> String {
    raw.trim_matches('/').replace('%', "%25").replace('/', "%2F")
}

fn split_note_id(comment: &RemoteId) -> Result<(&str, &str), TrackerError> {
    comment
        .as_str()
        .split_once(':')
        .filter(|(iid, note)| !iid.is_empty() && !note.is_empty())
        .ok_or_else(|| TrackerError::Decode(format!("gitlab comment id '{comment}' is not <iid>:<note>")))
}

#[async_trait]
impl IssueTracker for GitlabTracker {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Gitlab
    }

    async fn create_issue(&self, issue: NewIssue) -> Result<CreatedIssue, TrackerError> {
        let url = self.project_url("issues");
        let payload = json!({
            "title": issue.title,
            "description": issue.body,
            "labels": issue.labels.join(","),
        });
        let created: GitlabCreatedIssue = self
            .http
            .json("create issue", || self.http.client().post(&url).json(&payload))
            .await?;
        Ok(CreatedIssue {
            id: RemoteId::from(created.iid),
            url: created.web_url,
        })
    }

    async fn close_issue(&self, issue: &RemoteId) -> Result<(), TrackerError> {
        self.set_state(issue, "close").await
    }

    async fn reopen_issue(&self, issue: &RemoteId) -> Result<(), TrackerError> {
        self.set_state(issue, "reopen").await
    }

    async fn fetch_issues_for_scope(&self, scope: &Scope) -> Result<IssueListing, TrackerError> {
        let url = self.project_url("issues");
        let (issues, complete): (Vec<GitlabIssue>, bool) = self
            .paginate(
                "list issues",
                &url,
                &[("labels", ISSUE_LABEL), ("scope", "all"), ("order_by", "created_at"), ("sort", "asc")],
            )
            .await?;
        let issues = issues
            .into_iter()
            .filter_map(|issue| {
                let meta = markers::parse_issue_meta(issue.description.as_deref().unwrap_or_default())?;
                meta.matches(scope).then(|| RemoteIssue {
                    id: RemoteId::from(issue.iid),
                    url: issue.web_url,
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
        let url = self.project_url(&format!("issues/{issue}/notes"));
        let payload = json!({ "body": body });
        let created: GitlabCreatedNote = self
            .http
            .json("create note", || self.http.client().post(&url).json(&payload))
            .await?;
        Ok(RemoteId::new(format!("{issue}:{}", created.id)))
    }

    async fn fetch_comments(&self, issue: &RemoteId) -> Result<Vec<RemoteComment>, TrackerError> {
        let url = self.project_url(&format!("issues/{issue}/notes"));
        let (notes, complete): (Vec<GitlabNote>, bool) = self
            .paginate("list notes", &url, &[("order_by", "created_at"), ("sort", "asc")])
            .await?;
        if !complete {
            return Err(TrackerError::Truncated {
                operation: "gitlab list notes".to_owned(),
                max_pages: self.max_pages,
            });
        }
        Ok(notes
            .into_iter()
            .filter(|note| !note.system)
            .map(|note| RemoteComment {
                id: RemoteId::new(format!("{issue}:{}", note.id)),
                author: note.author.map(|a| a.username),
                body: note.body,
                created_at: note.created_at,
            })
            .collect())
    }

    async fn update_comment(&self, comment: &RemoteId, body: &str) -> Result<(), TrackerError> {
        let (iid, note) = split_note_id(comment)?;
        let url = self.project_url(&format!("issues/{iid}/notes/{note}"));
        let payload = json!({ "body": body });
        self.http
            .status_only("update note", || self.http.client().put(&url).json(&payload))
            .await
    }

    async fn delete_comment(&self, comment: &RemoteId) -> Result<(), TrackerError> {
        let (iid, note) = split_note_id(comment)?;
        let url = self.project_url(&format!("issues/{iid}/notes/{note}"));
        self.http
            .status_only("delete note", || self.http.client().delete(&url))
            .await
    }

    async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, TrackerError> {
        self.read_file(path).await
    }

    async fn put_file(
        &self,
        path: &str,
        text: &str,
        message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, TrackerError> {
        let url = self.project_url(&format!("repository/files/{}", encode_path(path)));
        let mut payload = json!({
            "branch": self.branch,
            "commit_message": message,
            "encoding": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(text),
        });
        match expected_revision {
            Some(revision) => {
                payload["last_commit_id"] = json!(revision);
                self.http
                    .status_only("update file", || self.http.client().put(&url).json(&payload))
                    .await?;
            }
            None => {
                self.http
                    .status_only("create file", || self.http.client().post(&url).json(&payload))
                    .await?;
            }
        }
        // The write endpoints do not report the new commit, so read it back.
        let written = self.read_file(path).await?.ok_or_else(|| {
            TrackerError::Decode(format!("gitlab put file: '{path}' missing right after write"))
        })?;
        Ok(written.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_paths_are_url_encoded() {
        assert_eq!(encode_path("group/sub/site"), "group%2Fsub%2Fsite");
        assert_eq!(encode_path("/docs/feedback.json"), "docs%2Ffeedback.json");
    }

    #[test]
    fn note_ids_are_split_into_issue_and_note() {
        let id = RemoteId::from("12:998");
        assert_eq!(split_note_id(&id).expect("split"), ("12", "998"));
        assert!(split_note_id(&RemoteId::from("998")).is_err());
        assert!(split_note_id(&RemoteId::from(":998")).is_err());
    }
}
