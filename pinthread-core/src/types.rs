use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local identifier of a [`Thread`], stable for the session and persisted.
///
/// Threads created locally get a UUID v4; threads first seen through
/// reconciliation get `remote-<issue id>` so repeated merges agree on the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn for_remote_issue(issue: &RemoteId) -> Self {
        Self(format!("remote-{}", issue.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ThreadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local identifier of a [`Comment`], unique within its thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(String);

impl CommentId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn for_remote_comment(comment: &RemoteId) -> Self {
        Self(format!("remote-{}", comment.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommentId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier handed out by a remote tracker (issue number, comment id,
/// or any provider-specific composite). The engine never parses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<u64> for RemoteId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `(route, version)` pair a thread belongs to.
///
/// Reconciliation is always performed for exactly one scope at a time, and
/// threads from other scopes are never touched by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub route: String,
    pub version: String,
}

impl Scope {
    pub fn new(route: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.route, self.version)
    }
}

/// Where a pin was dropped. Presentation only, never used for identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anchor {
    /// A durable structural locator, with an optional normalized offset inside
    /// the located element.
    Selector {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<(f64, f64)>,
    },
    /// Fallback page position, both axes normalized to `0.0..=1.0`.
    Position { x: f64, y: f64 },
}

impl Anchor {
    /// Builds a position anchor, clamping both axes into `0.0..=1.0`.
    pub fn position(x: f64, y: f64) -> Self {
        Anchor::Position {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }

    pub fn selector(selector: impl Into<String>) -> Self {
        Anchor::Selector {
            selector: selector.into(),
            offset: None,
        }
    }

    /// Short human-readable description used in issue titles and the board.
    pub fn label(&self) -> String {
        match self {
            Anchor::Selector { selector, .. } => selector.clone(),
            Anchor::Position { x, y } => format!("({:.0}%, {:.0}%)", x * 100.0, y * 100.0),
        }
    }
}

/// Remote durability state of a thread.
///
/// `Pending` and `Error` both mean the thread holds data the tracker has not
/// confirmed; `Error` additionally means the last remote attempt failed and
/// `Thread::sync_error` explains why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Local,
    Syncing,
    Synced,
    Pending,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }
}

/// Open/closed state mirrored onto the remote issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Open,
    Closed,
}

/// A single message within a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Display text. Reply markers are stripped before a comment is stored.
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Present once the tracker confirmed creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_local_id: Option<CommentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_remote_id: Option<RemoteId>,
    /// Local text differs from the tracker's copy until an update lands.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unpushed_edit: bool,
}

impl Comment {
    pub fn is_durable(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.parent_local_id.is_some() || self.parent_remote_id.is_some()
    }
}

/// A pinned feedback conversation, mirrored 1:1 to a remote issue once durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub anchor: Anchor,
    pub scope: Scope,
    /// Insertion order. Display order is derived from `created_at`.
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_issue_id: Option<RemoteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_issue_url: Option<String>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(default)]
    pub status: ThreadStatus,
    /// `status` has not been confirmed on the linked issue yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unpushed_status: bool,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn comment(&self, id: &CommentId) -> Option<&Comment> {
        self.comments.iter().find(|c| &c.id == id)
    }

    pub fn comment_mut(&mut self, id: &CommentId) -> Option<&mut Comment> {
        self.comments.iter_mut().find(|c| &c.id == id)
    }

    pub fn comment_by_remote(&self, remote: &RemoteId) -> Option<&Comment> {
        self.comments
            .iter()
            .find(|c| c.remote_id.as_ref() == Some(remote))
    }

    /// Comments not yet confirmed by the tracker.
    pub fn pending_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.iter().filter(|c| !c.is_durable())
    }

    pub fn has_pending_comments(&self) -> bool {
        self.comments.iter().any(|c| !c.is_durable())
    }

    /// Status changes or edits of durable comments the tracker has not
    /// confirmed yet.
    pub fn has_unpushed_changes(&self) -> bool {
        self.unpushed_status || self.comments.iter().any(|c| c.unpushed_edit)
    }

    /// True when the issue exists remotely, every comment has a remote id
    /// and no local change is waiting to be sent.
    pub fn is_fully_durable(&self) -> bool {
        self.remote_issue_id.is_some() && !self.has_pending_comments() && !self.has_unpushed_changes()
    }
}
