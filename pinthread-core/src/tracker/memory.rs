//! In-process tracker.
//!
//! Backs the `memory` provider (offline runs of the board) and the engine
//! tests. It records every call, can be taken offline or told to fail a number
//! of upcoming calls, and can hold any operation until released so tests can
//! interleave local mutations with a request that is still in flight.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use super::{CreatedIssue, IssueListing, IssueTracker, NewIssue, RemoteComment, RemoteFile, RemoteIssue, TrackerKind};
use crate::error::TrackerError;
use crate::markers::{self, IssueMeta};
use crate::types::{RemoteId, Scope, ThreadStatus};

/// Operation names used for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerOp {
    CreateIssue,
    CloseIssue,
    ReopenIssue,
    FetchIssues,
    CreateComment,
    FetchComments,
    UpdateComment,
    DeleteComment,
    GetFile,
    PutFile,
}

/// One recorded call, in the order calls were issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCall {
    CreateIssue { title: String },
    CloseIssue(RemoteId),
    ReopenIssue(RemoteId),
    FetchIssues(Scope),
    CreateComment { issue: RemoteId, body: String },
    FetchComments(RemoteId),
    UpdateComment { comment: RemoteId, body: String },
    DeleteComment(RemoteId),
    GetFile(String),
    PutFile(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryIssue {
    pub id: RemoteId,
    pub title: String,
    pub body: String,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_issue: u64,
    next_comment: u64,
    clock: Option<DateTime<Utc>>,
    issues: BTreeMap<u64, MemoryIssue>,
    comments: BTreeMap<u64, Vec<RemoteComment>>,
    files: HashMap<String, RemoteFile>,
    calls: Vec<TrackerCall>,
    failures: HashMap<TrackerOp, usize>,
    offline: bool,
    /// Page limit stand-in: listings stop after this many issues.
    listing_limit: Option<usize>,
}

impl MemoryState {
    /// Strictly increasing timestamps so remote ordering is deterministic.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn check(&mut self, op: TrackerOp) -> Result<(), TrackerError> {
        if self.offline {
            return Err(TrackerError::Transport("memory tracker is offline".to_owned()));
        }
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TrackerError::Status {
                    status: 503,
                    body: format!("injected {op:?} failure"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryTracker {
    state: Arc<Mutex<MemoryState>>,
    held: Arc<watch::Sender<HashSet<TrackerOp>>>,
    held_responses: Arc<watch::Sender<HashSet<TrackerOp>>>,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        let (held, _) = watch::channel(HashSet::new());
        let (held_responses, _) = watch::channel(HashSet::new());
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_issue: 1,
                next_comment: 1000,
                ..MemoryState::default()
            })),
            held: Arc::new(held),
            held_responses: Arc::new(held_responses),
        }
    }

    /// Issue numbers handed out from now on start at `number`.
    pub fn start_issue_numbers_at(&self, number: u64) {
        self.lock().next_issue = number;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<TrackerCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Makes the next `times` calls of `op` fail with a 503.
    pub fn fail_next(&self, op: TrackerOp, times: usize) {
        self.lock().failures.insert(op, times);
    }

    /// Parks every call of `op` (after it is recorded) until [`release`].
    ///
    /// [`release`]: MemoryTracker::release
    pub fn hold(&self, op: TrackerOp) {
        self.held.send_modify(|held| {
            held.insert(op);
        });
    }

    pub fn release(&self, op: TrackerOp) {
        self.held.send_modify(|held| {
            held.remove(&op);
        });
    }

    /// Lets `op` take effect on the tracker but parks its response until
    /// [`release_response`], as if the reply were slow to arrive. Honoured by
    /// the create operations.
    ///
    /// [`release_response`]: MemoryTracker::release_response
    pub fn hold_response(&self, op: TrackerOp) {
        self.held_responses.send_modify(|held| {
            held.insert(op);
        });
    }

    pub fn release_response(&self, op: TrackerOp) {
        self.held_responses.send_modify(|held| {
            held.remove(&op);
        });
    }

    /// Cuts scope listings short after `limit` issues and marks them
    /// incomplete.
    pub fn limit_listing(&self, limit: Option<usize>) {
        self.lock().listing_limit = limit;
    }

    fn record(&self, call: TrackerCall) {
        self.lock().calls.push(call);
    }

    async fn gate(&self, op: TrackerOp) {
        let mut held = self.held.subscribe();
        // The sender lives as long as `self`, so this only ends once released.
        let _ = held.wait_for(|ops| !ops.contains(&op)).await;
    }

    async fn gate_response(&self, op: TrackerOp) {
        let mut held = self.held_responses.subscribe();
        let _ = held.wait_for(|ops| !ops.contains(&op)).await;
    }

    pub fn issue(&self, id: &RemoteId) -> Option<MemoryIssue> {
        let key = id.as_str().parse::<u64>().ok()?;
        self.lock().issues.get(&key).cloned()
    }

    pub fn issue_count(&self) -> usize {
        self.lock().issues.len()
    }

    pub fn remote_comments(&self, issue: &RemoteId) -> Vec<RemoteComment> {
        let Ok(key) = issue.as_str().parse::<u64>() else {
            return Vec::new();
        };
        self.lock().comments.get(&key).cloned().unwrap_or_default()
    }

    /// Creates an issue as if someone filed it directly on the tracker.
    pub fn seed_issue(&self, meta: &IssueMeta, title: &str) -> RemoteId {
        let mut state = self.lock();
        let created_at = state.tick();
        let number = state.next_issue;
        state.next_issue += 1;
        state.issues.insert(
            number,
            MemoryIssue {
                id: RemoteId::from(number),
                title: title.to_owned(),
                body: markers::encode_issue_body(meta),
                status: ThreadStatus::Open,
                created_at,
            },
        );
        RemoteId::from(number)
    }

    /// Adds a comment as if a human wrote it on the tracker.
    pub fn seed_comment(&self, issue: &RemoteId, author: &str, body: &str) -> RemoteId {
        let mut state = self.lock();
        let created_at = state.tick();
        let id = RemoteId::from(state.next_comment);
        state.next_comment += 1;
        let key = issue.as_str().parse::<u64>().unwrap_or_default();
        state.comments.entry(key).or_default().push(RemoteComment {
            id: id.clone(),
            author: Some(author.to_owned()),
            body: body.to_owned(),
            created_at,
        });
        id
    }

    fn issue_key(issue: &RemoteId) -> Result<u64, TrackerError> {
        issue
            .as_str()
            .parse::<u64>()
            .map_err(|_| TrackerError::Status {
                status: 404,
                body: format!("no issue {issue}"),
            })
    }

    async fn set_status(&self, issue: &RemoteId, status: ThreadStatus, op: TrackerOp) -> Result<(), TrackerError> {
        self.record(match op {
            TrackerOp::CloseIssue => TrackerCall::CloseIssue(issue.clone()),
            _ => TrackerCall::ReopenIssue(issue.clone()),
        });
        self.gate(op).await;
        let mut state = self.lock();
        state.check(op)?;
        let key = Self::issue_key(issue)?;
        let entry = state.issues.get_mut(&key).ok_or_else(|| TrackerError::Status {
            status: 404,
            body: format!("no issue {issue}"),
        })?;
        entry.status = status;
        Ok(())
    }

    fn find_comment<'a>(
        state: &'a mut MemoryState,
        comment: &RemoteId,
    ) -> Option<(&'a mut Vec<RemoteComment>, usize)> {
        state.comments.values_mut().find_map(|list| {
            let idx = list.iter().position(|c| &c.id == comment)?;
            Some((list, idx))
        })
    }
}

#[async_trait]
impl IssueTracker for MemoryTracker {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Memory
    }

    async fn create_issue(&self, issue: NewIssue) -> Result<CreatedIssue, TrackerError> {
        self.record(TrackerCall::CreateIssue {
            title: issue.title.clone(),
        });
        self.gate(TrackerOp::CreateIssue).await;
        let (number, id) = {
            let mut state = self.lock();
            state.check(TrackerOp::CreateIssue)?;
            let created_at = state.tick();
            let number = state.next_issue;
            state.next_issue += 1;
            let id = RemoteId::from(number);
            state.issues.insert(
                number,
                MemoryIssue {
                    id: id.clone(),
                    title: issue.title,
                    body: issue.body,
                    status: ThreadStatus::Open,
                    created_at,
                },
            );
            (number, id)
        };
        self.gate_response(TrackerOp::CreateIssue).await;
        Ok(CreatedIssue {
            url: format!("memory://issues/{number}"),
            id,
        })
    }

    async fn close_issue(&self, issue: &RemoteId) -> Result<(), TrackerError> {
        self.set_status(issue, ThreadStatus::Closed, TrackerOp::CloseIssue).await
    }

    async fn reopen_issue(&self, issue: &RemoteId) -> Result<(), TrackerError> {
        self.set_status(issue, ThreadStatus::Open, TrackerOp::ReopenIssue).await
    }

    async fn fetch_issues_for_scope(&self, scope: &Scope) -> Result<IssueListing, TrackerError> {
        self.record(TrackerCall::FetchIssues(scope.clone()));
        self.gate(TrackerOp::FetchIssues).await;
        let mut state = self.lock();
        state.check(TrackerOp::FetchIssues)?;
        let mut issues: Vec<RemoteIssue> = state
            .issues
            .values()
            .filter_map(|issue| {
                let meta = markers::parse_issue_meta(&issue.body)?;
                meta.matches(scope).then(|| RemoteIssue {
                    id: issue.id.clone(),
                    url: format!("memory://issues/{}", issue.id),
                    title: issue.title.clone(),
                    status: issue.status,
                    meta,
                    created_at: issue.created_at,
                })
            })
            .collect();
        match state.listing_limit {
            Some(limit) if issues.len() > limit => {
                issues.truncate(limit);
                Ok(IssueListing { issues, complete: false })
            }
            _ => Ok(IssueListing::complete(issues)),
        }
    }

    async fn create_comment(&self, issue: &RemoteId, body: &str) -> Result<RemoteId, TrackerError> {
        self.record(TrackerCall::CreateComment {
            issue: issue.clone(),
            body: body.to_owned(),
        });
        self.gate(TrackerOp::CreateComment).await;
        let id = {
            let mut state = self.lock();
            state.check(TrackerOp::CreateComment)?;
            let key = Self::issue_key(issue)?;
            if !state.issues.contains_key(&key) {
                return Err(TrackerError::Status {
                    status: 404,
                    body: format!("no issue {issue}"),
                });
            }
            let created_at = state.tick();
            let id = RemoteId::from(state.next_comment);
            state.next_comment += 1;
            state.comments.entry(key).or_default().push(RemoteComment {
                id: id.clone(),
                author: Some("pinthread".to_owned()),
                body: body.to_owned(),
                created_at,
            });
            id
        };
        self.gate_response(TrackerOp::CreateComment).await;
        Ok(id)
    }

    async fn fetch_comments(&self, issue: &RemoteId) -> Result<Vec<RemoteComment>, TrackerError> {
        self.record(TrackerCall::FetchComments(issue.clone()));
        self.gate(TrackerOp::FetchComments).await;
        let mut state = self.lock();
        state.check(TrackerOp::FetchComments)?;
        let key = Self::issue_key(issue)?;
        Ok(state.comments.get(&key).cloned().unwrap_or_default())
    }

    async fn update_comment(&self, comment: &RemoteId, body: &str) -> Result<(), TrackerError> {
        self.record(TrackerCall::UpdateComment {
            comment: comment.clone(),
            body: body.to_owned(),
        });
        self.gate(TrackerOp::UpdateComment).await;
        let mut state = self.lock();
        state.check(TrackerOp::UpdateComment)?;
        let (list, idx) = Self::find_comment(&mut state, comment).ok_or_else(|| TrackerError::Status {
            status: 404,
            body: format!("no comment {comment}"),
        })?;
        list[idx].body = body.to_owned();
        Ok(())
    }

    async fn delete_comment(&self, comment: &RemoteId) -> Result<(), TrackerError> {
        self.record(TrackerCall::DeleteComment(comment.clone()));
        self.gate(TrackerOp::DeleteComment).await;
        let mut state = self.lock();
        state.check(TrackerOp::DeleteComment)?;
        let (list, idx) = Self::find_comment(&mut state, comment).ok_or_else(|| TrackerError::Status {
            status: 404,
            body: format!("no comment {comment}"),
        })?;
        list.remove(idx);
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, TrackerError> {
        self.record(TrackerCall::GetFile(path.to_owned()));
        self.gate(TrackerOp::GetFile).await;
        let mut state = self.lock();
        state.check(TrackerOp::GetFile)?;
        Ok(state.files.get(path).cloned())
    }

    async fn put_file(
        &self,
        path: &str,
        text: &str,
        _message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, TrackerError> {
        self.record(TrackerCall::PutFile(path.to_owned()));
        self.gate(TrackerOp::PutFile).await;
        let mut state = self.lock();
        state.check(TrackerOp::PutFile)?;
        let current = state.files.get(path).map(|f| f.revision.clone());
        if current.as_deref() != expected_revision {
            return Err(TrackerError::Status {
                status: 409,
                body: format!("revision mismatch for {path}"),
            });
        }
        let revision = format!("rev-{}", state.tick().timestamp_micros());
        state.files.insert(
            path.to_owned(),
            RemoteFile {
                text: text.to_owned(),
                revision: revision.clone(),
            },
        );
        Ok(revision)
    }
}
