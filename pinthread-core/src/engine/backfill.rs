//! Ensure-durable-then-drain.
//!
//! Everything here runs under the thread's sync lock, so at most one
//! `create_issue` and one comment push are ever in flight per thread. State is
//! re-read after the lock is acquired and again after every remote call,
//! because local mutations keep landing while requests are outstanding.

use super::{Engine, RemoteOutcome};
use crate::markers::{self, IssueMeta};
use crate::tracker::{IssueTracker, NewIssue};
use crate::types::{CommentId, RemoteId, SyncStatus, Thread, ThreadId, ThreadStatus};

enum IssueStep {
    Ready(RemoteId),
    /// The thread was removed locally; nothing left to drain.
    Gone,
    Failed(String),
}

enum FollowUp {
    None,
    /// Text changed while the push was in flight: remote id, body, text.
    Update(RemoteId, String, String),
    /// Comment deleted while the push was in flight.
    Delete(RemoteId),
}

/// Where a pending comment sits relative to its parent.
#[derive(Debug, PartialEq)]
enum Eligibility {
    /// Pushable now, as a reply to the given remote id (or as a root).
    Ready(Option<RemoteId>),
    /// Parent is itself still pending.
    Blocked,
}

fn eligibility(thread: &Thread, comment: &crate::types::Comment) -> Eligibility {
    match &comment.parent_local_id {
        Some(parent_id) => match thread.comment(parent_id) {
            Some(parent) => match &parent.remote_id {
                Some(remote) => Eligibility::Ready(Some(remote.clone())),
                None => Eligibility::Blocked,
            },
            // Parent deleted locally: fall back to whatever remote id we
            // remembered, or treat the comment as a root.
            None => Eligibility::Ready(comment.parent_remote_id.clone()),
        },
        None => Eligibility::Ready(comment.parent_remote_id.clone()),
    }
}

/// Earliest (by `created_at`) pending comment whose parent is durable.
fn next_eligible(thread: &Thread) -> Option<CommentId> {
    thread
        .comments
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_durable())
        .filter(|(_, c)| eligibility(thread, c) != Eligibility::Blocked)
        .min_by_key(|(idx, c)| (c.created_at, *idx))
        .map(|(_, c)| c.id.clone())
}

impl Engine {
    /// Makes the thread durable: creates its issue if needed, then pushes
    /// every pending comment parent-first.
    pub async fn backfill(&self, thread_id: &ThreadId) -> RemoteOutcome {
        let Some(tracker) = self.tracker() else {
            return RemoteOutcome::Skipped;
        };
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;
        self.backfill_locked(tracker.as_ref(), thread_id).await
    }

    async fn backfill_locked(&self, tracker: &dyn IssueTracker, thread_id: &ThreadId) -> RemoteOutcome {
        match self.ensure_issue(tracker, thread_id).await {
            IssueStep::Ready(issue) => self.drain(tracker, thread_id, &issue).await,
            IssueStep::Gone => RemoteOutcome::Applied,
            IssueStep::Failed(message) => RemoteOutcome::Failed(message),
        }
    }

    /// Pushes one freshly added comment. Falls back to a full backfill when,
    /// by the time the lock is held, the comment is no longer directly
    /// pushable.
    pub(super) async fn push_single(&self, thread_id: &ThreadId, comment_id: &CommentId) -> RemoteOutcome {
        let Some(tracker) = self.tracker() else {
            return RemoteOutcome::Skipped;
        };
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let issue = {
            let state = self.state();
            let Some(thread) = state.thread(thread_id) else {
                return RemoteOutcome::Applied;
            };
            match thread.comment(comment_id) {
                None => return RemoteOutcome::Applied,
                Some(comment) if comment.is_durable() => return RemoteOutcome::Applied,
                Some(comment) => match (&thread.remote_issue_id, eligibility(thread, comment)) {
                    (Some(issue), Eligibility::Ready(_)) => Some(issue.clone()),
                    _ => None,
                },
            }
        };

        match issue {
            Some(issue) => match self.push_comment(tracker.as_ref(), thread_id, &issue, comment_id).await {
                Ok(()) => {
                    self.finish_drain(thread_id);
                    RemoteOutcome::Applied
                }
                Err(message) => RemoteOutcome::Failed(message),
            },
            None => self.backfill_locked(tracker.as_ref(), thread_id).await,
        }
    }

    async fn ensure_issue(&self, tracker: &dyn IssueTracker, thread_id: &ThreadId) -> IssueStep {
        let request = {
            let mut state = self.state();
            let Some(thread) = state.thread_mut(thread_id) else {
                state.pending_tombstones.remove(thread_id);
                return IssueStep::Gone;
            };
            if let Some(issue) = &thread.remote_issue_id {
                return IssueStep::Ready(issue.clone());
            }
            thread.sync_status = SyncStatus::Syncing;
            thread.sync_error = None;
            let scope = thread.scope.clone();
            let meta = IssueMeta {
                route: thread.scope.route.clone(),
                version: thread.scope.version.clone(),
                anchor: thread.anchor.clone(),
                thread: Some(thread.id.clone()),
            };
            let request = NewIssue {
                title: markers::issue_title(&thread.scope, &thread.anchor),
                body: markers::encode_issue_body(&meta),
                labels: self.inner.config.labels.clone(),
            };
            state.creating.insert(thread_id.clone(), scope);
            self.commit(&state);
            request
        };

        tracing::debug!(thread = %thread_id, "creating remote issue");
        let result = tracker.create_issue(request).await;

        let mut close_after = None;
        let step = {
            let mut state = self.state();
            state.creating.remove(thread_id);
            let removed = state.pending_tombstones.remove(thread_id) || state.thread(thread_id).is_none();
            match result {
                Err(error) => {
                    let message = error.to_string();
                    if let Some(thread) = state.thread_mut(thread_id) {
                        tracing::warn!(thread = %thread_id, %error, "remote issue creation failed");
                        thread.sync_status = SyncStatus::Error;
                        thread.sync_error = Some(message.clone());
                        self.commit(&state);
                    }
                    IssueStep::Failed(message)
                }
                Ok(created) if removed => {
                    tracing::info!(thread = %thread_id, issue = %created.id, "pin removed during creation; tombstoning issue");
                    state.tombstones.insert(created.id.clone());
                    state
                        .threads
                        .retain(|t| t.remote_issue_id.as_ref() != Some(&created.id));
                    self.persist_tombstone(&created.id);
                    self.commit(&state);
                    close_after = Some(created.id);
                    IssueStep::Gone
                }
                Ok(created) => {
                    let Some(thread) = state.thread_mut(thread_id) else {
                        return IssueStep::Gone;
                    };
                    thread.remote_issue_id = Some(created.id.clone());
                    thread.remote_issue_url = Some(created.url);
                    if thread.status == ThreadStatus::Closed {
                        thread.unpushed_status = true;
                        close_after = Some(created.id.clone());
                    }
                    if !thread.has_pending_comments() {
                        thread.sync_status = SyncStatus::Synced;
                    }
                    self.commit(&state);
                    IssueStep::Ready(created.id)
                }
            }
        };

        if let Some(issue) = close_after {
            tracing::debug!(thread = %thread_id, issue = %issue, "closing freshly created issue");
            match tracker.close_issue(&issue).await {
                Ok(()) => self.confirm_status(thread_id, ThreadStatus::Closed),
                // A removed pin has no thread left to carry the error.
                Err(error) => self.record_failure(thread_id, &error.to_string()),
            }
        }
        step
    }

    /// Pushes pending comments until none is eligible. A failed push ends the
    /// pass; comments stuck behind a pending parent leave the thread `Pending`.
    async fn drain(&self, tracker: &dyn IssueTracker, thread_id: &ThreadId, issue: &RemoteId) -> RemoteOutcome {
        let guard = {
            let state = self.state();
            match state.thread(thread_id) {
                Some(thread) => thread.pending_comments().count() + 1,
                None => return RemoteOutcome::Applied,
            }
        };

        for _ in 0..guard {
            let next = {
                let state = self.state();
                match state.thread(thread_id) {
                    Some(thread) => next_eligible(thread),
                    None => return RemoteOutcome::Applied,
                }
            };
            let Some(comment_id) = next else {
                break;
            };
            if let Err(message) = self.push_comment(tracker, thread_id, issue, &comment_id).await {
                return RemoteOutcome::Failed(message);
            }
        }

        self.finish_drain(thread_id);
        RemoteOutcome::Applied
    }

    async fn push_comment(
        &self,
        tracker: &dyn IssueTracker,
        thread_id: &ThreadId,
        issue: &RemoteId,
        comment_id: &CommentId,
    ) -> Result<(), String> {
        let (body, pushed_text, parent_remote) = {
            let mut state = self.state();
            let Some(thread) = state.thread_mut(thread_id) else {
                return Ok(());
            };
            let Some(comment) = thread.comment(comment_id) else {
                return Ok(());
            };
            if comment.is_durable() {
                return Ok(());
            }
            let parent_remote = match eligibility(thread, comment) {
                Eligibility::Ready(parent) => parent,
                Eligibility::Blocked => return Ok(()),
            };
            let text = comment.text.clone();
            let body = markers::encode_reply(&text, parent_remote.as_ref());
            thread.sync_status = SyncStatus::Syncing;
            self.commit(&state);
            (body, text, parent_remote)
        };

        tracing::debug!(thread = %thread_id, comment = %comment_id, "pushing comment");
        let remote_id = match tracker.create_comment(issue, &body).await {
            Ok(remote_id) => remote_id,
            Err(error) => {
                let message = error.to_string();
                self.record_failure(thread_id, &message);
                return Err(message);
            }
        };

        let follow_up = {
            let mut state = self.state();
            let follow_up = match state.thread_mut(thread_id) {
                None => FollowUp::None,
                Some(thread) => {
                    // A reconcile that ran mid-push may already hold a copy.
                    thread
                        .comments
                        .retain(|c| &c.id == comment_id || c.remote_id.as_ref() != Some(&remote_id));
                    let follow_up = match thread.comment_mut(comment_id) {
                        None => FollowUp::Delete(remote_id.clone()),
                        Some(comment) => {
                            comment.remote_id = Some(remote_id.clone());
                            comment.parent_remote_id = parent_remote.clone();
                            if comment.text != pushed_text {
                                comment.unpushed_edit = true;
                                FollowUp::Update(
                                    remote_id.clone(),
                                    markers::encode_reply(&comment.text, parent_remote.as_ref()),
                                    comment.text.clone(),
                                )
                            } else {
                                FollowUp::None
                            }
                        }
                    };
                    // Replies queued behind this comment keep its remote id
                    // even if it is deleted before they are pushed.
                    for child in &mut thread.comments {
                        if child.parent_local_id.as_ref() == Some(comment_id) && child.parent_remote_id.is_none() {
                            child.parent_remote_id = Some(remote_id.clone());
                        }
                    }
                    follow_up
                }
            };
            self.commit(&state);
            follow_up
        };

        match follow_up {
            FollowUp::None => {}
            FollowUp::Update(remote_id, body, text) => {
                tracing::debug!(thread = %thread_id, comment = %remote_id, "pushing edit made during create");
                match tracker.update_comment(&remote_id, &body).await {
                    Ok(()) => self.confirm_edit(thread_id, comment_id, &text),
                    Err(error) => self.record_failure(thread_id, &error.to_string()),
                }
            }
            FollowUp::Delete(remote_id) => {
                tracing::debug!(thread = %thread_id, comment = %remote_id, "deleting comment removed during create");
                if let Err(error) = tracker.delete_comment(&remote_id).await {
                    self.record_failure(thread_id, &error.to_string());
                }
            }
        }
        Ok(())
    }

    fn finish_drain(&self, thread_id: &ThreadId) {
        let mut state = self.state();
        let Some(thread) = state.thread_mut(thread_id) else {
            return;
        };
        if thread.remote_issue_id.is_none() || thread.sync_status == SyncStatus::Error {
            return;
        }
        thread.sync_status = if thread.has_pending_comments() || thread.has_unpushed_changes() {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        thread.sync_error = None;
        self.commit(&state);
    }
}
