//! Pulling a scope's remote state and merging it into the local collection.
//!
//! The merge is a pure function over snapshots so it can be tested on its
//! own. Rules, in order:
//! - threads of other scopes pass through untouched;
//! - unlinked and mid-creation threads are preserved as they are;
//! - a linked thread found remotely is rebuilt from the remote comments,
//!   reusing local ids, with never-pushed local comments appended;
//! - local status changes and edits the tracker has not confirmed win over
//!   the remote copy;
//! - a linked thread missing remotely survives only while it holds unsynced
//!   comments, or when the listing was cut short by the page limit;
//! - remote issues nobody knows locally become new threads with ids derived
//!   from the issue id, so merging the same snapshot twice is a no-op.

use std::collections::{HashMap, HashSet};

use futures::future::{join_all, FutureExt};

use super::Engine;
use crate::threading;
use crate::tracker::{IssueListing, RemoteIssue};
use crate::types::{Comment, CommentId, RemoteId, Scope, SyncStatus, Thread, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotConfigured,
    /// A thread of this scope is waiting for its issue to be created.
    CreationInFlight,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Local threads refreshed from a remote issue.
    pub merged: usize,
    /// Remote issues that became new local threads.
    pub added: usize,
    /// Linked threads dropped because their issue is gone remotely.
    pub dropped: usize,
    /// Linked threads kept unchanged because a truncated listing could not
    /// vouch for their issue.
    pub unlisted: usize,
    /// Issues whose comments could not be fetched.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(MergeReport),
    Skipped(SkipReason),
    Failed(String),
}

/// One fetched issue with its comments already run through reply-tree
/// reconstruction, or the error that prevented fetching them.
#[derive(Debug, Clone)]
pub struct RemoteThread {
    pub issue: RemoteIssue,
    pub comments: Result<Vec<Comment>, String>,
}

impl Engine {
    /// Reconciles one scope against the tracker.
    ///
    /// A second caller for a scope with a pass already running awaits that
    /// pass's result. The pass itself runs on its own task, so dropping the
    /// returned future does not abort it.
    pub async fn reconcile(&self, scope: &Scope) -> ReconcileOutcome {
        let shared = {
            let mut running = super::lock(&self.inner.reconciles);
            if let Some(existing) = running.get(scope) {
                tracing::debug!(%scope, "joining reconcile already in flight");
                existing.clone()
            } else {
                let engine = self.clone();
                let key = scope.clone();
                let pass = async move {
                    let outcome = engine.run_reconcile(&key).await;
                    super::lock(&engine.inner.reconciles).remove(&key);
                    outcome
                }
                .boxed()
                .shared();
                running.insert(scope.clone(), pass.clone());
                self.spawn(pass.clone().map(|_| ()));
                pass
            }
        };
        shared.await
    }

    async fn run_reconcile(&self, scope: &Scope) -> ReconcileOutcome {
        let Some(tracker) = self.tracker() else {
            return ReconcileOutcome::Skipped(SkipReason::NotConfigured);
        };
        if self.state().creating_in_scope(scope) {
            tracing::debug!(%scope, "reconcile skipped: creation in flight");
            return ReconcileOutcome::Skipped(SkipReason::CreationInFlight);
        }

        tracing::debug!(%scope, "fetching remote issues");
        let IssueListing { issues, complete } = match tracker.fetch_issues_for_scope(scope).await {
            Ok(listing) => listing,
            Err(error) => {
                tracing::warn!(%scope, %error, "reconcile fetch failed");
                return ReconcileOutcome::Failed(error.to_string());
            }
        };
        let issues: Vec<RemoteIssue> = {
            let state = self.state();
            issues
                .into_iter()
                .filter(|issue| !state.tombstones.contains(&issue.id))
                .collect()
        };

        let fetched = join_all(issues.iter().map(|issue| tracker.fetch_comments(&issue.id))).await;
        let remote: Vec<RemoteThread> = issues
            .into_iter()
            .zip(fetched)
            .map(|(issue, comments)| RemoteThread {
                comments: comments
                    .map(|list| threading::comments_from_remote(&list))
                    .map_err(|error| {
                        tracing::warn!(issue = %issue.id, %error, "failed to fetch comments");
                        error.to_string()
                    }),
                issue,
            })
            .collect();

        let mut state = self.state();
        if state.creating_in_scope(scope) {
            tracing::debug!(%scope, "reconcile result discarded: creation started meanwhile");
            return ReconcileOutcome::Skipped(SkipReason::CreationInFlight);
        }
        let creating: HashSet<ThreadId> = state.creating.keys().cloned().collect();
        let (threads, report) = merge(&state.threads, scope, &remote, complete, &state.tombstones, &creating);
        state.threads = threads;
        self.commit(&state);
        tracing::info!(
            %scope,
            merged = report.merged,
            added = report.added,
            dropped = report.dropped,
            unlisted = report.unlisted,
            failed = report.failed,
            "reconciled"
        );
        ReconcileOutcome::Applied(report)
    }
}

/// Merges a scope's remote snapshot into `local`. Pure and idempotent.
///
/// `complete` is false when the snapshot came from a listing cut short by
/// the page limit; linked threads whose issue is absent are then kept.
pub fn merge(
    local: &[Thread],
    scope: &Scope,
    remote: &[RemoteThread],
    complete: bool,
    tombstones: &HashSet<RemoteId>,
    creating: &HashSet<ThreadId>,
) -> (Vec<Thread>, MergeReport) {
    let mut report = MergeReport::default();

    let mut by_issue: HashMap<&RemoteId, &RemoteThread> = HashMap::new();
    for candidate in remote {
        if tombstones.contains(&candidate.issue.id) || !candidate.issue.meta.matches(scope) {
            continue;
        }
        by_issue.entry(&candidate.issue.id).or_insert(candidate);
    }

    let mut seen: HashSet<RemoteId> = HashSet::new();
    let mut out = Vec::with_capacity(local.len() + remote.len());

    for thread in local {
        if &thread.scope != scope {
            out.push(thread.clone());
            continue;
        }
        let issue = match &thread.remote_issue_id {
            Some(issue) if !creating.contains(&thread.id) => issue,
            _ => {
                if let Some(issue) = &thread.remote_issue_id {
                    seen.insert(issue.clone());
                }
                out.push(thread.clone());
                continue;
            }
        };
        if tombstones.contains(issue) || !seen.insert(issue.clone()) {
            continue;
        }
        match by_issue.get(issue) {
            Some(candidate) => {
                if candidate.comments.is_err() {
                    report.failed += 1;
                }
                out.push(merge_thread(thread, candidate));
                report.merged += 1;
            }
            None if thread.has_pending_comments() => out.push(thread.clone()),
            None if !complete => {
                report.unlisted += 1;
                out.push(thread.clone());
            }
            None => report.dropped += 1,
        }
    }

    let known_locals: HashSet<&ThreadId> = out.iter().map(|t| &t.id).collect();
    let mut fresh = Vec::new();
    for candidate in remote {
        let issue = &candidate.issue;
        if !by_issue.contains_key(&issue.id) || seen.contains(&issue.id) {
            continue;
        }
        // Issue created for a local thread whose creation has not reported back.
        if issue.meta.thread.as_ref().is_some_and(|t| known_locals.contains(t)) {
            continue;
        }
        seen.insert(issue.id.clone());
        if candidate.comments.is_err() {
            report.failed += 1;
        }
        fresh.push(thread_from_remote(candidate));
        report.added += 1;
    }
    out.extend(fresh);

    (out, report)
}

fn merge_thread(local: &Thread, candidate: &RemoteThread) -> Thread {
    let mut merged = local.clone();
    merged.remote_issue_url = Some(candidate.issue.url.clone());

    let remote_comments = match &candidate.comments {
        Ok(comments) => comments,
        Err(message) => {
            merged.sync_status = SyncStatus::Error;
            merged.sync_error = Some(message.clone());
            return merged;
        }
    };
    if !local.unpushed_status {
        merged.status = candidate.issue.status;
    }

    let local_ids: HashMap<&RemoteId, &Comment> = local
        .comments
        .iter()
        .filter_map(|c| c.remote_id.as_ref().map(|r| (r, c)))
        .collect();

    let mut comments: Vec<Comment> = remote_comments
        .iter()
        .map(|rc| {
            let mut comment = rc.clone();
            if let Some(known) = rc.remote_id.as_ref().and_then(|r| local_ids.get(r)) {
                comment.id = known.id.clone();
                if comment.author.is_none() {
                    comment.author = known.author.clone();
                }
                if known.unpushed_edit {
                    comment.text = known.text.clone();
                    comment.unpushed_edit = true;
                }
            }
            comment
        })
        .collect();

    let id_for_remote: HashMap<RemoteId, CommentId> = comments
        .iter()
        .filter_map(|c| c.remote_id.clone().map(|r| (r, c.id.clone())))
        .collect();
    for comment in &mut comments {
        comment.parent_local_id = comment
            .parent_remote_id
            .as_ref()
            .and_then(|parent| id_for_remote.get(parent).cloned());
    }

    let remote_by_local: HashMap<CommentId, RemoteId> = comments
        .iter()
        .filter_map(|c| c.remote_id.clone().map(|r| (c.id.clone(), r)))
        .collect();
    for pending in local.pending_comments() {
        let mut pending = pending.clone();
        if let Some(parent_remote) = pending.parent_local_id.as_ref().and_then(|p| remote_by_local.get(p)) {
            pending.parent_remote_id = Some(parent_remote.clone());
        }
        comments.push(pending);
    }
    merged.comments = comments;

    if merged.has_pending_comments() || merged.has_unpushed_changes() {
        if merged.sync_status != SyncStatus::Error {
            merged.sync_status = SyncStatus::Pending;
        }
    } else {
        merged.sync_status = SyncStatus::Synced;
        merged.sync_error = None;
    }
    merged
}

fn thread_from_remote(candidate: &RemoteThread) -> Thread {
    let issue = &candidate.issue;
    let (comments, sync_status, sync_error) = match &candidate.comments {
        Ok(comments) => (comments.clone(), SyncStatus::Synced, None),
        Err(message) => (Vec::new(), SyncStatus::Error, Some(message.clone())),
    };
    Thread {
        id: ThreadId::for_remote_issue(&issue.id),
        anchor: issue.meta.anchor.clone(),
        scope: issue.meta.scope(),
        comments,
        remote_issue_id: Some(issue.id.clone()),
        remote_issue_url: Some(issue.url.clone()),
        sync_status,
        sync_error,
        status: issue.status,
        unpushed_status: false,
        created_at: issue.created_at,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::markers::IssueMeta;
    use crate::tracker::RemoteComment;
    use crate::types::{Anchor, ThreadStatus};

    fn scope() -> Scope {
        Scope::new("/pricing", "v1")
    }

    fn at(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid date") + Duration::seconds(seconds)
    }

    fn issue(id: &str, thread: Option<&str>) -> RemoteIssue {
        RemoteIssue {
            id: RemoteId::from(id),
            url: format!("https://tracker.test/issues/{id}"),
            title: format!("issue {id}"),
            status: ThreadStatus::Open,
            meta: IssueMeta {
                route: "/pricing".to_owned(),
                version: "v1".to_owned(),
                anchor: Anchor::position(0.1, 0.9),
                thread: thread.map(ThreadId::from),
            },
            created_at: at(0),
        }
    }

    fn remote(id: &str, comments: &[(&str, &str)]) -> RemoteThread {
        let raw: Vec<RemoteComment> = comments
            .iter()
            .enumerate()
            .map(|(n, (cid, body))| RemoteComment {
                id: RemoteId::from(*cid),
                author: Some("dev".to_owned()),
                body: (*body).to_owned(),
                created_at: at(n as i64 + 1),
            })
            .collect();
        RemoteThread {
            issue: issue(id, None),
            comments: Ok(threading::comments_from_remote(&raw)),
        }
    }

    fn local(id: &str, issue: Option<&str>, scope: Scope) -> Thread {
        Thread {
            id: ThreadId::from(id),
            anchor: Anchor::position(0.5, 0.5),
            scope,
            comments: Vec::new(),
            remote_issue_id: issue.map(RemoteId::from),
            remote_issue_url: None,
            sync_status: if issue.is_some() { SyncStatus::Synced } else { SyncStatus::Local },
            sync_error: None,
            status: ThreadStatus::Open,
            unpushed_status: false,
            created_at: at(0),
        }
    }

    fn pending(id: &str, seconds: i64, parent: Option<&str>) -> Comment {
        Comment {
            id: CommentId::from(id),
            author: None,
            text: id.to_owned(),
            created_at: at(seconds),
            remote_id: None,
            parent_local_id: parent.map(CommentId::from),
            parent_remote_id: None,
            unpushed_edit: false,
        }
    }

    fn none() -> HashSet<RemoteId> {
        HashSet::new()
    }

    #[test]
    fn merge_is_idempotent() {
        let mut linked = local("t1", Some("1"), scope());
        linked.comments.push(pending("draft", 50, None));
        let threads = vec![linked, local("unlinked", None, scope()), local("other", Some("9"), Scope::new("/", "v1"))];
        let snapshot = vec![remote("1", &[("10", "first"), ("11", "second")]), remote("2", &[("20", "hello")])];

        let (once, _) = merge(&threads, &scope(), &snapshot, true, &none(), &HashSet::new());
        let (twice, report) = merge(&once, &scope(), &snapshot, true, &none(), &HashSet::new());
        assert_eq!(once, twice);
        assert_eq!(report.added, 0);
    }

    #[test]
    fn merge_never_duplicates_an_issue() {
        let threads = vec![local("a", Some("1"), scope()), local("b", Some("1"), scope())];
        let snapshot = vec![remote("1", &[]), remote("1", &[])];
        let (merged, _) = merge(&threads, &scope(), &snapshot, true, &none(), &HashSet::new());
        let linked: Vec<_> = merged.iter().filter(|t| t.remote_issue_id == Some(RemoteId::from("1"))).collect();
        assert_eq!(linked.len(), 1);
    }

    #[test]
    fn remote_wins_and_local_pending_is_appended() {
        let mut thread = local("t1", Some("1"), scope());
        let mut known = pending("mine", 1, None);
        known.remote_id = Some(RemoteId::from("10"));
        known.text = "stale".to_owned();
        thread.comments.push(known);
        thread.comments.push(pending("draft", 99, Some("mine")));

        let snapshot = vec![remote("1", &[("10", "fresh"), ("11", "from someone else")])];
        let (merged, _) = merge(&[thread], &scope(), &snapshot, true, &none(), &HashSet::new());
        let t = &merged[0];
        let texts: Vec<&str> = t.comments.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["fresh", "from someone else", "draft"]);
        assert_eq!(t.comments[0].id, CommentId::from("mine"));
        assert_eq!(t.comments[2].parent_remote_id, Some(RemoteId::from("10")));
        assert_eq!(t.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn unlinked_creating_and_other_scope_threads_survive() {
        let mut creating_thread = local("c", Some("5"), scope());
        creating_thread.comments.clear();
        let threads = vec![
            local("u", None, scope()),
            creating_thread,
            local("o", Some("7"), Scope::new("/about", "v1")),
        ];
        let creating: HashSet<ThreadId> = [ThreadId::from("c")].into_iter().collect();
        let (merged, _) = merge(&threads, &scope(), &[], true, &none(), &creating);
        assert_eq!(merged, threads);
    }

    #[test]
    fn tombstoned_issues_are_not_materialized() {
        let tombstones: HashSet<RemoteId> = [RemoteId::from("3")].into_iter().collect();
        let (merged, report) = merge(&[], &scope(), &[remote("3", &[])], true, &tombstones, &HashSet::new());
        assert!(merged.is_empty());
        assert_eq!(report.added, 0);
    }

    #[test]
    fn issue_of_unreported_creation_is_not_duplicated() {
        let threads = vec![local("t-new", None, scope())];
        let mut candidate = remote("4", &[]);
        candidate.issue.meta.thread = Some(ThreadId::from("t-new"));
        let (merged, _) = merge(&threads, &scope(), &[candidate], true, &none(), &HashSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].remote_issue_id, None);
    }

    #[test]
    fn vanished_issue_keeps_thread_only_with_unsynced_comments() {
        let mut with_draft = local("keep", Some("1"), scope());
        with_draft.comments.push(pending("draft", 1, None));
        let threads = vec![with_draft, local("drop", Some("2"), scope())];
        let (merged, report) = merge(&threads, &scope(), &[], true, &none(), &HashSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, ThreadId::from("keep"));
        assert_eq!(report.dropped, 1);
    }

    #[test]
    fn failed_comment_fetch_keeps_local_comments_and_records_error() {
        let mut thread = local("t1", Some("1"), scope());
        let mut durable = pending("c", 1, None);
        durable.remote_id = Some(RemoteId::from("10"));
        thread.comments.push(durable);
        let candidate = RemoteThread {
            issue: issue("1", None),
            comments: Err("boom".to_owned()),
        };
        let (merged, report) = merge(&[thread.clone()], &scope(), &[candidate], true, &none(), &HashSet::new());
        assert_eq!(merged[0].comments, thread.comments);
        assert_eq!(merged[0].sync_status, SyncStatus::Error);
        assert_eq!(merged[0].sync_error.as_deref(), Some("boom"));
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn remote_status_wins() {
        let thread = local("t1", Some("1"), scope());
        let mut candidate = remote("1", &[]);
        candidate.issue.status = ThreadStatus::Closed;
        let (merged, _) = merge(&[thread], &scope(), &[candidate], true, &none(), &HashSet::new());
        assert_eq!(merged[0].status, ThreadStatus::Closed);
    }

    #[test]
    fn unconfirmed_status_survives_until_pushed() {
        let mut thread = local("t1", Some("1"), scope());
        thread.status = ThreadStatus::Closed;
        thread.unpushed_status = true;
        thread.sync_status = SyncStatus::Error;
        thread.sync_error = Some("503".to_owned());

        let (merged, _) = merge(&[thread], &scope(), &[remote("1", &[])], true, &none(), &HashSet::new());
        assert_eq!(merged[0].status, ThreadStatus::Closed);
        assert!(merged[0].unpushed_status);
        assert_eq!(merged[0].sync_status, SyncStatus::Error);
        assert_eq!(merged[0].sync_error.as_deref(), Some("503"));
    }

    #[test]
    fn unconfirmed_edit_keeps_local_text() {
        let mut thread = local("t1", Some("1"), scope());
        let mut edited = pending("mine", 1, None);
        edited.remote_id = Some(RemoteId::from("10"));
        edited.text = "user edit".to_owned();
        edited.unpushed_edit = true;
        thread.comments.push(edited);
        thread.sync_status = SyncStatus::Error;

        let snapshot = vec![remote("1", &[("10", "original"), ("11", "reply")])];
        let (merged, _) = merge(&[thread], &scope(), &snapshot, true, &none(), &HashSet::new());
        let t = &merged[0];
        assert_eq!(t.comments[0].text, "user edit");
        assert!(t.comments[0].unpushed_edit);
        assert_eq!(t.comments[1].text, "reply");
        assert_eq!(t.sync_status, SyncStatus::Error);
    }

    #[test]
    fn truncated_listing_keeps_unlisted_threads() {
        let threads = vec![local("seen", Some("1"), scope()), local("beyond", Some("101"), scope())];
        let (merged, report) = merge(&threads, &scope(), &[remote("1", &[])], false, &none(), &HashSet::new());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], threads[1]);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.unlisted, 1);
    }

    #[test]
    fn new_remote_threads_get_deterministic_ids() {
        let (merged, report) = merge(&[], &scope(), &[remote("8", &[("80", "hi")])], true, &none(), &HashSet::new());
        assert_eq!(report.added, 1);
        assert_eq!(merged[0].id, ThreadId::from("remote-8"));
        assert_eq!(merged[0].comments[0].id, CommentId::from("remote-80"));
        assert_eq!(merged[0].sync_status, SyncStatus::Synced);
    }
}
