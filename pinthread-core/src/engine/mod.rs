//! The comment synchronization engine.
//!
//! All thread data lives in one owned aggregate behind a `std::sync::Mutex`
//! that is never held across an `.await`. Every mutation applies locally
//! first, is mirrored to the [`LocalStore`], bumps the revision channel and
//! only then spawns its remote side effect as a tracked tokio task.
//!
//! Exclusivity rules:
//! - one remote-creation (and comment push) at a time per thread, through a
//!   per-thread `tokio::sync::Mutex`;
//! - one reconciliation pass at a time per scope, through a shared future
//!   that later callers await instead of starting their own fetch.

mod backfill;
mod reconcile;
mod retry;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::markers::{self, ISSUE_LABEL};
use crate::store::LocalStore;
use crate::tracker::IssueTracker;
use crate::types::{
    Anchor, Comment, CommentId, RemoteId, Scope, SyncStatus, Thread, ThreadId, ThreadStatus,
};

pub use reconcile::{merge, MergeReport, ReconcileOutcome, RemoteThread, SkipReason};
pub use retry::{Backoff, RetryReport};

/// Result of a single remote step driven by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// No tracker is configured; nothing was attempted.
    Skipped,
    /// The tracker call failed. The message is also stored on the thread.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Author recorded on locally created comments.
    pub author: Option<String>,
    /// Labels attached to every issue the engine creates.
    pub labels: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            author: None,
            labels: vec![ISSUE_LABEL.to_owned()],
        }
    }
}

#[derive(Default)]
struct EngineState {
    threads: Vec<Thread>,
    tombstones: HashSet<RemoteId>,
    /// Threads removed while their issue was still being created.
    pending_tombstones: HashSet<ThreadId>,
    /// Threads with a `create_issue` call in flight, with the scope they were
    /// created in. Entries outlive a pin removed mid-creation.
    creating: HashMap<ThreadId, Scope>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl EngineState {
    fn position(&self, id: &ThreadId) -> Result<usize, EngineError> {
        self.threads
            .iter()
            .position(|t| &t.id == id)
            .ok_or_else(|| EngineError::UnknownThread(id.clone()))
    }

    fn thread(&self, id: &ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| &t.id == id)
    }

    fn thread_mut(&mut self, id: &ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| &t.id == id)
    }

    /// `now`, bumped by a microsecond when the clock has not moved past the
    /// last timestamp handed out.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(next);
        next
    }

    fn creating_in_scope(&self, scope: &Scope) -> bool {
        self.creating.values().any(|s| s == scope)
    }
}

type SharedReconcile = Shared<BoxFuture<'static, ReconcileOutcome>>;

struct EngineInner {
    state: Mutex<EngineState>,
    store: Arc<dyn LocalStore>,
    tracker: RwLock<Option<Arc<dyn IssueTracker>>>,
    config: EngineConfig,
    thread_locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
    reconciles: Mutex<HashMap<Scope, SharedReconcile>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    revision: watch::Sender<u64>,
}

/// Handle to the engine. Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    /// Builds the engine, reading the store exactly once.
    pub fn new(
        store: Arc<dyn LocalStore>,
        tracker: Option<Arc<dyn IssueTracker>>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let threads = store.load()?;
        let tombstones: HashSet<RemoteId> = store.load_tombstones()?.into_iter().collect();
        let last_timestamp = threads
            .iter()
            .flat_map(|t| std::iter::once(t.created_at).chain(t.comments.iter().map(|c| c.created_at)))
            .max();
        tracing::info!(
            threads = threads.len(),
            tombstones = tombstones.len(),
            configured = tracker.is_some(),
            "sync engine ready"
        );
        let (revision, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    threads,
                    tombstones,
                    last_timestamp,
                    ..EngineState::default()
                }),
                store,
                tracker: RwLock::new(tracker),
                config,
                thread_locks: Mutex::new(HashMap::new()),
                reconciles: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                revision,
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn threads(&self) -> Vec<Thread> {
        self.state().threads.clone()
    }

    pub fn threads_for_scope(&self, scope: &Scope) -> Vec<Thread> {
        self.state()
            .threads
            .iter()
            .filter(|t| &t.scope == scope)
            .cloned()
            .collect()
    }

    pub fn thread(&self, id: &ThreadId) -> Option<Thread> {
        self.state().thread(id).cloned()
    }

    pub fn tombstones(&self) -> Vec<RemoteId> {
        let mut ids: Vec<RemoteId> = self.state().tombstones.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_configured(&self) -> bool {
        self.tracker().is_some()
    }

    /// Swaps the tracker, e.g. once credentials become available. Threads
    /// left behind while unconfigured are picked up by [`Engine::retry_all`].
    pub fn set_tracker(&self, tracker: Option<Arc<dyn IssueTracker>>) {
        let mut slot = self
            .inner
            .tracker
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = tracker;
    }

    /// Revision counter bumped after every state transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }

    /// Waits until every spawned remote task (including ones spawned while
    /// waiting) has finished.
    pub async fn settle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.tasks));
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(error) = handle.await {
                    tracing::error!(%error, "sync task panicked");
                }
            }
        }
    }

    // ── Mutation API ─────────────────────────────────────────────────────

    /// Drops a new pin. The thread exists locally at once; its remote issue
    /// is created in the background when a tracker is configured.
    pub fn create_thread(&self, anchor: Anchor, scope: Scope) -> ThreadId {
        let configured = self.is_configured();
        let id = ThreadId::generate();
        {
            let mut state = self.state();
            let created_at = state.next_timestamp();
            state.threads.push(Thread {
                id: id.clone(),
                anchor,
                scope,
                comments: Vec::new(),
                remote_issue_id: None,
                remote_issue_url: None,
                sync_status: if configured { SyncStatus::Syncing } else { SyncStatus::Local },
                sync_error: None,
                status: ThreadStatus::Open,
                unpushed_status: false,
                created_at,
            });
            self.commit(&state);
        }
        if configured {
            self.spawn_backfill(id.clone());
        }
        id
    }

    /// Appends a comment optimistically and schedules its push.
    ///
    /// Goes straight to a single comment push when the issue exists and the
    /// parent (if any) is durable; otherwise runs the backfill procedure.
    pub fn add_comment(
        &self,
        thread_id: &ThreadId,
        text: impl Into<String>,
        parent: Option<&CommentId>,
    ) -> Result<CommentId, EngineError> {
        let configured = self.is_configured();
        let id = CommentId::generate();
        let direct = {
            let mut state = self.state();
            let idx = state.position(thread_id)?;
            let parent_remote_id = match parent {
                Some(parent_id) => {
                    let parent = state.threads[idx].comment(parent_id).ok_or_else(|| EngineError::UnknownParent {
                        thread: thread_id.clone(),
                        parent: parent_id.clone(),
                    })?;
                    Some(parent.remote_id.clone())
                }
                None => None,
            };
            let created_at = state.next_timestamp();
            let thread = &mut state.threads[idx];
            let direct = thread.remote_issue_id.is_some() && parent_remote_id.as_ref().is_none_or(Option::is_some);
            thread.comments.push(Comment {
                id: id.clone(),
                author: self.inner.config.author.clone(),
                text: text.into(),
                created_at,
                remote_id: None,
                parent_local_id: parent.cloned(),
                parent_remote_id: parent_remote_id.flatten(),
                unpushed_edit: false,
            });
            if configured {
                thread.sync_status = SyncStatus::Syncing;
            }
            self.commit(&state);
            direct
        };

        if configured {
            let engine = self.clone();
            let thread_id = thread_id.clone();
            let comment_id = id.clone();
            if direct {
                self.spawn(async move {
                    engine.push_single(&thread_id, &comment_id).await;
                });
            } else {
                self.spawn(async move {
                    engine.backfill(&thread_id).await;
                });
            }
        }
        Ok(id)
    }

    /// Replaces a comment's text. Durable comments are updated remotely;
    /// comments whose push is in flight get a follow-up update once it lands.
    pub fn edit_comment(
        &self,
        thread_id: &ThreadId,
        comment_id: &CommentId,
        text: impl Into<String>,
    ) -> Result<(), EngineError> {
        let remote = {
            let mut state = self.state();
            let idx = state.position(thread_id)?;
            let comment = state.threads[idx]
                .comment_mut(comment_id)
                .ok_or_else(|| EngineError::UnknownComment {
                    thread: thread_id.clone(),
                    comment: comment_id.clone(),
                })?;
            comment.text = text.into();
            comment.unpushed_edit = comment.is_durable();
            let remote = comment.remote_id.clone().map(|id| {
                let body = markers::encode_reply(&comment.text, comment.parent_remote_id.as_ref());
                (id, body, comment.text.clone())
            });
            self.commit(&state);
            remote
        };

        if let (Some((remote_id, body, pushed_text)), Some(tracker)) = (remote, self.tracker()) {
            let engine = self.clone();
            let thread_id = thread_id.clone();
            let comment_id = comment_id.clone();
            self.spawn(async move {
                tracing::debug!(thread = %thread_id, comment = %remote_id, "updating remote comment");
                match tracker.update_comment(&remote_id, &body).await {
                    Ok(()) => engine.confirm_edit(&thread_id, &comment_id, &pushed_text),
                    Err(error) => engine.record_failure(&thread_id, &error.to_string()),
                }
            });
        }
        Ok(())
    }

    /// Removes a comment locally. If the remote delete fails the comment is
    /// put back where it was and the thread records the error.
    pub fn delete_comment(&self, thread_id: &ThreadId, comment_id: &CommentId) -> Result<(), EngineError> {
        let (position, removed) = {
            let mut state = self.state();
            let idx = state.position(thread_id)?;
            let thread = &mut state.threads[idx];
            let position = thread
                .comments
                .iter()
                .position(|c| &c.id == comment_id)
                .ok_or_else(|| EngineError::UnknownComment {
                    thread: thread_id.clone(),
                    comment: comment_id.clone(),
                })?;
            let removed = thread.comments.remove(position);
            if thread.remote_issue_id.is_some() && !thread.has_pending_comments() && thread.sync_status == SyncStatus::Pending {
                thread.sync_status = SyncStatus::Synced;
            }
            self.commit(&state);
            (position, removed)
        };

        if let (Some(remote_id), Some(tracker)) = (removed.remote_id.clone(), self.tracker()) {
            let engine = self.clone();
            let thread_id = thread_id.clone();
            self.spawn(async move {
                tracing::debug!(thread = %thread_id, comment = %remote_id, "deleting remote comment");
                if let Err(error) = tracker.delete_comment(&remote_id).await {
                    engine.restore_comment(&thread_id, position, removed, &error.to_string());
                }
            });
        }
        Ok(())
    }

    pub fn close_thread(&self, thread_id: &ThreadId) -> Result<(), EngineError> {
        self.set_thread_status(thread_id, ThreadStatus::Closed)
    }

    pub fn reopen_thread(&self, thread_id: &ThreadId) -> Result<(), EngineError> {
        self.set_thread_status(thread_id, ThreadStatus::Open)
    }

    /// Deletes the thread locally. A known remote issue is tombstoned and
    /// closed; an issue still being created is tombstoned by the creation
    /// handler once its id arrives.
    pub fn remove_pin(&self, thread_id: &ThreadId) -> Result<(), EngineError> {
        let issue = {
            let mut state = self.state();
            let idx = state.position(thread_id)?;
            let thread = state.threads.remove(idx);
            let issue = match thread.remote_issue_id {
                Some(issue) => {
                    state.tombstones.insert(issue.clone());
                    self.persist_tombstone(&issue);
                    Some(issue)
                }
                None => {
                    if state.creating.contains_key(thread_id) {
                        state.pending_tombstones.insert(thread_id.clone());
                    }
                    None
                }
            };
            self.commit(&state);
            issue
        };
        lock(&self.inner.thread_locks).remove(thread_id);

        if let (Some(issue), Some(tracker)) = (issue, self.tracker()) {
            self.spawn(async move {
                tracing::debug!(issue = %issue, "closing issue of removed pin");
                if let Err(error) = tracker.close_issue(&issue).await {
                    tracing::warn!(issue = %issue, %error, "failed to close issue of removed pin");
                }
            });
        }
        Ok(())
    }

    fn set_thread_status(&self, thread_id: &ThreadId, status: ThreadStatus) -> Result<(), EngineError> {
        let issue = {
            let mut state = self.state();
            let idx = state.position(thread_id)?;
            let thread = &mut state.threads[idx];
            if thread.status == status {
                return Ok(());
            }
            thread.status = status;
            thread.unpushed_status = thread.remote_issue_id.is_some();
            let issue = thread.remote_issue_id.clone();
            self.commit(&state);
            issue
        };

        if let (Some(issue), Some(tracker)) = (issue, self.tracker()) {
            let engine = self.clone();
            let thread_id = thread_id.clone();
            self.spawn(async move {
                match push_status(tracker.as_ref(), &issue, status).await {
                    Ok(()) => engine.confirm_status(&thread_id, status),
                    Err(error) => engine.record_failure(&thread_id, &error.to_string()),
                }
            });
        }
        Ok(())
    }

    // ── Internals shared by the sync procedures ──────────────────────────

    fn state(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.inner.state)
    }

    pub(crate) fn tracker(&self) -> Option<Arc<dyn IssueTracker>> {
        self.inner
            .tracker
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn thread_lock(&self, id: &ThreadId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.thread_locks)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    /// Mirrors the collection to the store and notifies subscribers.
    fn commit(&self, state: &EngineState) {
        if let Err(error) = self.inner.store.save(&state.threads) {
            tracing::error!(%error, "failed to persist threads");
        }
        self.inner.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn persist_tombstone(&self, issue: &RemoteId) {
        if let Err(error) = self.inner.store.save_tombstones(std::slice::from_ref(issue)) {
            tracing::error!(%error, issue = %issue, "failed to persist tombstone");
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(future);
                let mut tasks = lock(&self.inner.tasks);
                tasks.retain(|task| !task.is_finished());
                tasks.push(handle);
            }
            Err(_) => tracing::warn!("no async runtime available; remote work left for the next retry pass"),
        }
    }

    fn spawn_backfill(&self, thread_id: ThreadId) {
        let engine = self.clone();
        self.spawn(async move {
            engine.backfill(&thread_id).await;
        });
    }

    fn record_failure(&self, thread_id: &ThreadId, message: &str) {
        tracing::warn!(thread = %thread_id, error = message, "remote sync failed");
        let mut state = self.state();
        if let Some(thread) = state.thread_mut(thread_id) {
            thread.sync_status = SyncStatus::Error;
            thread.sync_error = Some(message.to_owned());
            self.commit(&state);
        }
    }

    /// Marks a thread `Synced` once nothing about it is left to push.
    fn mark_synced_if_durable(&self, thread_id: &ThreadId) {
        let mut state = self.state();
        if let Some(thread) = state.thread_mut(thread_id) {
            let waiting = matches!(thread.sync_status, SyncStatus::Error | SyncStatus::Pending);
            if waiting && thread.is_fully_durable() {
                thread.sync_status = SyncStatus::Synced;
                thread.sync_error = None;
                self.commit(&state);
            }
        }
    }

    /// Clears `unpushed_status` when the tracker now holds the current status.
    /// A status flipped again while the push was in flight stays unpushed.
    fn confirm_status(&self, thread_id: &ThreadId, pushed: ThreadStatus) {
        {
            let mut state = self.state();
            let confirmed = match state.thread_mut(thread_id) {
                Some(thread) if thread.unpushed_status && thread.status == pushed => {
                    thread.unpushed_status = false;
                    true
                }
                _ => false,
            };
            if confirmed {
                self.commit(&state);
            }
        }
        self.mark_synced_if_durable(thread_id);
    }

    /// Clears `unpushed_edit` when the tracker now holds the current text.
    fn confirm_edit(&self, thread_id: &ThreadId, comment_id: &CommentId, pushed_text: &str) {
        {
            let mut state = self.state();
            let confirmed = match state.thread_mut(thread_id).and_then(|t| t.comment_mut(comment_id)) {
                Some(comment) if comment.unpushed_edit && comment.text == pushed_text => {
                    comment.unpushed_edit = false;
                    true
                }
                _ => false,
            };
            if confirmed {
                self.commit(&state);
            }
        }
        self.mark_synced_if_durable(thread_id);
    }

    fn restore_comment(&self, thread_id: &ThreadId, position: usize, comment: Comment, message: &str) {
        tracing::warn!(thread = %thread_id, comment = %comment.id, error = message, "remote delete failed; restoring comment");
        let mut state = self.state();
        let Some(thread) = state.thread_mut(thread_id) else {
            return;
        };
        if thread.comment(&comment.id).is_none() {
            let at = position.min(thread.comments.len());
            thread.comments.insert(at, comment);
        }
        thread.sync_status = SyncStatus::Error;
        thread.sync_error = Some(message.to_owned());
        self.commit(&state);
    }
}

async fn push_status(
    tracker: &dyn IssueTracker,
    issue: &RemoteId,
    status: ThreadStatus,
) -> Result<(), crate::error::TrackerError> {
    tracing::debug!(issue = %issue, ?status, "pushing thread status");
    match status {
        ThreadStatus::Closed => tracker.close_issue(issue).await,
        ThreadStatus::Open => tracker.reopen_issue(issue).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn engine() -> Engine {
        Engine::new(Arc::new(MemoryStore::new()), None, EngineConfig::default()).expect("engine")
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut state = EngineState::default();
        let mut last = state.next_timestamp();
        for _ in 0..1000 {
            let next = state.next_timestamp();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn unconfigured_thread_is_local_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone(), None, EngineConfig::default()).expect("engine");
        let id = engine.create_thread(Anchor::position(0.2, 0.4), Scope::new("/", "v1"));
        let thread = engine.thread(&id).expect("thread");
        assert_eq!(thread.sync_status, SyncStatus::Local);
        assert_eq!(store.saved_threads().len(), 1);
    }

    #[test]
    fn unknown_ids_fail_fast() {
        let engine = engine();
        let missing = ThreadId::from("nope");
        assert!(matches!(
            engine.add_comment(&missing, "x", None),
            Err(EngineError::UnknownThread(_))
        ));

        let id = engine.create_thread(Anchor::position(0.0, 0.0), Scope::new("/", "v1"));
        assert!(matches!(
            engine.add_comment(&id, "x", Some(&CommentId::from("ghost"))),
            Err(EngineError::UnknownParent { .. })
        ));
        assert!(matches!(
            engine.edit_comment(&id, &CommentId::from("ghost"), "y"),
            Err(EngineError::UnknownComment { .. })
        ));
        assert!(matches!(
            engine.delete_comment(&id, &CommentId::from("ghost")),
            Err(EngineError::UnknownComment { .. })
        ));
    }

    #[test]
    fn revision_bumps_on_every_mutation() {
        let engine = engine();
        let rx = engine.subscribe();
        let before = *rx.borrow();
        let id = engine.create_thread(Anchor::position(0.0, 0.0), Scope::new("/", "v1"));
        engine.add_comment(&id, "hi", None).expect("comment");
        engine.close_thread(&id).expect("close");
        assert_eq!(*rx.borrow(), before + 3);
    }
}
