//! Central UI state for the board.
//!
//! `AppState` holds a snapshot of the active scope's threads plus everything
//! the board needs to draw them: selection, scroll offsets, the compose
//! buffer and the auto-retry schedule. It never talks to the engine itself;
//! key handling turns input into a [`Command`] that `command::execute` runs.

use std::time::{Duration, Instant};

use pinthread_core::engine::{Backoff, ReconcileOutcome, SkipReason};
use pinthread_core::threading;
use pinthread_core::types::{Anchor, Comment, CommentId, Scope, SyncStatus, Thread, ThreadId};
use ratatui::layout::Rect;
use ratatui::widgets::ListState;

use crate::event::SyncResult;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Normal,
    /// Typing into the compose box.
    Insert,
    HelpOverlay,
    /// Asking before a pin is removed.
    ConfirmRemove,
}

/// Which panel receives navigation keys. `H` / `L` toggle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PanelFocus {
    #[default]
    Threads,
    Comments,
}

impl PanelFocus {
    pub fn toggle(self) -> Self {
        match self {
            PanelFocus::Threads => PanelFocus::Comments,
            PanelFocus::Comments => PanelFocus::Threads,
        }
    }
}

/// What the compose box is writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeTarget {
    /// An anchor for a new pin: `x,y` or a selector.
    NewPin,
    Comment { thread: ThreadId },
    Reply { thread: ThreadId, parent: CommentId },
    Edit { thread: ThreadId, comment: CommentId },
    /// `route@version`.
    Scope,
}

impl ComposeTarget {
    pub fn prompt(&self) -> &'static str {
        match self {
            ComposeTarget::NewPin => "New pin (x,y or selector)",
            ComposeTarget::Comment { .. } => "Comment",
            ComposeTarget::Reply { .. } => "Reply",
            ComposeTarget::Edit { .. } => "Edit comment",
            ComposeTarget::Scope => "Scope (route@version)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compose {
    pub target: ComposeTarget,
    pub buffer: String,
}

/// An engine operation requested from the board.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreatePin(Anchor),
    AddComment { thread: ThreadId, text: String, parent: Option<CommentId> },
    EditComment { thread: ThreadId, comment: CommentId, text: String },
    DeleteComment { thread: ThreadId, comment: CommentId },
    CloseThread(ThreadId),
    ReopenThread(ThreadId),
    RemovePin(ThreadId),
    SwitchScope(Scope),
    Reconcile,
    RetryAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub text: String,
    pub is_error: bool,
}

pub struct AppState {
    pub mode: Mode,
    pub focus: PanelFocus,
    pub scope: Scope,
    /// Threads of `scope`, oldest first.
    pub threads: Vec<Thread>,
    pub thread_list_state: ListState,
    /// Index into [`AppState::comment_rows`] of the selected comment.
    pub comment_cursor: usize,
    pub comments_scroll: u16,
    pub help_scroll: u16,

    /// Inner heights cached by the renderer for page scrolling.
    pub threads_viewport_height: u16,
    pub comments_viewport_height: u16,
    /// Outer rects of `[threads, comments]`, cached for click-to-focus.
    pub panel_rects: [Rect; 2],

    pub compose: Option<Compose>,
    pub status: Option<StatusLine>,

    /// A tracker is configured; remote commands are meaningful.
    pub configured: bool,
    /// A reconcile or retry pass started from the board is still running.
    pub sync_in_flight: bool,
    pub auto_retry: bool,
    pub backoff: Backoff,
    pub next_retry: Option<Instant>,
}

impl AppState {
    pub fn new(scope: Scope, configured: bool, auto_retry: bool, backoff: Backoff) -> Self {
        Self {
            mode: Mode::default(),
            focus: PanelFocus::default(),
            scope,
            threads: Vec::new(),
            thread_list_state: ListState::default(),
            comment_cursor: 0,
            comments_scroll: 0,
            help_scroll: 0,
            threads_viewport_height: 0,
            comments_viewport_height: 0,
            panel_rects: [Rect::default(); 2],
            compose: None,
            status: None,
            configured,
            sync_in_flight: false,
            auto_retry,
            backoff,
            next_retry: None,
        }
    }

    // ── Snapshot ─────────────────────────────────────────────────────────

    /// Replaces the thread snapshot, keeping the selection on the same
    /// thread (and comment) when it still exists.
    pub fn set_threads(&mut self, mut threads: Vec<Thread>) {
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let selected_thread = self.selected_thread().map(|t| t.id.clone());
        let selected_comment = self.selected_comment().map(|c| c.id.clone());
        self.threads = threads;

        let index = selected_thread
            .and_then(|id| self.threads.iter().position(|t| t.id == id))
            .or_else(|| (!self.threads.is_empty()).then_some(0));
        let thread_changed = index != self.thread_list_state.selected();
        self.thread_list_state.select(index);

        let rows: Vec<CommentId> = self.comment_rows().iter().map(|(_, c)| c.id.clone()).collect();
        self.comment_cursor = selected_comment
            .and_then(|id| rows.iter().position(|r| *r == id))
            .unwrap_or(if thread_changed { 0 } else { self.comment_cursor });
        self.clamp_comment_cursor();
    }

    pub fn selected_thread(&self) -> Option<&Thread> {
        self.thread_list_state.selected().and_then(|i| self.threads.get(i))
    }

    /// The selected thread's comments as `(depth, comment)` display rows.
    pub fn comment_rows(&self) -> Vec<(usize, &Comment)> {
        match self.selected_thread() {
            Some(thread) => threading::flatten(&threading::build_tree(&thread.comments)),
            None => Vec::new(),
        }
    }

    pub fn selected_comment(&self) -> Option<&Comment> {
        self.comment_rows().get(self.comment_cursor).map(|(_, c)| *c)
    }

    pub fn has_errors(&self) -> bool {
        self.threads.iter().any(|t| t.sync_status == SyncStatus::Error)
    }

    // ── Navigation ───────────────────────────────────────────────────────

    pub fn select_next_thread(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        let next = self
            .thread_list_state
            .selected()
            .map_or(0, |i| (i + 1).min(self.threads.len() - 1));
        self.select_thread(next);
    }

    pub fn select_prev_thread(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        let prev = self.thread_list_state.selected().map_or(0, |i| i.saturating_sub(1));
        self.select_thread(prev);
    }

    pub fn select_first_thread(&mut self) {
        if !self.threads.is_empty() {
            self.select_thread(0);
        }
    }

    pub fn select_last_thread(&mut self) {
        if !self.threads.is_empty() {
            self.select_thread(self.threads.len() - 1);
        }
    }

    pub fn select_thread_id(&mut self, id: &ThreadId) {
        if let Some(index) = self.threads.iter().position(|t| &t.id == id) {
            self.select_thread(index);
        }
    }

    fn select_thread(&mut self, index: usize) {
        if self.thread_list_state.selected() != Some(index) {
            self.thread_list_state.select(Some(index));
            self.comment_cursor = 0;
            self.comments_scroll = 0;
        }
    }

    pub fn next_comment(&mut self) {
        self.comment_cursor = self.comment_cursor.saturating_add(1);
        self.clamp_comment_cursor();
    }

    pub fn prev_comment(&mut self) {
        self.comment_cursor = self.comment_cursor.saturating_sub(1);
    }

    fn clamp_comment_cursor(&mut self) {
        let rows = self.comment_rows().len();
        self.comment_cursor = self.comment_cursor.min(rows.saturating_sub(1));
    }

    /// Moves the focused panel's selection down by `lines` rows.
    pub fn scroll_down(&mut self, lines: u16) {
        for _ in 0..lines {
            match self.focus {
                PanelFocus::Threads => self.select_next_thread(),
                PanelFocus::Comments => self.next_comment(),
            }
        }
    }

    pub fn scroll_up(&mut self, lines: u16) {
        for _ in 0..lines {
            match self.focus {
                PanelFocus::Threads => self.select_prev_thread(),
                PanelFocus::Comments => self.prev_comment(),
            }
        }
    }

    pub fn scroll_top(&mut self) {
        match self.focus {
            PanelFocus::Threads => self.select_first_thread(),
            PanelFocus::Comments => self.comment_cursor = 0,
        }
    }

    pub fn scroll_bottom(&mut self) {
        match self.focus {
            PanelFocus::Threads => self.select_last_thread(),
            PanelFocus::Comments => {
                self.comment_cursor = usize::MAX;
                self.clamp_comment_cursor();
            }
        }
    }

    /// Half of the focused panel's cached height, at least one row.
    pub fn half_page(&self) -> u16 {
        let height = match self.focus {
            PanelFocus::Threads => self.threads_viewport_height,
            PanelFocus::Comments => self.comments_viewport_height,
        };
        (height / 2).max(1)
    }

    // ── Compose box ──────────────────────────────────────────────────────

    pub fn begin_compose(&mut self, target: ComposeTarget, initial: impl Into<String>) {
        self.compose = Some(Compose {
            target,
            buffer: initial.into(),
        });
        self.mode = Mode::Insert;
    }

    pub fn cancel_compose(&mut self) {
        self.compose = None;
        self.mode = Mode::Normal;
    }

    pub fn compose_push(&mut self, ch: char) {
        if let Some(compose) = &mut self.compose {
            compose.buffer.push(ch);
        }
    }

    pub fn compose_backspace(&mut self) {
        if let Some(compose) = &mut self.compose {
            compose.buffer.pop();
        }
    }

    /// Closes the compose box and turns its contents into a command.
    ///
    /// Blank input yields nothing. Unparseable input keeps the box open and
    /// reports the problem on the status line.
    pub fn submit_compose(&mut self) -> Option<Command> {
        let compose = self.compose.take()?;
        let text = compose.buffer.trim().to_owned();
        self.mode = Mode::Normal;
        if text.is_empty() {
            return None;
        }
        let command = match compose.target {
            ComposeTarget::NewPin => match parse_anchor(&text) {
                Some(anchor) => Command::CreatePin(anchor),
                None => {
                    self.set_error("anchor must be `x,y` or a selector");
                    self.compose = Some(Compose {
                        target: ComposeTarget::NewPin,
                        buffer: compose.buffer,
                    });
                    self.mode = Mode::Insert;
                    return None;
                }
            },
            ComposeTarget::Comment { thread } => Command::AddComment {
                thread,
                text,
                parent: None,
            },
            ComposeTarget::Reply { thread, parent } => Command::AddComment {
                thread,
                text,
                parent: Some(parent),
            },
            ComposeTarget::Edit { thread, comment } => Command::EditComment { thread, comment, text },
            ComposeTarget::Scope => Command::SwitchScope(parse_scope(&text, &self.scope)),
        };
        Some(command)
    }

    // ── Status and sync bookkeeping ──────────────────────────────────────

    pub fn set_info(&mut self, text: impl Into<String>) {
        self.status = Some(StatusLine {
            text: text.into(),
            is_error: false,
        });
    }

    pub fn set_error(&mut self, text: impl Into<String>) {
        self.status = Some(StatusLine {
            text: text.into(),
            is_error: true,
        });
    }

    /// Records the outcome of a background pass and reschedules the
    /// automatic retry: a clean pass resets the backoff, a failing one
    /// pushes the next attempt further out.
    pub fn apply_sync_result(&mut self, result: SyncResult, now: Instant) {
        self.sync_in_flight = false;
        match result {
            SyncResult::Reconciled { scope, outcome } => match outcome {
                ReconcileOutcome::Applied(report) => self.set_info(format!(
                    "{scope}: {} merged, {} new, {} dropped{}",
                    report.merged,
                    report.added,
                    report.dropped,
                    if report.failed > 0 {
                        format!(", {} failed", report.failed)
                    } else {
                        String::new()
                    }
                )),
                ReconcileOutcome::Skipped(SkipReason::NotConfigured) => {
                    self.set_info("no tracker configured; working locally")
                }
                ReconcileOutcome::Skipped(SkipReason::CreationInFlight) => {
                    self.set_info("sync deferred: a pin is still being created")
                }
                ReconcileOutcome::Failed(message) => self.set_error(format!("sync failed: {message}")),
            },
            SyncResult::Retried(report) => {
                if report.is_clean() {
                    self.backoff.reset();
                    self.next_retry = None;
                    if report.attempted > 0 {
                        self.set_info(format!("retry: {} of {} synced", report.synced, report.attempted));
                    }
                } else {
                    let delay = self.backoff.next_delay();
                    self.next_retry = self.auto_retry.then(|| now + delay);
                    self.set_error(format!(
                        "retry: {} failed, next attempt in {}s",
                        report.failed,
                        delay.as_secs()
                    ));
                }
            }
        }
    }

    /// Arms the retry timer when a thread is in error and none is armed.
    pub fn schedule_retry_if_needed(&mut self, now: Instant) {
        if self.auto_retry && self.configured && self.next_retry.is_none() && self.has_errors() {
            self.next_retry = Some(now + self.backoff.next_delay());
        }
    }

    /// `true` when the armed retry timer has expired and no pass is running.
    /// Disarms the timer.
    pub fn take_due_retry(&mut self, now: Instant) -> bool {
        match self.next_retry {
            Some(at) if at <= now && !self.sync_in_flight => {
                self.next_retry = None;
                true
            }
            _ => false,
        }
    }

    pub fn retry_in(&self, now: Instant) -> Option<Duration> {
        self.next_retry.map(|at| at.saturating_duration_since(now))
    }
}

/// Parses `x,y` (fractions, or percentages when above 1) into a position
/// anchor; anything else is taken as a selector.
pub fn parse_anchor(input: &str) -> Option<Anchor> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Some((x, y)) = input.split_once(',') {
        if let (Ok(x), Ok(y)) = (x.trim().parse::<f64>(), y.trim().parse::<f64>()) {
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            let scale = if x > 1.0 || y > 1.0 { 100.0 } else { 1.0 };
            return Some(Anchor::position(x / scale, y / scale));
        }
    }
    Some(Anchor::selector(input))
}

/// Parses `route@version`. A bare route keeps the current version.
pub fn parse_scope(input: &str, current: &Scope) -> Scope {
    match input.trim().rsplit_once('@') {
        Some((route, version)) if !route.is_empty() && !version.is_empty() => Scope::new(route, version),
        _ => Scope::new(input.trim().trim_end_matches('@'), current.version.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use pinthread_core::engine::{MergeReport, RetryReport};
    use pinthread_core::types::ThreadStatus;

    fn comment(id: &str, parent: Option<&str>, minute: i64) -> Comment {
        Comment {
            id: CommentId::from(id),
            author: None,
            text: format!("text {id}"),
            created_at: Utc::now() + ChronoDuration::minutes(minute),
            remote_id: None,
            parent_local_id: parent.map(CommentId::from),
            parent_remote_id: None,
            unpushed_edit: false,
        }
    }

    fn thread(id: &str, minute: i64, comments: Vec<Comment>) -> Thread {
        Thread {
            id: ThreadId::from(id),
            anchor: Anchor::position(0.5, 0.5),
            scope: Scope::new("/", "v1"),
            comments,
            remote_issue_id: None,
            remote_issue_url: None,
            sync_status: SyncStatus::Local,
            sync_error: None,
            status: ThreadStatus::Open,
            unpushed_status: false,
            created_at: Utc::now() + ChronoDuration::minutes(minute),
        }
    }

    fn state() -> AppState {
        AppState::new(
            Scope::new("/", "v1"),
            true,
            true,
            Backoff::new(Duration::from_secs(1), Duration::from_secs(4)),
        )
    }

    #[test]
    fn selection_follows_thread_across_refresh() {
        let mut app = state();
        app.set_threads(vec![thread("a", 0, vec![]), thread("b", 1, vec![])]);
        app.select_next_thread();
        assert_eq!(app.selected_thread().map(|t| t.id.as_str()), Some("b"));

        // A newer thread elsewhere in the list does not move the selection.
        app.set_threads(vec![thread("z", -1, vec![]), thread("a", 0, vec![]), thread("b", 1, vec![])]);
        assert_eq!(app.selected_thread().map(|t| t.id.as_str()), Some("b"));

        app.set_threads(vec![thread("a", 0, vec![])]);
        assert_eq!(app.selected_thread().map(|t| t.id.as_str()), Some("a"));
        app.set_threads(vec![]);
        assert!(app.selected_thread().is_none());
    }

    #[test]
    fn comment_rows_follow_the_reply_tree() {
        let mut app = state();
        app.set_threads(vec![thread(
            "a",
            0,
            vec![comment("root", None, 0), comment("second", None, 2), comment("reply", Some("root"), 1)],
        )]);
        let rows: Vec<(usize, &str)> = app.comment_rows().iter().map(|(d, c)| (*d, c.id.as_str())).collect();
        assert_eq!(rows, vec![(0, "root"), (1, "reply"), (0, "second")]);

        app.focus = PanelFocus::Comments;
        app.scroll_bottom();
        assert_eq!(app.selected_comment().map(|c| c.id.as_str()), Some("second"));
        app.next_comment();
        assert_eq!(app.comment_cursor, 2, "cursor is clamped to the last row");
    }

    #[test]
    fn compose_turns_into_commands() {
        let mut app = state();
        app.set_threads(vec![thread("a", 0, vec![comment("root", None, 0)])]);

        app.begin_compose(
            ComposeTarget::Reply {
                thread: ThreadId::from("a"),
                parent: CommentId::from("root"),
            },
            "",
        );
        for ch in "agreed!".chars() {
            app.compose_push(ch);
        }
        app.compose_backspace();
        assert_eq!(
            app.submit_compose(),
            Some(Command::AddComment {
                thread: ThreadId::from("a"),
                text: "agreed".to_owned(),
                parent: Some(CommentId::from("root")),
            })
        );
        assert_eq!(app.mode, Mode::Normal);

        app.begin_compose(ComposeTarget::Comment { thread: ThreadId::from("a") }, "   ");
        assert_eq!(app.submit_compose(), None, "blank input is dropped");
        assert!(app.compose.is_none());
    }

    #[test]
    fn pin_anchor_input_is_parsed() {
        assert_eq!(parse_anchor("0.25, 0.5"), Some(Anchor::position(0.25, 0.5)));
        assert_eq!(parse_anchor("30,70"), Some(Anchor::position(0.3, 0.7)));
        assert_eq!(parse_anchor("main > h1"), Some(Anchor::selector("main > h1")));
        assert_eq!(parse_anchor("  "), None);
        assert_eq!(parse_anchor("nan,1"), None);
    }

    #[test]
    fn scope_input_is_parsed() {
        let current = Scope::new("/", "v3");
        assert_eq!(parse_scope("/pricing@v2", &current), Scope::new("/pricing", "v2"));
        assert_eq!(parse_scope("/about", &current), Scope::new("/about", "v3"));
        assert_eq!(parse_scope("/about@", &current), Scope::new("/about", "v3"));
    }

    #[test]
    fn failed_retry_backs_off_and_clean_retry_resets() {
        let mut app = state();
        let now = Instant::now();
        let failed = RetryReport {
            attempted: 2,
            synced: 1,
            failed: 1,
        };

        app.sync_in_flight = true;
        app.apply_sync_result(SyncResult::Retried(failed), now);
        assert!(!app.sync_in_flight);
        assert_eq!(app.retry_in(now), Some(Duration::from_secs(1)));
        assert!(app.status.as_ref().is_some_and(|s| s.is_error));

        app.apply_sync_result(SyncResult::Retried(failed), now);
        assert_eq!(app.retry_in(now), Some(Duration::from_secs(2)));

        assert!(!app.take_due_retry(now));
        assert!(app.take_due_retry(now + Duration::from_secs(2)));
        assert!(app.next_retry.is_none());

        app.apply_sync_result(
            SyncResult::Retried(RetryReport {
                attempted: 1,
                synced: 1,
                failed: 0,
            }),
            now,
        );
        assert_eq!(app.backoff.failures(), 0);
        assert!(app.next_retry.is_none());
    }

    #[test]
    fn errors_arm_the_retry_timer_once() {
        let mut app = state();
        let now = Instant::now();
        let mut broken = thread("a", 0, vec![]);
        broken.sync_status = SyncStatus::Error;
        app.set_threads(vec![broken]);

        app.schedule_retry_if_needed(now);
        let armed = app.next_retry;
        assert!(armed.is_some());
        app.schedule_retry_if_needed(now + Duration::from_secs(10));
        assert_eq!(app.next_retry, armed, "an armed timer is not pushed back");

        app.sync_in_flight = true;
        assert!(!app.take_due_retry(now + Duration::from_secs(60)), "never overlaps a running pass");
    }

    #[test]
    fn reconcile_results_reach_the_status_line() {
        let mut app = state();
        app.apply_sync_result(
            SyncResult::Reconciled {
                scope: Scope::new("/", "v1"),
                outcome: ReconcileOutcome::Applied(MergeReport {
                    merged: 2,
                    added: 1,
                    dropped: 0,
                    unlisted: 0,
                    failed: 1,
                }),
            },
            Instant::now(),
        );
        let status = app.status.clone().expect("status");
        assert_eq!(status.text, "/@v1: 2 merged, 1 new, 0 dropped, 1 failed");

        app.apply_sync_result(
            SyncResult::Reconciled {
                scope: Scope::new("/", "v1"),
                outcome: ReconcileOutcome::Failed("offline".to_owned()),
            },
            Instant::now(),
        );
        assert!(app.status.as_ref().is_some_and(|s| s.is_error));
    }
}
