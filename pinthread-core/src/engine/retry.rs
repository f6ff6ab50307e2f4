use std::time::Duration;

use super::{push_status, Engine, RemoteOutcome};
use crate::markers;
use crate::types::{CommentId, RemoteId, SyncStatus, ThreadId};

/// Totals from one [`Engine::retry_all`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

impl RetryReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Exponential retry schedule: `base * 2^n`, capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            failures: 0,
        }
    }

    /// Delay before the next attempt; each call counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u32.saturating_pow(self.failures.min(20));
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl Engine {
    /// Advances every thread still short of durability.
    ///
    /// Threads without an issue are created (then drained). Linked threads
    /// with local-only comments are drained. Status changes and edits the
    /// tracker never confirmed are re-sent, and a linked thread left in
    /// `Error` with nothing flagged gets its open/closed state re-sent.
    /// Only ever pushes what is still missing remotely, so interrupting and
    /// re-running is safe.
    pub async fn retry_all(&self) -> RetryReport {
        let mut report = RetryReport::default();
        if !self.is_configured() {
            return report;
        }

        let candidates: Vec<(ThreadId, bool)> = self
            .state()
            .threads
            .iter()
            .filter_map(|t| {
                let needs_issue = t.remote_issue_id.is_none()
                    && matches!(
                        t.sync_status,
                        SyncStatus::Error | SyncStatus::Pending | SyncStatus::Syncing | SyncStatus::Local
                    );
                let needs_drain = t.remote_issue_id.is_some() && t.has_pending_comments();
                let needs_resend = t.remote_issue_id.is_some()
                    && !needs_drain
                    && (t.sync_status == SyncStatus::Error || t.has_unpushed_changes());
                (needs_issue || needs_drain || needs_resend).then(|| (t.id.clone(), needs_resend))
            })
            .collect();

        tracing::info!(threads = candidates.len(), "retry pass started");
        for (thread_id, resend_only) in candidates {
            report.attempted += 1;
            let outcome = if resend_only {
                self.resend_changes(&thread_id).await
            } else {
                match self.backfill(&thread_id).await {
                    RemoteOutcome::Applied if self.thread(&thread_id).is_some_and(|t| t.has_unpushed_changes()) => {
                        self.resend_changes(&thread_id).await
                    }
                    outcome => outcome,
                }
            };
            let durable = self
                .thread(&thread_id)
                .is_none_or(|t| t.is_fully_durable() && t.sync_status == SyncStatus::Synced);
            match outcome {
                RemoteOutcome::Applied if durable => report.synced += 1,
                RemoteOutcome::Skipped => report.attempted -= 1,
                _ => report.failed += 1,
            }
        }
        tracing::info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            "retry pass finished"
        );
        report
    }

    /// Re-sends the thread's status and every unconfirmed edit.
    async fn resend_changes(&self, thread_id: &ThreadId) -> RemoteOutcome {
        let Some(tracker) = self.tracker() else {
            return RemoteOutcome::Skipped;
        };
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;
        let Some(thread) = self.thread(thread_id) else {
            return RemoteOutcome::Applied;
        };
        let Some(issue) = thread.remote_issue_id.clone() else {
            return RemoteOutcome::Applied;
        };
        let edits: Vec<(CommentId, RemoteId, String, String)> = thread
            .comments
            .iter()
            .filter(|c| c.unpushed_edit)
            .filter_map(|c| {
                let remote = c.remote_id.clone()?;
                let body = markers::encode_reply(&c.text, c.parent_remote_id.as_ref());
                Some((c.id.clone(), remote, body, c.text.clone()))
            })
            .collect();

        if thread.unpushed_status || edits.is_empty() {
            if let Err(error) = push_status(tracker.as_ref(), &issue, thread.status).await {
                let message = error.to_string();
                self.record_failure(thread_id, &message);
                return RemoteOutcome::Failed(message);
            }
            self.confirm_status(thread_id, thread.status);
        }
        for (comment_id, remote_id, body, text) in edits {
            tracing::debug!(thread = %thread_id, comment = %remote_id, "re-sending comment edit");
            if let Err(error) = tracker.update_comment(&remote_id, &body).await {
                let message = error.to_string();
                self.record_failure(thread_id, &message);
                return RemoteOutcome::Failed(message);
            }
            self.confirm_edit(thread_id, &comment_id, &text);
        }
        self.mark_synced_if_durable(thread_id);
        RemoteOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.failures(), 6);
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn cap_below_base_is_raised_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }
}
