use thiserror::Error;

use crate::types::{CommentId, ThreadId};

/// Failure reported by an [`IssueTracker`](crate::tracker::IssueTracker).
///
/// Every variant except `Configuration` is treated by the engine as a
/// retryable remote failure and recorded on the affected thread.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracker configuration error: {0}")]
    Configuration(String),
    #[error("tracker request failed: {0}")]
    Transport(String),
    #[error("tracker responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("tracker response was malformed: {0}")]
    Decode(String),
    #[error("{operation} stopped at the {max_pages}-page limit")]
    Truncated { operation: String, max_pages: u32 },
}

impl TrackerError {
    /// `true` for 404 responses, which some operations treat as "absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, TrackerError::Status { status: 404, .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored payload could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local store is unavailable: {0}")]
    Unavailable(String),
}

/// Programmer errors raised synchronously by the mutation API.
///
/// Remote failures never surface here; they end up on the thread as
/// `SyncStatus::Error` plus a `sync_error` message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown thread: {0}")]
    UnknownThread(ThreadId),
    #[error("unknown comment {comment} in thread {thread}")]
    UnknownComment { thread: ThreadId, comment: CommentId },
    #[error("reply parent {parent} does not exist in thread {thread}")]
    UnknownParent { thread: ThreadId, parent: CommentId },
    #[error(transparent)]
    Store(#[from] StoreError),
}
