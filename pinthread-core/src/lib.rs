//! Core of pinthread: threaded feedback pins mirrored to a remote issue
//! tracker.
//!
//! [`engine::Engine`] owns the thread collection and keeps it in sync with an
//! [`tracker::IssueTracker`], persisting through a [`store::LocalStore`].

pub mod engine;
pub mod error;
pub mod markers;
pub mod store;
pub mod threading;
pub mod tracker;
pub mod types;

pub use engine::{Engine, EngineConfig, ReconcileOutcome, RemoteOutcome, RetryReport};
pub use error::{EngineError, StoreError, TrackerError};
