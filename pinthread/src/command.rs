//! Runs board commands against the engine.
//!
//! Mutations are synchronous and return immediately; their remote effects
//! are already scheduled by the engine. Reconcile and retry passes run on a
//! spawned task and report back through [`AppEvent::SyncFinished`].

use pinthread_core::types::Scope;
use pinthread_core::{Engine, EngineError};
use tokio::sync::mpsc::UnboundedSender;

use crate::app::{AppState, Command, ComposeTarget};
use crate::event::{AppEvent, SyncResult};

/// Preference key holding the last scope shown on the board.
pub const SCOPE_PREFERENCE: &str = "board.scope";

/// Applies one board command and refreshes the visible snapshot.
///
/// Engine errors are shown on the status bar rather than returned; the
/// event loop never stops because a mutation was rejected.
pub fn execute(engine: &Engine, command: Command, state: &mut AppState, tx: &UnboundedSender<AppEvent>) {
    tracing::debug!(?command, "board command");
    let result = match command {
        Command::Reconcile => {
            start_reconcile(engine, state, tx);
            Ok(())
        }
        Command::RetryAll => {
            start_retry(engine, state, tx);
            Ok(())
        }
        Command::SwitchScope(scope) => {
            switch_scope(engine, state, scope);
            if state.configured {
                start_reconcile(engine, state, tx);
            }
            Ok(())
        }
        Command::CreatePin(anchor) => {
            let thread = engine.create_thread(anchor, state.scope.clone());
            refresh(engine, state);
            state.select_thread_id(&thread);
            state.begin_compose(ComposeTarget::Comment { thread }, "");
            Ok(())
        }
        Command::AddComment { thread, text, parent } => {
            engine.add_comment(&thread, text, parent.as_ref()).map(|_| ())
        }
        Command::EditComment { thread, comment, text } => engine.edit_comment(&thread, &comment, text),
        Command::DeleteComment { thread, comment } => engine.delete_comment(&thread, &comment),
        Command::CloseThread(thread) => engine.close_thread(&thread),
        Command::ReopenThread(thread) => engine.reopen_thread(&thread),
        Command::RemovePin(thread) => engine.remove_pin(&thread),
    };
    if let Err(error) = result {
        report_error(state, &error);
    }
    refresh(engine, state);
}

/// Reloads the active scope's snapshot from the engine.
pub fn refresh(engine: &Engine, state: &mut AppState) {
    state.set_threads(engine.threads_for_scope(&state.scope));
}

/// Starts a reconcile of the active scope unless a pass is already running.
pub fn start_reconcile(engine: &Engine, state: &mut AppState, tx: &UnboundedSender<AppEvent>) {
    if state.sync_in_flight {
        return;
    }
    state.sync_in_flight = true;
    state.set_info(format!("syncing {}…", state.scope));
    let engine = engine.clone();
    let scope = state.scope.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let outcome = engine.reconcile(&scope).await;
        let _ = tx.send(AppEvent::SyncFinished(SyncResult::Reconciled { scope, outcome }));
    });
}

pub fn start_retry(engine: &Engine, state: &mut AppState, tx: &UnboundedSender<AppEvent>) {
    if state.sync_in_flight {
        return;
    }
    if !state.configured {
        state.set_info("no tracker configured; nothing to retry");
        return;
    }
    state.sync_in_flight = true;
    state.set_info("retrying unsynced pins…");
    let engine = engine.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let report = engine.retry_all().await;
        let _ = tx.send(AppEvent::SyncFinished(SyncResult::Retried(report)));
    });
}

fn switch_scope(engine: &Engine, state: &mut AppState, scope: Scope) {
    if let Err(error) = engine.store().set_preference(SCOPE_PREFERENCE, &scope.to_string()) {
        tracing::error!(%error, "could not persist board scope");
    }
    tracing::info!(%scope, "board scope switched");
    state.set_info(format!("scope {scope}"));
    state.scope = scope;
    state.thread_list_state.select(None);
    refresh(engine, state);
}

fn report_error(state: &mut AppState, error: &EngineError) {
    tracing::warn!(%error, "board command rejected");
    state.set_error(error.to_string());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pinthread_core::engine::{Backoff, EngineConfig};
    use pinthread_core::store::{LocalStore, MemoryStore};
    use pinthread_core::tracker::MemoryTracker;
    use pinthread_core::types::{Anchor, SyncStatus, ThreadStatus};
    use tokio::sync::mpsc;

    use super::*;
    use crate::app::Mode;

    fn setup(tracker: Option<MemoryTracker>) -> (Engine, Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let configured = tracker.is_some();
        let engine = Engine::new(
            store.clone(),
            tracker.map(|t| Arc::new(t) as Arc<dyn pinthread_core::tracker::IssueTracker>),
            EngineConfig::default(),
        )
        .expect("engine");
        let state = AppState::new(Scope::new("/", "v1"), configured, true, Backoff::default());
        (engine, store, state)
    }

    #[tokio::test]
    async fn create_pin_opens_compose_for_first_comment() {
        let (engine, _store, mut state) = setup(None);
        let (tx, _rx) = mpsc::unbounded_channel();

        execute(&engine, Command::CreatePin(Anchor::position(0.1, 0.2)), &mut state, &tx);
        assert_eq!(state.threads.len(), 1);
        assert_eq!(state.mode, Mode::Insert);
        let thread = state.threads[0].id.clone();
        assert_eq!(state.compose.as_ref().map(|c| c.target.clone()), Some(ComposeTarget::Comment { thread }));
    }

    #[tokio::test]
    async fn engine_errors_land_on_the_status_line() {
        let (engine, _store, mut state) = setup(None);
        let (tx, _rx) = mpsc::unbounded_channel();

        execute(
            &engine,
            Command::CloseThread(pinthread_core::types::ThreadId::from("missing")),
            &mut state,
            &tx,
        );
        let status = state.status.clone().expect("status");
        assert!(status.is_error);
        assert!(status.text.contains("unknown thread"));
    }

    #[tokio::test]
    async fn reconcile_reports_back_over_the_bus() {
        let tracker = MemoryTracker::new();
        let (engine, _store, mut state) = setup(Some(tracker));
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute(&engine, Command::CreatePin(Anchor::selector("#nav")), &mut state, &tx);
        state.cancel_compose();
        engine.settle().await;

        execute(&engine, Command::Reconcile, &mut state, &tx);
        assert!(state.sync_in_flight);
        let result = match rx.recv().await.expect("event") {
            AppEvent::SyncFinished(result) => result,
            other => panic!("unexpected event {other:?}"),
        };
        state.apply_sync_result(result, std::time::Instant::now());
        assert!(!state.sync_in_flight);
        refresh(&engine, &mut state);
        assert_eq!(state.threads.len(), 1);
        assert_eq!(state.threads[0].sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn switching_scope_persists_and_filters() {
        let (engine, store, mut state) = setup(None);
        let (tx, _rx) = mpsc::unbounded_channel();

        execute(&engine, Command::CreatePin(Anchor::selector("#a")), &mut state, &tx);
        state.cancel_compose();
        execute(&engine, Command::SwitchScope(Scope::new("/about", "v1")), &mut state, &tx);
        assert!(state.threads.is_empty());
        assert_eq!(
            store.preference(SCOPE_PREFERENCE).expect("preference").as_deref(),
            Some("/about@v1")
        );

        execute(&engine, Command::SwitchScope(Scope::new("/", "v1")), &mut state, &tx);
        assert_eq!(state.threads.len(), 1);
        assert_eq!(state.threads[0].status, ThreadStatus::Open);
    }
}
