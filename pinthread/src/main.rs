//! pinthread: a terminal board for threaded feedback pins.
//!
//! Entry point for the `pinthread` binary. Wires together the config file,
//! file logging, the SQLite store, the configured issue tracker and the sync
//! engine from `pinthread-core`, then runs the terminal event loop.
//!
//! # Startup sequence
//!
//! 1. Load config and start file logging. Both happen before the terminal
//!    is touched, so problems can still be printed to stderr.
//! 2. Open the store, build the tracker and the engine.
//! 3. `install_panic_hook()`, then `register_sigterm()`, then `init_tui()`.
//! 4. Spawn the input/timer task and the engine revision forwarder.
//! 5. Reconcile the active scope when a tracker is configured.
//!
//! `restore_tui()` runs after the loop exits on every path (quit key,
//! SIGTERM, channel close); draw errors break out of the loop instead of
//! returning early.

mod app;
mod command;
mod config;
mod event;
mod theme;
mod tui;
mod ui;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use pinthread_core::store::{LocalStore, SqliteStore};
use pinthread_core::tracker::build_tracker;
use pinthread_core::types::Scope;
use pinthread_core::{Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

use crate::app::AppState;
use crate::event::AppEvent;
use crate::ui::keybindings::{self, KeyAction};

/// Sends `tracing` output to `path`. The terminal belongs to the board, so
/// nothing is ever logged to stderr once it starts.
fn init_logging(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let filter = EnvFilter::try_from_env("PINTHREAD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// The scope last shown on the board, or the configured one.
fn initial_scope(store: &dyn LocalStore, configured: Scope) -> Scope {
    match store.preference(command::SCOPE_PREFERENCE) {
        Ok(Some(saved)) => app::parse_scope(&saved, &configured),
        Ok(None) => configured,
        Err(error) => {
            tracing::warn!(%error, "could not read saved scope");
            configured
        }
    }
}

fn to_io(error: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(error.to_string())
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = config::Config::load();
    if let Err(e) = init_logging(&config.log_path()) {
        eprintln!("pinthread: logging disabled, cannot open {:?}: {}", config.log_path(), e);
    }
    let theme = theme::Theme::from_name(&config.theme);

    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&config.database_path()).map_err(to_io)?);
    let tracker = match build_tracker(&config.tracker) {
        Ok(tracker) => tracker,
        Err(e) => {
            eprintln!("pinthread: tracker disabled: {e}");
            tracing::error!(error = %e, "tracker configuration rejected");
            None
        }
    };
    let engine = Engine::new(
        Arc::clone(&store),
        tracker,
        EngineConfig {
            author: config.author.clone(),
            ..EngineConfig::default()
        },
    )
    .map_err(to_io)?;

    let scope = initial_scope(store.as_ref(), config.scope.to_scope());
    let mut state = AppState::new(scope, engine.is_configured(), config.sync.auto_retry, config.sync.backoff());
    command::refresh(&engine, &mut state);

    tui::install_panic_hook();
    let term_flag = tui::register_sigterm()?;
    let mut terminal = tui::init_tui()?;

    let handler = event::EventHandler::new();
    event::spawn_event_task(handler.tx.clone());
    event::spawn_revision_forwarder(engine.subscribe(), handler.tx.clone());
    let tx = handler.tx;
    let mut rx = handler.rx;

    if state.configured && config.sync.reconcile_on_start {
        command::start_reconcile(&engine, &mut state, &tx);
    }
    tracing::info!(scope = %state.scope, configured = state.configured, "board started");

    // Exits only via `break` so `restore_tui()` below always runs.
    let mut outcome = Ok(());
    'event_loop: loop {
        tokio::select! {
            // Heartbeat: SIGTERM is noticed even when no events arrive.
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                if term_flag.load(Ordering::Relaxed) {
                    break 'event_loop;
                }
            }
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(AppEvent::Render) => {
                        if let Err(e) = terminal.draw(|frame| ui::render(frame, &mut state, &theme)) {
                            outcome = Err(e);
                            break 'event_loop;
                        }
                    }
                    Some(AppEvent::Key(key)) => match keybindings::handle_key(key, &mut state) {
                        KeyAction::Quit => break 'event_loop,
                        KeyAction::Run(cmd) => command::execute(&engine, cmd, &mut state, &tx),
                        KeyAction::Continue => {}
                    },
                    Some(AppEvent::Mouse(mouse)) => {
                        keybindings::handle_mouse(mouse, &mut state);
                    }
                    Some(AppEvent::EngineChanged) => {
                        command::refresh(&engine, &mut state);
                        state.schedule_retry_if_needed(Instant::now());
                    }
                    Some(AppEvent::SyncFinished(result)) => {
                        state.apply_sync_result(result, Instant::now());
                        command::refresh(&engine, &mut state);
                    }
                    Some(AppEvent::Tick) => {
                        if state.take_due_retry(Instant::now()) {
                            command::start_retry(&engine, &mut state, &tx);
                        }
                    }
                    // The next Render picks up the new size.
                    Some(AppEvent::Resize(_, _)) => {}
                    Some(AppEvent::Quit) | None => break 'event_loop,
                }
                if term_flag.load(Ordering::Relaxed) {
                    break 'event_loop;
                }
            }
        }
    }

    tui::restore_tui()?;
    tracing::info!("board closed");
    outcome
}
