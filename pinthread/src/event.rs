//! Event bus for the board.
//!
//! Terminal input, timer ticks, engine change notifications and the results
//! of background sync passes are all normalised into [`AppEvent`] and sent
//! over one unbounded tokio channel. The main loop is the only receiver.
//!
//! Two independent intervals drive the loop: a render interval (33 ms) that
//! triggers `terminal.draw()` and a logic tick (250 ms) that drives the
//! automatic retry schedule.

use crossterm::event::{Event, EventStream, KeyEvent, KeyEventKind, MouseEvent};
use futures::{FutureExt, StreamExt};
use pinthread_core::engine::{ReconcileOutcome, RetryReport};
use pinthread_core::types::Scope;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

#[derive(Debug)]
#[non_exhaustive]
pub enum AppEvent {
    /// A key press (`KeyEventKind::Press` only).
    Key(KeyEvent),
    Mouse(MouseEvent),
    Resize(u16, u16),
    /// Logic tick (250 ms).
    Tick,
    /// Render tick (33 ms).
    Render,
    /// The engine's revision counter moved; the thread snapshot is stale.
    EngineChanged,
    /// A reconcile or retry pass started from the board has finished.
    SyncFinished(SyncResult),
    Quit,
}

/// Outcome of a background sync pass, carried back to the UI thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    Reconciled { scope: Scope, outcome: ReconcileOutcome },
    Retried(RetryReport),
}

pub struct EventHandler {
    /// Send half; clone one per producer.
    pub tx: mpsc::UnboundedSender<AppEvent>,
    pub rx: mpsc::UnboundedReceiver<AppEvent>,
}

impl EventHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the task that feeds terminal input and both timers into `tx`.
///
/// `reader.next().fuse()` keeps `select!` from polling a finished stream.
/// Release and repeat key events are dropped so a keystroke never fires
/// twice. The task exits once the receiver is gone.
pub fn spawn_event_task(tx: mpsc::UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        let mut tick_interval = interval(Duration::from_millis(250));
        let mut render_interval = interval(Duration::from_millis(33));
        let mut reader = EventStream::new();

        loop {
            let tick_tick = tick_interval.tick();
            let render_tick = render_interval.tick();
            let crossterm_event = reader.next().fuse();

            let sent = tokio::select! {
                _ = tick_tick => tx.send(AppEvent::Tick),
                _ = render_tick => tx.send(AppEvent::Render),
                maybe_event = crossterm_event => match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        tx.send(AppEvent::Key(key))
                    }
                    Some(Ok(Event::Resize(w, h))) => tx.send(AppEvent::Resize(w, h)),
                    Some(Ok(Event::Mouse(mouse))) => tx.send(AppEvent::Mouse(mouse)),
                    _ => Ok(()),
                },
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

/// Forwards every engine revision bump as [`AppEvent::EngineChanged`].
///
/// Bursts collapse: a `watch` receiver only ever sees the latest value, so a
/// batch of mutations produces at most one pending notification.
pub fn spawn_revision_forwarder(mut revisions: watch::Receiver<u64>, tx: mpsc::UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        while revisions.changed().await.is_ok() {
            if tx.send(AppEvent::EngineChanged).is_err() {
                break;
            }
        }
    });
}
