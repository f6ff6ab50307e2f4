//! Keybinding dispatcher.
//!
//! Translates crossterm key and mouse events into `AppState` mutations and
//! returns a [`KeyAction`] telling the event loop whether to continue, quit,
//! or run an engine [`Command`]. Dispatch branches on `state.mode` first so
//! every mode has an isolated handler.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use pinthread_core::types::ThreadStatus;
use ratatui::layout::Position;

use crate::app::{AppState, Command, ComposeTarget, Mode, PanelFocus};

/// What the event loop does after a key has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyAction {
    Continue,
    Quit,
    Run(Command),
}

/// Routes a key press to the handler for the current [`Mode`].
///
/// Handlers only touch `AppState`. Anything that needs the engine comes
/// back as [`KeyAction::Run`], so the whole table is testable without a
/// tracker or a store.
pub fn handle_key(key: KeyEvent, state: &mut AppState) -> KeyAction {
    match state.mode {
        Mode::HelpOverlay => handle_help(key, state),
        Mode::ConfirmRemove => handle_confirm_remove(key, state),
        Mode::Normal => handle_normal(key, state),
        Mode::Insert => handle_insert(key, state),
    }
}

// ---------------------------------------------------------------------------
// Normal mode
// ---------------------------------------------------------------------------

fn handle_normal(key: KeyEvent, state: &mut AppState) -> KeyAction {
    if let Some(action) = handle_scroll_key(key, state) {
        return action;
    }

    match key.code {
        KeyCode::Char('H') | KeyCode::Char('L') | KeyCode::Tab => {
            state.focus = state.focus.toggle();
            KeyAction::Continue
        }
        KeyCode::Enter if state.focus == PanelFocus::Threads => {
            state.focus = PanelFocus::Comments;
            KeyAction::Continue
        }

        KeyCode::Char('n') => {
            state.begin_compose(ComposeTarget::NewPin, "");
            KeyAction::Continue
        }
        KeyCode::Char('c') => {
            if let Some(thread) = state.selected_thread().map(|t| t.id.clone()) {
                state.begin_compose(ComposeTarget::Comment { thread }, "");
            }
            KeyAction::Continue
        }
        KeyCode::Char('r') => {
            let target = state.selected_thread().map(|t| t.id.clone()).zip(state.selected_comment().map(|c| c.id.clone()));
            match target {
                Some((thread, parent)) => state.begin_compose(ComposeTarget::Reply { thread, parent }, ""),
                None => state.set_error("select a comment to reply to"),
            }
            KeyAction::Continue
        }
        KeyCode::Char('e') => {
            let target = state
                .selected_thread()
                .map(|t| t.id.clone())
                .zip(state.selected_comment().map(|c| (c.id.clone(), c.text.clone())));
            match target {
                Some((thread, (comment, text))) => {
                    state.begin_compose(ComposeTarget::Edit { thread, comment }, text);
                }
                None => state.set_error("select a comment to edit"),
            }
            KeyAction::Continue
        }
        KeyCode::Char('d') => {
            let target = state.selected_thread().map(|t| t.id.clone()).zip(state.selected_comment().map(|c| c.id.clone()));
            match target {
                Some((thread, comment)) => KeyAction::Run(Command::DeleteComment { thread, comment }),
                None => KeyAction::Continue,
            }
        }
        KeyCode::Char('x') => match state.selected_thread() {
            Some(thread) if thread.status == ThreadStatus::Open => KeyAction::Run(Command::CloseThread(thread.id.clone())),
            Some(thread) => KeyAction::Run(Command::ReopenThread(thread.id.clone())),
            None => KeyAction::Continue,
        },
        KeyCode::Char('D') => {
            if state.selected_thread().is_some() {
                state.mode = Mode::ConfirmRemove;
            }
            KeyAction::Continue
        }

        KeyCode::Char('s') => KeyAction::Run(Command::Reconcile),
        KeyCode::Char('R') => KeyAction::Run(Command::RetryAll),
        KeyCode::Char('S') => {
            let current = state.scope.to_string();
            state.begin_compose(ComposeTarget::Scope, current);
            KeyAction::Continue
        }

        KeyCode::Char('?') => {
            state.help_scroll = 0;
            state.mode = Mode::HelpOverlay;
            KeyAction::Continue
        }
        KeyCode::Char('q') | KeyCode::Esc => KeyAction::Quit,

        _ => KeyAction::Continue,
    }
}

/// j / k / g / G and the Ctrl half-page combos. `None` when the key is not
/// a scroll key.
fn handle_scroll_key(key: KeyEvent, state: &mut AppState) -> Option<KeyAction> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);

    match key.code {
        KeyCode::Char('j') | KeyCode::Down => state.scroll_down(1),
        KeyCode::Char('k') | KeyCode::Up => state.scroll_up(1),
        KeyCode::Char('g') | KeyCode::Home => state.scroll_top(),
        KeyCode::Char('G') | KeyCode::End => state.scroll_bottom(),
        KeyCode::Char('d') if ctrl => state.scroll_down(state.half_page()),
        KeyCode::Char('u') if ctrl => state.scroll_up(state.half_page()),
        _ => return None,
    }
    Some(KeyAction::Continue)
}

// ---------------------------------------------------------------------------
// Insert mode
// ---------------------------------------------------------------------------

/// Enter submits, Esc cancels, everything else edits the buffer.
fn handle_insert(key: KeyEvent, state: &mut AppState) -> KeyAction {
    match key.code {
        KeyCode::Esc => {
            state.cancel_compose();
            KeyAction::Continue
        }
        KeyCode::Enter => match state.submit_compose() {
            Some(command) => KeyAction::Run(command),
            None => KeyAction::Continue,
        },
        KeyCode::Backspace => {
            state.compose_backspace();
            KeyAction::Continue
        }
        KeyCode::Char(ch) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
            state.compose_push(ch);
            KeyAction::Continue
        }
        _ => KeyAction::Continue,
    }
}

// ---------------------------------------------------------------------------
// HelpOverlay / ConfirmRemove
// ---------------------------------------------------------------------------

fn handle_help(key: KeyEvent, state: &mut AppState) -> KeyAction {
    match key.code {
        KeyCode::Char('j') => {
            state.help_scroll = state.help_scroll.saturating_add(1);
            KeyAction::Continue
        }
        KeyCode::Char('k') => {
            state.help_scroll = state.help_scroll.saturating_sub(1);
            KeyAction::Continue
        }
        KeyCode::Char('?') | KeyCode::Esc | KeyCode::Char('q') => {
            state.mode = Mode::Normal;
            KeyAction::Continue
        }
        _ => KeyAction::Continue,
    }
}

/// `y` removes the selected pin; `n` or Esc cancels.
fn handle_confirm_remove(key: KeyEvent, state: &mut AppState) -> KeyAction {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') => {
            state.mode = Mode::Normal;
            match state.selected_thread() {
                Some(thread) => KeyAction::Run(Command::RemovePin(thread.id.clone())),
                None => KeyAction::Continue,
            }
        }
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
            state.mode = Mode::Normal;
            KeyAction::Continue
        }
        _ => KeyAction::Continue,
    }
}

// ---------------------------------------------------------------------------
// Mouse events
// ---------------------------------------------------------------------------

/// Left click focuses the panel under the cursor; the wheel moves the focused
/// selection (or the help overlay) by three rows.
pub fn handle_mouse(mouse: MouseEvent, state: &mut AppState) -> KeyAction {
    match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => {
            let pos = Position {
                x: mouse.column,
                y: mouse.row,
            };
            let [threads, comments] = state.panel_rects;
            if threads.width > 0 && threads.contains(pos) {
                state.focus = PanelFocus::Threads;
            } else if comments.width > 0 && comments.contains(pos) {
                state.focus = PanelFocus::Comments;
            }
        }
        MouseEventKind::ScrollUp if state.mode == Mode::HelpOverlay => {
            state.help_scroll = state.help_scroll.saturating_sub(3);
        }
        MouseEventKind::ScrollDown if state.mode == Mode::HelpOverlay => {
            state.help_scroll = state.help_scroll.saturating_add(3);
        }
        MouseEventKind::ScrollUp => state.scroll_up(3),
        MouseEventKind::ScrollDown => state.scroll_down(3),
        _ => {}
    }
    KeyAction::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pinthread_core::engine::Backoff;
    use pinthread_core::types::{Anchor, Comment, CommentId, Scope, SyncStatus, Thread, ThreadId};

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn board() -> AppState {
        let mut state = AppState::new(Scope::new("/", "v1"), true, false, Backoff::default());
        state.set_threads(vec![Thread {
            id: ThreadId::from("t1"),
            anchor: Anchor::selector("#hero"),
            scope: Scope::new("/", "v1"),
            comments: vec![Comment {
                id: CommentId::from("c1"),
                author: None,
                text: "logo is blurry".to_owned(),
                created_at: Utc::now(),
                remote_id: None,
                parent_local_id: None,
                parent_remote_id: None,
                unpushed_edit: false,
            }],
            remote_issue_id: None,
            remote_issue_url: None,
            sync_status: SyncStatus::Local,
            sync_error: None,
            status: ThreadStatus::Open,
            unpushed_status: false,
            created_at: Utc::now(),
        }]);
        state
    }

    #[test]
    fn reply_flow_produces_add_comment() {
        let mut state = board();
        assert_eq!(handle_key(press(KeyCode::Char('r')), &mut state), KeyAction::Continue);
        assert_eq!(state.mode, Mode::Insert);
        for ch in "fixed".chars() {
            handle_key(press(KeyCode::Char(ch)), &mut state);
        }
        assert_eq!(
            handle_key(press(KeyCode::Enter), &mut state),
            KeyAction::Run(Command::AddComment {
                thread: ThreadId::from("t1"),
                text: "fixed".to_owned(),
                parent: Some(CommentId::from("c1")),
            })
        );
    }

    #[test]
    fn typing_q_in_insert_mode_does_not_quit() {
        let mut state = board();
        handle_key(press(KeyCode::Char('c')), &mut state);
        assert_eq!(handle_key(press(KeyCode::Char('q')), &mut state), KeyAction::Continue);
        assert_eq!(state.compose.as_ref().map(|c| c.buffer.as_str()), Some("q"));
        handle_key(press(KeyCode::Esc), &mut state);
        assert_eq!(state.mode, Mode::Normal);
        assert_eq!(handle_key(press(KeyCode::Char('q')), &mut state), KeyAction::Quit);
    }

    #[test]
    fn edit_prefills_the_current_text() {
        let mut state = board();
        handle_key(press(KeyCode::Char('e')), &mut state);
        assert_eq!(state.compose.as_ref().map(|c| c.buffer.as_str()), Some("logo is blurry"));
    }

    #[test]
    fn remove_pin_needs_confirmation() {
        let mut state = board();
        assert_eq!(handle_key(press(KeyCode::Char('D')), &mut state), KeyAction::Continue);
        assert_eq!(state.mode, Mode::ConfirmRemove);
        assert_eq!(handle_key(press(KeyCode::Char('n')), &mut state), KeyAction::Continue);
        assert_eq!(state.mode, Mode::Normal);

        handle_key(press(KeyCode::Char('D')), &mut state);
        assert_eq!(
            handle_key(press(KeyCode::Char('y')), &mut state),
            KeyAction::Run(Command::RemovePin(ThreadId::from("t1")))
        );
    }

    #[test]
    fn x_toggles_between_close_and_reopen() {
        let mut state = board();
        assert_eq!(
            handle_key(press(KeyCode::Char('x')), &mut state),
            KeyAction::Run(Command::CloseThread(ThreadId::from("t1")))
        );
        state.threads[0].status = ThreadStatus::Closed;
        assert_eq!(
            handle_key(press(KeyCode::Char('x')), &mut state),
            KeyAction::Run(Command::ReopenThread(ThreadId::from("t1")))
        );
    }

    #[test]
    fn ctrl_d_is_half_page_not_delete() {
        let mut state = board();
        let ctrl_d = KeyEvent::new(KeyCode::Char('d'), KeyModifiers::CONTROL);
        assert_eq!(handle_key(ctrl_d, &mut state), KeyAction::Continue);
        assert_eq!(
            handle_key(press(KeyCode::Char('d')), &mut state),
            KeyAction::Run(Command::DeleteComment {
                thread: ThreadId::from("t1"),
                comment: CommentId::from("c1"),
            })
        );
    }
}
