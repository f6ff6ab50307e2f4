//! Board rendering. [`render`] is the single entry point called from the
//! event loop's `terminal.draw()` closure.

mod layout;
pub mod comments_view;
pub mod compose;
pub mod help;
pub mod keybindings;
pub mod thread_list;

use ratatui::{Frame, style::Style, widgets::Block};

use crate::app::{AppState, Mode};
use crate::theme::Theme;
use layout::{compute_layout, inner_rect, render_status_bar};

/// Draws one frame.
///
/// Viewport heights and panel rects are cached into `state` before the
/// panels render so the next keypress can page and hit-test against the
/// current geometry.
pub fn render(frame: &mut Frame, state: &mut AppState, theme: &Theme) {
    let areas = compute_layout(frame, state);
    frame.render_widget(
        Block::new().style(Style::default().bg(theme.background)),
        frame.area(),
    );

    state.threads_viewport_height = inner_rect(areas.threads).height;
    state.comments_viewport_height = inner_rect(areas.comments).height;
    state.panel_rects = [areas.threads, areas.comments];

    if areas.threads.width > 0 {
        thread_list::render_thread_list(frame, areas.threads, state, theme);
    }
    if areas.comments.width > 0 {
        comments_view::render_comments(frame, areas.comments, state, theme);
    }
    compose::render_compose(frame, areas.compose, state, theme);
    render_status_bar(frame, areas.status_bar, state, theme);

    match state.mode {
        Mode::HelpOverlay => help::render_help_overlay(frame, theme, state.help_scroll),
        Mode::ConfirmRemove => compose::render_confirm_remove(frame, state, theme),
        Mode::Normal | Mode::Insert => {}
    }
}
