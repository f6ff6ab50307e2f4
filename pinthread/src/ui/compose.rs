//! Compose box and the remove-pin confirmation.

use ratatui::{
    Frame,
    layout::{Constraint, Rect},
    style::Style,
    text::{Line, Span},
    widgets::{Block, Clear, Paragraph},
};

use crate::app::AppState;
use crate::theme::Theme;

/// Single-line input with the prompt in the border title. The visible part
/// of the buffer is its tail, so the cursor stays on screen.
pub fn render_compose(frame: &mut Frame, area: Rect, state: &AppState, theme: &Theme) {
    let Some(compose) = &state.compose else {
        return;
    };
    if area.height < 3 {
        return;
    }
    let block = Block::bordered()
        .title(format!(" {} ", compose.target.prompt()))
        .border_style(Style::default().fg(theme.status_mode_insert));

    let visible = usize::from(area.width.saturating_sub(3));
    let chars = compose.buffer.chars().count();
    let tail: String = compose.buffer.chars().skip(chars.saturating_sub(visible)).collect();
    let cursor_x = area.x + 1 + u16::try_from(tail.chars().count()).unwrap_or(0);

    frame.render_widget(Paragraph::new(tail).block(block), area);
    frame.set_cursor_position((cursor_x.min(area.right().saturating_sub(2)), area.y + 1));
}

pub fn render_confirm_remove(frame: &mut Frame, state: &AppState, theme: &Theme) {
    let Some(thread) = state.selected_thread() else {
        return;
    };
    let area = frame
        .area()
        .centered(Constraint::Length(52), Constraint::Length(5));
    frame.render_widget(Clear, area);

    let linked = if thread.remote_issue_id.is_some() {
        " Its issue will be closed."
    } else {
        ""
    };
    let text = vec![
        Line::from(format!("Remove pin {}?{linked}", thread.anchor.label())),
        Line::from(""),
        Line::from(vec![
            Span::styled("y", Style::default().fg(theme.status_error)),
            Span::raw(" remove   "),
            Span::styled("n", Style::default().fg(theme.border_active)),
            Span::raw(" keep"),
        ]),
    ];
    let block = Block::bordered()
        .title(" Remove pin ")
        .border_style(Style::default().fg(theme.status_error));
    frame.render_widget(Paragraph::new(text).block(block), area);
}
