//! Comment panel: the selected thread's reply tree.
//!
//! Rows come from `AppState::comment_rows` (depth-first, siblings by
//! creation time). Each comment renders as a header line plus its wrapped
//! text, indented by one guide per level of depth. The scroll offset follows
//! the selected comment.

use pinthread_core::types::{Comment, Thread, ThreadStatus};
use ratatui::{
    Frame,
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span, Text},
    widgets::Paragraph,
};

use crate::app::{AppState, PanelFocus};
use crate::theme::Theme;
use crate::ui::layout::{inner_rect, panel_block};

const INDENT: &str = "│ ";

pub fn render_comments(frame: &mut Frame, area: Rect, state: &mut AppState, theme: &Theme) {
    let is_focused = state.focus == PanelFocus::Comments;
    let inner = inner_rect(area);

    let (title, text, selected_line) = match state.selected_thread() {
        None => ("Comments".to_owned(), Text::from("Select a pin to see its comments."), 0),
        Some(thread) => {
            let title = format!("{} [{}]", thread.anchor.label(), thread.sync_status.as_str());
            let (text, selected_line) = thread_text(thread, &state.comment_rows(), state.comment_cursor, inner.width, theme);
            (title, text, selected_line)
        }
    };

    let height = inner.height;
    if height > 0 {
        let selected = u16::try_from(selected_line).unwrap_or(u16::MAX);
        if selected < state.comments_scroll {
            state.comments_scroll = selected;
        } else if selected >= state.comments_scroll.saturating_add(height) {
            state.comments_scroll = selected.saturating_sub(height.saturating_sub(2));
        }
    }

    frame.render_widget(panel_block(title, is_focused, theme), area);
    frame.render_widget(Paragraph::new(text).scroll((state.comments_scroll, 0)), inner);
}

/// Builds the panel body and returns it with the line index where the
/// selected comment starts.
fn thread_text(
    thread: &Thread,
    rows: &[(usize, &Comment)],
    cursor: usize,
    width: u16,
    theme: &Theme,
) -> (Text<'static>, usize) {
    let mut lines: Vec<Line<'static>> = Vec::new();
    let dim = Style::default().fg(theme.timestamp);

    if thread.status == ThreadStatus::Closed {
        lines.push(Line::styled("closed", Style::default().fg(theme.thread_closed)));
    }
    if let Some(url) = &thread.remote_issue_url {
        lines.push(Line::styled(url.clone(), dim));
    }
    if let Some(error) = &thread.sync_error {
        lines.push(Line::styled(format!("sync error: {error}"), Style::default().fg(theme.sync_error)));
    }
    if !lines.is_empty() {
        lines.push(Line::raw(""));
    }
    if rows.is_empty() {
        lines.push(Line::styled("No comments yet. Press c to write one.", dim));
    }

    let mut selected_line = 0;
    for (index, (depth, comment)) in rows.iter().enumerate() {
        let is_selected = index == cursor;
        if is_selected {
            selected_line = lines.len();
        }
        let guide = Span::styled(INDENT.repeat(*depth), Style::default().fg(theme.reply_guide));
        let marker = if is_selected {
            Span::styled("▸ ", Style::default().fg(theme.selection))
        } else {
            Span::raw("  ")
        };

        let mut header = vec![
            guide.clone(),
            marker,
            Span::styled(
                comment.author.clone().unwrap_or_else(|| "you".to_owned()),
                Style::default().fg(theme.author).add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("  {}", comment.created_at.format("%Y-%m-%d %H:%M")), dim),
        ];
        if !comment.is_durable() {
            header.push(Span::styled("  unsynced", Style::default().fg(theme.comment_pending)));
        }
        lines.push(Line::from(header));

        let text_width = usize::from(width).saturating_sub(INDENT.chars().count() * depth + 2).max(10);
        for chunk in wrap(&comment.text, text_width) {
            lines.push(Line::from(vec![guide.clone(), Span::raw("  "), Span::raw(chunk)]));
        }
        lines.push(Line::from(vec![guide]));
    }

    (Text::from(lines), selected_line)
}

/// Greedy word wrap on character counts. Explicit newlines are kept.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    for paragraph in text.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let needed = line.chars().count() + usize::from(!line.is_empty()) + word.chars().count();
            if !line.is_empty() && needed > width {
                out.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        out.push(line);
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::wrap;

    #[test]
    fn wrap_breaks_on_words_and_keeps_newlines() {
        assert_eq!(wrap("the quick brown fox", 9), vec!["the quick", "brown fox"]);
        assert_eq!(wrap("one\ntwo", 80), vec!["one", "two"]);
        assert_eq!(wrap("", 10), vec![""]);
        assert_eq!(wrap("unbreakable-word here", 4), vec!["unbreakable-word", "here"]);
    }
}
