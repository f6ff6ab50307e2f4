//! Thread list panel: one row per pin of the active scope.

use pinthread_core::types::{SyncStatus, Thread, ThreadStatus};
use ratatui::{
    Frame,
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{List, ListItem},
};

use crate::app::{AppState, PanelFocus};
use crate::theme::Theme;
use crate::ui::layout::panel_block;

pub fn render_thread_list(frame: &mut Frame, area: Rect, state: &mut AppState, theme: &Theme) {
    let is_focused = state.focus == PanelFocus::Threads;
    let open = state.threads.iter().filter(|t| t.status == ThreadStatus::Open).count();
    let title = if state.threads.is_empty() {
        "Pins".to_owned()
    } else {
        format!("Pins ({open} open / {})", state.threads.len())
    };
    let block = panel_block(title, is_focused, theme);

    let items: Vec<ListItem> = if state.threads.is_empty() {
        vec![ListItem::new(Line::raw("No pins here yet. Press n to add one."))]
    } else {
        state.threads.iter().map(|t| thread_item(t, theme)).collect()
    };

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().fg(theme.selection).add_modifier(Modifier::BOLD))
        .highlight_symbol("▸ ");

    frame.render_stateful_widget(list, area, &mut state.thread_list_state);
}

/// `● #12 main > h1  3 comments` with the dot colored by sync status.
fn thread_item(thread: &Thread, theme: &Theme) -> ListItem<'static> {
    let badge = Span::styled("● ", Style::default().fg(theme.sync_color(thread.sync_status)));
    let issue = match &thread.remote_issue_id {
        Some(id) => format!("#{id} "),
        None => String::new(),
    };
    let mut label_style = Style::default().fg(theme.thread_color(thread.status));
    if thread.status == ThreadStatus::Closed {
        label_style = label_style.add_modifier(Modifier::CROSSED_OUT);
    }
    let label = Span::styled(format!("{issue}{}", truncate(&thread.anchor.label(), 32)), label_style);
    let count = Span::styled(
        format!("  {} comment{}", thread.comments.len(), if thread.comments.len() == 1 { "" } else { "s" }),
        Style::default().fg(theme.timestamp),
    );
    let mut spans = vec![badge, label, count];
    if thread.sync_status == SyncStatus::Error {
        spans.push(Span::styled("  !", Style::default().fg(theme.sync_error)));
    }
    ListItem::new(Line::from(spans))
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{kept}…")
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("élément > span", 5), "élém…");
    }
}
