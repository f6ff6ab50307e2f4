//! Two-panel layout for the board.
//!
//! Pure layout arithmetic, recomputed on every frame. At 80 columns and
//! wider the thread list and the comment view sit side by side; below that
//! only the focused panel is shown. `Spacing::Overlap(1)` plus
//! `MergeStrategy::Fuzzy` lets neighbouring borders share a column.

use std::time::Instant;

use ratatui::{
    Frame,
    layout::{Constraint, Layout, Margin, Rect, Spacing},
    style::{Modifier, Style},
    symbols::merge::MergeStrategy,
    text::{Line, Span},
    widgets::{Block, BorderType, Paragraph},
};

use crate::app::{AppState, Mode, PanelFocus};
use crate::theme::Theme;

const SIDE_BY_SIDE_MIN_WIDTH: u16 = 80;

/// Areas for one frame. Collapsed panels have zero width.
pub struct BoardLayout {
    pub threads: Rect,
    pub comments: Rect,
    /// Zero height unless the compose box is open.
    pub compose: Rect,
    pub status_bar: Rect,
}

/// Splits the frame into panels plus the compose box and status bar rows.
///
/// Below [`SIDE_BY_SIDE_MIN_WIDTH`] the unfocused panel collapses to zero
/// width; callers skip rendering into empty areas.
pub fn compute_layout(frame: &Frame, state: &AppState) -> BoardLayout {
    let compose_height = if state.compose.is_some() { 3 } else { 0 };
    let [main_area, compose, status_bar] = frame.area().layout(&Layout::vertical([
        Constraint::Fill(1),
        Constraint::Length(compose_height),
        Constraint::Length(1),
    ]));

    let constraints = if frame.area().width >= SIDE_BY_SIDE_MIN_WIDTH {
        [Constraint::Percentage(35), Constraint::Percentage(65)]
    } else if state.focus == PanelFocus::Threads {
        [Constraint::Fill(1), Constraint::Length(0)]
    } else {
        [Constraint::Length(0), Constraint::Fill(1)]
    };
    let horizontal = Layout::horizontal(constraints).spacing(Spacing::Overlap(1));
    let [threads, comments] = main_area.layout(&horizontal);

    BoardLayout {
        threads,
        comments,
        compose,
        status_bar,
    }
}

/// The area inside a panel's 1-cell border.
pub fn inner_rect(area: Rect) -> Rect {
    area.inner(Margin { vertical: 1, horizontal: 1 })
}

/// Bordered panel block: thick and highlighted when focused.
pub fn panel_block<'a>(title: impl Into<Line<'a>>, is_focused: bool, theme: &Theme) -> Block<'a> {
    let border_style = if is_focused {
        Style::default().fg(theme.border_active)
    } else {
        Style::default().fg(theme.border_inactive)
    };
    let border_type = if is_focused { BorderType::Thick } else { BorderType::Plain };

    Block::bordered()
        .title(title)
        .border_type(border_type)
        .border_style(border_style)
        .merge_borders(MergeStrategy::Fuzzy)
}

/// Mode badge, scope, tracker state and the latest status message.
pub fn render_status_bar(frame: &mut Frame, area: Rect, state: &AppState, theme: &Theme) {
    let (mode_text, mode_fg) = match state.mode {
        Mode::Insert => (" INSERT ", theme.status_mode_insert),
        Mode::Normal | Mode::HelpOverlay | Mode::ConfirmRemove => (" NORMAL ", theme.status_mode_normal),
    };

    let mut spans = vec![
        Span::styled(mode_text, Style::default().fg(mode_fg).add_modifier(Modifier::BOLD)),
        Span::raw(format!(" {} ", state.scope)),
    ];

    let remote = if !state.configured {
        "local only".to_owned()
    } else if state.sync_in_flight {
        "syncing".to_owned()
    } else {
        match state.retry_in(Instant::now()) {
            Some(wait) => format!("retry in {}s", wait.as_secs()),
            None => "connected".to_owned(),
        }
    };
    spans.push(Span::raw(format!("│ {remote} ")));

    if let Some(status) = &state.status {
        let style = if status.is_error {
            Style::default().fg(theme.status_error)
        } else {
            Style::default()
        };
        spans.push(Span::raw("│ "));
        spans.push(Span::styled(status.text.clone(), style));
    }

    frame.render_widget(
        Paragraph::new(Line::from(spans))
            .style(Style::default().bg(theme.status_bar_bg).fg(theme.status_bar_fg)),
        area,
    );
}
