//! Help overlay: a centred modal drawn over the panels.
//!
//! `Clear` erases the area first, so the overlay needs no second draw call.

use ratatui::{
    Frame,
    layout::Constraint,
    text::{Line, Text},
    widgets::{Block, Clear, Paragraph, Wrap},
};

use crate::theme::Theme;

/// Draws the key reference as a modal covering 80% of the frame.
///
/// Skipped on terminals narrower than 50 columns, where the wrapped lines
/// would be unreadable.
///
/// `help_scroll` is the first visible line. It is not clamped here or in the
/// key handler: `Paragraph::scroll` past the end renders an empty body, and
/// scrolling back up recovers the text.
pub fn render_help_overlay(frame: &mut Frame, theme: &Theme, help_scroll: u16) {
    if frame.area().width < 50 {
        return;
    }

    let overlay_area = frame
        .area()
        .centered(Constraint::Percentage(80), Constraint::Percentage(80));
    frame.render_widget(Clear, overlay_area);

    let block = Block::bordered()
        .title(" Help: j/k scroll, ? or Esc to close ")
        .border_style(ratatui::style::Style::default().fg(theme.border_active));

    frame.render_widget(
        Paragraph::new(build_help_text())
            .block(block)
            .wrap(Wrap { trim: false })
            .scroll((help_scroll, 0)),
        overlay_area,
    );
}

fn build_help_text() -> Text<'static> {
    Text::from(vec![
        Line::from("Navigation"),
        Line::from("  j / k         Next / previous pin or comment"),
        Line::from("  g / G         First / last"),
        Line::from("  Ctrl-d / u    Half page down / up"),
        Line::from("  H / L / Tab   Switch between pins and comments"),
        Line::from(""),
        Line::from("Pins"),
        Line::from("  n             New pin (x,y or a selector)"),
        Line::from("  x             Close / reopen the selected pin"),
        Line::from("  D             Remove the selected pin"),
        Line::from(""),
        Line::from("Comments"),
        Line::from("  c             Comment on the selected pin"),
        Line::from("  r             Reply to the selected comment"),
        Line::from("  e             Edit the selected comment"),
        Line::from("  d             Delete the selected comment"),
        Line::from(""),
        Line::from("Sync"),
        Line::from("  s             Sync the current scope with the tracker"),
        Line::from("  R             Retry everything not yet synced"),
        Line::from("  S             Switch scope (route@version)"),
        Line::from(""),
        Line::from("Compose box"),
        Line::from("  Enter         Submit"),
        Line::from("  Esc           Cancel"),
        Line::from(""),
        Line::from("General"),
        Line::from("  ?             Open / close this help"),
        Line::from("  q / Esc       Quit"),
    ])
}
