//! Color themes for the board.
//!
//! Two built-ins: `dark` (ANSI 16 colors, works everywhere) and
//! `catppuccin-mocha` (RGB, needs truecolor).

use pinthread_core::types::{SyncStatus, ThreadStatus};
use ratatui::style::Color;

#[derive(Debug, Clone)]
pub struct Theme {
    // Panel borders
    pub border_active: Color,
    pub border_inactive: Color,

    // Threads and comments
    pub thread_open: Color,
    pub thread_closed: Color,
    pub author: Color,
    pub timestamp: Color,
    pub reply_guide: Color,
    /// Comments the tracker has not confirmed yet.
    pub comment_pending: Color,
    pub selection: Color,

    // Sync badges
    pub sync_local: Color,
    pub sync_syncing: Color,
    pub sync_synced: Color,
    pub sync_pending: Color,
    pub sync_error: Color,

    // Status bar
    pub status_bar_bg: Color,
    pub status_bar_fg: Color,
    pub status_mode_normal: Color,
    pub status_mode_insert: Color,
    pub status_error: Color,

    pub background: Color,
}

impl Theme {
    pub fn dark() -> Self {
        Self {
            border_active: Color::Cyan,
            border_inactive: Color::DarkGray,

            thread_open: Color::Reset,
            thread_closed: Color::DarkGray,
            author: Color::Cyan,
            timestamp: Color::DarkGray,
            reply_guide: Color::DarkGray,
            comment_pending: Color::Yellow,
            selection: Color::Cyan,

            sync_local: Color::DarkGray,
            sync_syncing: Color::Blue,
            sync_synced: Color::Green,
            sync_pending: Color::Yellow,
            sync_error: Color::Red,

            status_bar_bg: Color::DarkGray,
            status_bar_fg: Color::White,
            status_mode_normal: Color::Cyan,
            status_mode_insert: Color::Green,
            status_error: Color::Red,

            background: Color::Reset,
        }
    }

    /// Catppuccin Mocha palette, <https://github.com/catppuccin/catppuccin>.
    pub fn catppuccin_mocha() -> Self {
        let green = Color::Rgb(166, 227, 161); // #a6e3a1
        let red = Color::Rgb(243, 139, 168); // #f38ba8
        let yellow = Color::Rgb(249, 226, 175); // #f9e2af
        let blue = Color::Rgb(137, 180, 250); // #89b4fa
        let teal = Color::Rgb(148, 226, 213); // #94e2d5
        let lavender = Color::Rgb(180, 190, 254); // #b4befe
        let overlay1 = Color::Rgb(127, 132, 156); // #7f849c
        let surface1 = Color::Rgb(69, 71, 90); // #45475a
        let base = Color::Rgb(30, 30, 46); // #1e1e2e
        let text = Color::Rgb(205, 214, 244); // #cdd6f4
        let peach = Color::Rgb(250, 179, 135); // #fab387

        Self {
            border_active: lavender,
            border_inactive: overlay1,

            thread_open: text,
            thread_closed: overlay1,
            author: teal,
            timestamp: overlay1,
            reply_guide: surface1,
            comment_pending: peach,
            selection: lavender,

            sync_local: overlay1,
            sync_syncing: blue,
            sync_synced: green,
            sync_pending: yellow,
            sync_error: red,

            status_bar_bg: surface1,
            status_bar_fg: text,
            status_mode_normal: lavender,
            status_mode_insert: green,
            status_error: red,

            background: base,
        }
    }

    /// Resolves a theme name from config. Unknown names fall back to `dark`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "catppuccin-mocha" | "catppuccin_mocha" => Self::catppuccin_mocha(),
            "dark" => Self::dark(),
            other => {
                tracing::warn!(theme = other, "unknown theme, falling back to dark");
                Self::dark()
            }
        }
    }

    pub fn sync_color(&self, status: SyncStatus) -> Color {
        match status {
            SyncStatus::Local => self.sync_local,
            SyncStatus::Syncing => self.sync_syncing,
            SyncStatus::Synced => self.sync_synced,
            SyncStatus::Pending => self.sync_pending,
            SyncStatus::Error => self.sync_error,
        }
    }

    pub fn thread_color(&self, status: ThreadStatus) -> Color {
        match status {
            ThreadStatus::Open => self.thread_open,
            ThreadStatus::Closed => self.thread_closed,
        }
    }
}
