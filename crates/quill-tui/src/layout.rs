// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    Frame,
};

/// The regions that make up the TUI frame.
#[derive(Debug, Clone, Copy)]
pub struct AppLayout {
    pub chat_pane: Rect,
    /// Error banner row; zero-height when there is no error.
    pub banner: Rect,
    /// Pending-interjection indicator row; zero-height when none queued.
    pub interjection: Rect,
    pub composer: Rect,
    pub status_bar: Rect,
}

impl AppLayout {
    /// Compute the layout for a frame area.
    pub fn compute(area: Rect, banner_visible: bool, interjection_visible: bool) -> Self {
        let banner_height = u16::from(banner_visible);
        let interjection_height = u16::from(interjection_visible);
        let composer_height = 3u16;
        let status_height = 1u16;

        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(1),
                Constraint::Length(banner_height),
                Constraint::Length(interjection_height),
                Constraint::Length(composer_height),
                Constraint::Length(status_height),
            ])
            .split(area);

        AppLayout {
            chat_pane: vertical[0],
            banner: vertical[1],
            interjection: vertical[2],
            composer: vertical[3],
            status_bar: vertical[4],
        }
    }

    pub fn new(frame: &Frame, banner_visible: bool, interjection_visible: bool) -> Self {
        Self::compute(frame.area(), banner_visible, interjection_visible)
    }

    /// Text rows available inside the chat pane.
    pub fn chat_inner_height(&self) -> u16 {
        self.chat_pane.height
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_fills_area_without_overlap() {
        let area = Rect::new(0, 0, 80, 24);
        let l = AppLayout::compute(area, true, true);
        let total = l.chat_pane.height
            + l.banner.height
            + l.interjection.height
            + l.composer.height
            + l.status_bar.height;
        assert_eq!(total, 24);
        assert_eq!(l.banner.height, 1);
        assert_eq!(l.interjection.height, 1);
    }

    #[test]
    fn hidden_rows_collapse_to_zero_height() {
        let l = AppLayout::compute(Rect::new(0, 0, 80, 24), false, false);
        assert_eq!(l.banner.height, 0);
        assert_eq!(l.interjection.height, 0);
        assert_eq!(l.chat_pane.height, 20);
    }
}
