// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, BorderType, Borders, Paragraph},
    Frame,
};

use quill_config::ChatMode;

use crate::markdown::StyledLines;

fn busy_char(ascii: bool) -> &'static str {
    if ascii {
        "* "
    } else {
        "⠿ "
    }
}
fn sep(ascii: bool) -> &'static str {
    if ascii {
        "|"
    } else {
        "│"
    }
}
fn border_type(ascii: bool) -> BorderType {
    if ascii {
        BorderType::Plain
    } else {
        BorderType::Rounded
    }
}

/// Draw the transcript pane.
pub fn draw_chat(frame: &mut Frame, area: Rect, lines: &StyledLines, scroll_offset: u16) {
    // Bottom-anchored: when content overflows, show the tail.
    let overflow = (lines.len() as u16).saturating_sub(area.height);
    let scroll = overflow.saturating_sub(scroll_offset.min(overflow));
    let paragraph = Paragraph::new(Text::from(lines.clone())).scroll((scroll, 0));
    frame.render_widget(paragraph, area);
}

/// Status line: provider, model, mode, context usage, busy/tool state.
#[allow(clippy::too_many_arguments)]
pub fn draw_status(
    frame: &mut Frame,
    area: Rect,
    provider_label: &str,
    model: &str,
    mode: ChatMode,
    session_number: i64,
    context_tokens: u64,
    busy: bool,
    current_tool: Option<&str>,
    ascii: bool,
) {
    let mut spans: Vec<Span> = Vec::new();
    if busy {
        spans.push(Span::styled(
            busy_char(ascii),
            Style::default().fg(Color::Yellow),
        ));
    } else {
        spans.push(Span::raw("  "));
    }
    spans.push(Span::styled(
        format!("#{session_number} "),
        Style::default().fg(Color::DarkGray),
    ));
    spans.push(Span::styled(
        provider_label.to_string(),
        Style::default().add_modifier(Modifier::BOLD),
    ));
    if !model.is_empty() && !provider_label.contains(model) {
        spans.push(Span::styled(
            format!(" {model}"),
            Style::default().fg(Color::DarkGray),
        ));
    }
    spans.push(Span::raw(format!(" {} ", sep(ascii))));
    spans.push(Span::styled(
        mode.as_str().to_string(),
        Style::default().fg(Color::Cyan),
    ));
    if context_tokens > 0 {
        spans.push(Span::raw(format!(" {} ", sep(ascii))));
        spans.push(Span::styled(
            format!("{}k tok", context_tokens / 1000),
            Style::default().fg(Color::DarkGray),
        ));
    }
    if let Some(tool) = current_tool {
        spans.push(Span::raw(format!(" {} ", sep(ascii))));
        spans.push(Span::styled(
            tool.to_string(),
            Style::default().fg(Color::Yellow),
        ));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

/// Error banner shown above the composer for non-cancellation errors.
pub fn draw_banner(frame: &mut Frame, area: Rect, message: &str) {
    let line = Line::from(Span::styled(
        format!("✗ {message}"),
        Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    ));
    frame.render_widget(Paragraph::new(line), area);
}

/// Pending-interjection indicator.
pub fn draw_interjection_note(frame: &mut Frame, area: Rect, text: &str) {
    let line = Line::from(Span::styled(
        format!("↳ queued: {text}"),
        Style::default().fg(Color::Blue),
    ));
    frame.render_widget(Paragraph::new(line), area);
}

/// The composer input box.
pub fn draw_composer(
    frame: &mut Frame,
    area: Rect,
    content: &str,
    cursor: usize,
    busy: bool,
    ascii: bool,
) {
    let title = if busy { " interject " } else { " message " };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(border_type(ascii))
        .title(title);
    let inner = block.inner(area);
    frame.render_widget(block, area);
    frame.render_widget(Paragraph::new(content.to_string()), inner);

    // Place the terminal cursor at the edit position on the first line.
    let col = content[..cursor.min(content.len())]
        .chars()
        .count()
        .min(inner.width.saturating_sub(1) as usize) as u16;
    frame.set_cursor_position((inner.x + col, inner.y));
}
