// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Markdown-to-styled-lines rendering.
//!
//! This is the collaborator seam for transcript text: the render pipeline
//! only depends on "text in, width-correct styled lines out". The renderer
//! here is intentionally small — headings, code blocks, lists, emphasis —
//! and everything unknown degrades to wrapped plain text.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use unicode_width::UnicodeWidthChar;

pub type StyledLines = Vec<Line<'static>>;

/// Line count of a rendered string: number of newlines, plus one for a
/// trailing unterminated line.
pub fn count_lines(s: &str) -> usize {
    let newlines = s.matches('\n').count();
    if !s.is_empty() && !s.ends_with('\n') {
        newlines + 1
    } else {
        newlines
    }
}

/// Greedy width-aware wrap. Words longer than the width are split hard.
pub fn wrap_to_width(text: &str, width: u16) -> Vec<String> {
    let width = width.max(4) as usize;
    let mut lines = Vec::new();
    for raw_line in text.split('\n') {
        if raw_line.is_empty() {
            lines.push(String::new());
            continue;
        }
        let mut current = String::new();
        let mut current_width = 0usize;
        for word in raw_line.split(' ') {
            let word_width: usize = word.chars().map(|c| c.width().unwrap_or(0)).sum();
            let sep = usize::from(!current.is_empty());
            if current_width + sep + word_width <= width {
                if sep == 1 {
                    current.push(' ');
                }
                current.push_str(word);
                current_width += sep + word_width;
                continue;
            }
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                current_width = 0;
            }
            if word_width <= width {
                current.push_str(word);
                current_width = word_width;
            } else {
                // Hard-split an overlong word.
                let mut piece = String::new();
                let mut piece_width = 0usize;
                for c in word.chars() {
                    let cw = c.width().unwrap_or(0);
                    if piece_width + cw > width {
                        lines.push(std::mem::take(&mut piece));
                        piece_width = 0;
                    }
                    piece.push(c);
                    piece_width += cw;
                }
                current = piece;
                current_width = piece_width;
            }
        }
        lines.push(current);
    }
    lines
}

/// Render markdown into styled terminal lines wrapped to `width`.
pub fn render_markdown(text: &str, width: u16) -> StyledLines {
    let mut out: StyledLines = Vec::new();
    let parser = Parser::new_ext(text, Options::ENABLE_STRIKETHROUGH);

    let mut style = Style::default();
    let mut paragraph = String::new();
    let mut in_code_block = false;
    let mut list_depth = 0usize;

    let flush_paragraph = |out: &mut StyledLines, buf: &mut String, style: Style, width: u16| {
        if buf.is_empty() {
            return;
        }
        for line in wrap_to_width(buf, width) {
            out.push(Line::from(Span::styled(line, style)));
        }
        buf.clear();
    };

    for event in parser {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
                style = style.add_modifier(Modifier::BOLD).fg(Color::Cyan);
            }
            Event::End(TagEnd::Heading(_)) => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
                style = Style::default();
                out.push(Line::default());
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
                in_code_block = true;
                if let CodeBlockKind::Fenced(lang) = kind {
                    if !lang.is_empty() {
                        out.push(Line::from(Span::styled(
                            format!("· {lang}"),
                            Style::default().fg(Color::DarkGray),
                        )));
                    }
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                out.push(Line::default());
            }
            Event::Start(Tag::List(_)) => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
                list_depth += 1;
            }
            Event::End(TagEnd::List(_)) => {
                list_depth = list_depth.saturating_sub(1);
                if list_depth == 0 {
                    out.push(Line::default());
                }
            }
            Event::Start(Tag::Item) => {
                paragraph.push_str(&"  ".repeat(list_depth.saturating_sub(1)));
                paragraph.push_str("• ");
            }
            Event::End(TagEnd::Item) => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
            }
            Event::Start(Tag::Emphasis) => style = style.add_modifier(Modifier::ITALIC),
            Event::End(TagEnd::Emphasis) => style = style.remove_modifier(Modifier::ITALIC),
            Event::Start(Tag::Strong) => style = style.add_modifier(Modifier::BOLD),
            Event::End(TagEnd::Strong) => style = style.remove_modifier(Modifier::BOLD),
            Event::Start(Tag::Paragraph) => {}
            Event::End(TagEnd::Paragraph) => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
                out.push(Line::default());
            }
            Event::Text(t) => {
                if in_code_block {
                    for code_line in t.lines() {
                        out.push(Line::from(Span::styled(
                            format!("  {code_line}"),
                            Style::default().fg(Color::Green),
                        )));
                    }
                } else {
                    paragraph.push_str(&t);
                }
            }
            Event::Code(code) => {
                paragraph.push('`');
                paragraph.push_str(&code);
                paragraph.push('`');
            }
            Event::SoftBreak => paragraph.push(' '),
            Event::HardBreak => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
            }
            Event::Rule => {
                flush_paragraph(&mut out, &mut paragraph, style, width);
                out.push(Line::from(Span::styled(
                    "─".repeat(width.max(4) as usize),
                    Style::default().fg(Color::DarkGray),
                )));
            }
            _ => {}
        }
    }
    flush_paragraph(&mut out, &mut paragraph, style, width);

    // Trim trailing blank lines so blocks compose without double gaps.
    while matches!(out.last(), Some(line) if line.spans.is_empty()) {
        out.pop();
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
