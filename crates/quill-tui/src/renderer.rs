// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Incremental chat renderer: history blocks through the LRU cache plus the
//! live streaming block, composed per mode.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use quill_model::{Message, Part, Role};
use quill_tools::{extract_diff_marker, EDIT_FILE_TOOL};

use crate::attach::strip_attachments;
use crate::block_cache::{BlockCache, MessageBlock};
use crate::markdown::{render_markdown, wrap_to_width, StyledLines};
use crate::tracker::{render_diff_lines, StreamTracker};
use crate::viewport::VirtualViewport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// History lives in the terminal scrollback; the frame holds only the
    /// active streaming content (or a backscroll slice while scrolled).
    Inline,
    /// Full history plus streaming content inside an application viewport.
    Alt,
}

/// Events the driver routes into the renderer. Stream events mutate the
/// owned streaming block; message events invalidate the block cache.
#[derive(Debug, Clone)]
pub enum RendererEvent {
    MessageAdded,
    MessagesLoaded,
    Cleared,
    StreamStarted,
    StreamText(String),
    StreamToolStart {
        call_id: String,
        name: String,
        info: String,
    },
    StreamToolEnd {
        call_id: String,
        success: bool,
    },
    StreamImage(PathBuf),
    StreamDiff {
        path: String,
        old: String,
        new: String,
        line: u32,
    },
    StreamAskUserResult(String),
    StreamEnded,
    Resized {
        width: u16,
        height: u16,
    },
    ScrolledBy(i32),
    InvalidateCache,
}

pub struct ChatRenderer {
    mode: RenderMode,
    width: u16,
    cache: Arc<BlockCache>,
    viewport: VirtualViewport,
    messages: Arc<Mutex<Vec<Message>>>,
    pub streaming: StreamTracker,
    streaming_active: bool,
    /// History length snapshot at stream start: messages persisted
    /// mid-stream (by the response callback) stay out of the history pane
    /// until the stream ends, so content is never shown twice.
    history_limit: Option<usize>,
    scroll_offset: usize,
}

impl ChatRenderer {
    pub fn new(
        mode: RenderMode,
        width: u16,
        height: u16,
        messages: Arc<Mutex<Vec<Message>>>,
    ) -> Self {
        Self {
            mode,
            width,
            cache: Arc::new(BlockCache::new(BlockCache::capacity_for_height(height))),
            viewport: VirtualViewport::new(height),
            messages,
            streaming: StreamTracker::new(),
            streaming_active: false,
            history_limit: None,
            scroll_offset: 0,
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn scroll_offset(&self) -> usize {
        self.scroll_offset
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_active
    }

    /// Rendered content is width-dependent: a width change invalidates the
    /// whole cache and the streaming block's segment caches.
    pub fn set_size(&mut self, width: u16, height: u16) {
        if width != self.width {
            self.width = width;
            self.cache.invalidate_all();
            self.streaming.resize_stream_renderers();
        }
        self.viewport = VirtualViewport::new(height);
    }

    pub fn handle_event(&mut self, event: RendererEvent) {
        match event {
            RendererEvent::MessageAdded | RendererEvent::MessagesLoaded => {
                // Over-invalidation on purpose: a sibling message may change
                // how an already-cached block renders (diff extraction).
                self.cache.invalidate_all();
            }
            RendererEvent::Cleared => {
                self.cache.invalidate_all();
                self.streaming.clear();
                self.streaming_active = false;
                self.history_limit = None;
                self.scroll_offset = 0;
            }
            RendererEvent::StreamStarted => {
                self.streaming.clear();
                self.streaming_active = true;
                self.history_limit =
                    Some(self.messages.lock().expect("message list lock poisoned").len());
            }
            RendererEvent::StreamText(delta) => self.streaming.add_text_segment(&delta),
            RendererEvent::StreamToolStart {
                call_id,
                name,
                info,
            } => {
                self.streaming.handle_tool_start(&call_id, &name, &info);
            }
            RendererEvent::StreamToolEnd { call_id, success } => {
                self.streaming.handle_tool_end(&call_id, success);
            }
            RendererEvent::StreamImage(path) => self.streaming.add_image_segment(path),
            RendererEvent::StreamDiff {
                path,
                old,
                new,
                line,
            } => self.streaming.add_diff_segment(&path, &old, &new, line),
            RendererEvent::StreamAskUserResult(summary) => {
                self.streaming.add_external_ui_result(&summary)
            }
            RendererEvent::StreamEnded => {
                let width = self.width;
                self.streaming
                    .complete_text_segments(width, &render_markdown);
                self.streaming_active = false;
                self.history_limit = None;
                self.cache.invalidate_all();
            }
            RendererEvent::Resized { width, height } => self.set_size(width, height),
            RendererEvent::ScrolledBy(delta) => {
                let len = self.messages.lock().expect("message list lock poisoned").len();
                let next = self.scroll_offset as i64 + delta as i64;
                self.scroll_offset = next.clamp(0, len.saturating_sub(1) as i64) as usize;
            }
            RendererEvent::InvalidateCache => self.cache.invalidate_all(),
        }
    }

    /// Block for one message, through the cache. `all` provides the
    /// context needed for diff extraction from tool results.
    fn message_block(&self, all: &[Message], idx: usize) -> Arc<MessageBlock> {
        let msg = &all[idx];
        let key = BlockCache::key(msg.id, self.width);
        // Unpersisted messages (id 0) share a key; skip the cache for them.
        if msg.id > 0 {
            if let Some(block) = self.cache.get(&key) {
                return block;
            }
        }
        let lines = render_message(all, idx, self.width);
        let block = Arc::new(MessageBlock {
            message_id: msg.id,
            lines,
            width: self.width,
        });
        if msg.id > 0 {
            self.cache.put(key, block.clone());
        }
        block
    }

    /// The visible history slice as styled lines.
    pub fn render_history(&self) -> StyledLines {
        let messages = self.messages.lock().expect("message list lock poisoned");
        let limit = self.history_limit.unwrap_or(messages.len()).min(messages.len());
        let visible = &messages[..limit];
        if visible.is_empty() {
            return Vec::new();
        }

        let heights: Vec<usize> = visible
            .iter()
            .map(|m| {
                if m.id > 0 {
                    self.cache
                        .get(&BlockCache::key(m.id, self.width))
                        .map(|b| b.height())
                        .unwrap_or_else(|| estimate_placeholder_height(m))
                } else {
                    estimate_placeholder_height(m)
                }
            })
            .collect();
        let (start, end) = self
            .viewport
            .visible_range_with_heights(visible, &heights, self.scroll_offset);

        let mut out: StyledLines = Vec::new();
        for idx in start..end {
            out.extend(self.message_block(visible, idx).lines.clone());
        }
        out
    }

    /// The live streaming block (content not yet flushed to scrollback).
    pub fn render_streaming(&mut self) -> StyledLines {
        let width = self.width;
        self.streaming
            .render_unflushed(width, &render_markdown, true)
    }

    /// Compose one frame for the current mode.
    ///
    /// Inline: empty unless streaming or scrolled back. Alt: history plus
    /// streaming inside the application viewport.
    pub fn render_frame(&mut self) -> StyledLines {
        match self.mode {
            RenderMode::Inline => {
                if self.scroll_offset > 0 {
                    self.render_history()
                } else if self.streaming_active {
                    self.render_streaming()
                } else {
                    Vec::new()
                }
            }
            RenderMode::Alt => {
                let mut out = self.render_history();
                if self.streaming_active {
                    out.extend(self.render_streaming());
                }
                out
            }
        }
    }
}

fn estimate_placeholder_height(msg: &Message) -> usize {
    match msg.role {
        Role::User => 3,
        _ => 10,
    }
}

/// Render a single message to lines, with sibling context for diff
/// extraction.
pub fn render_message(all: &[Message], idx: usize, width: u16) -> StyledLines {
    let msg = &all[idx];
    match msg.role {
        Role::User => render_user(msg, width),
        Role::Assistant => render_assistant(msg, width),
        Role::System => render_system(msg, width),
        Role::Tool => render_tool_message(all, idx, width),
    }
}

/// User messages render as a contiguous background band: `❯ ` on the first
/// line, two-space indent on continuations, wrapped to `width − 2`.
fn render_user(msg: &Message, width: u16) -> StyledLines {
    let shown = strip_attachments(&msg.extracted_text);
    let band = Style::default().bg(Color::Indexed(236)).fg(Color::White);
    let inner = width.saturating_sub(2).max(4);
    let mut out: StyledLines = Vec::new();
    for (i, line) in wrap_to_width(shown, inner).into_iter().enumerate() {
        let prefix = if i == 0 { "❯ " } else { "  " };
        let mut content = format!("{prefix}{line}");
        let pad = (width as usize).saturating_sub(display_width(&content));
        content.push_str(&" ".repeat(pad));
        out.push(Line::from(Span::styled(content, band)));
    }
    out.push(Line::default());
    out
}

fn render_assistant(msg: &Message, width: u16) -> StyledLines {
    let mut out: StyledLines = Vec::new();
    for part in &msg.parts {
        match part {
            Part::Text { text } => out.extend(render_markdown(text, width)),
            Part::ToolCall { name, arguments, .. } => {
                out.push(tool_call_line(name, arguments));
            }
            // Tool results travel in tool-role messages and render there.
            Part::ToolResult { .. } => {}
            Part::Image { media_type, .. } => {
                out.push(Line::from(Span::styled(
                    format!("▣ attached image ({media_type})"),
                    Style::default().fg(Color::Magenta),
                )));
            }
        }
    }
    if !out.is_empty() {
        out.push(Line::default());
    }
    out
}

fn render_system(msg: &Message, width: u16) -> StyledLines {
    let mut out: StyledLines = Vec::new();
    for line in render_markdown(&msg.extracted_text, width.saturating_sub(2)) {
        let mut spans = vec![Span::styled("· ", Style::default().fg(Color::DarkGray))];
        spans.extend(line.spans);
        out.push(Line::from(spans).style(Style::default().fg(Color::DarkGray)));
    }
    out
}

/// Tool messages are skipped, except that a result belonging to a prior
/// `edit_file` call with an embedded diff marker renders as a diff where
/// the call appeared.
fn render_tool_message(all: &[Message], idx: usize, width: u16) -> StyledLines {
    let mut out: StyledLines = Vec::new();
    for part in &all[idx].parts {
        let Part::ToolResult { id, content, .. } = part else {
            continue;
        };
        if originating_call_name(all, idx, id) != Some(EDIT_FILE_TOOL) {
            continue;
        }
        if let Some(diff) = extract_diff_marker(content) {
            out.extend(render_diff_lines(
                &diff.file, &diff.old, &diff.new, diff.line, width,
            ));
            out.push(Line::default());
        }
    }
    out
}

/// Name of the tool call a result refers to, found in a preceding
/// assistant message of the same transcript.
fn originating_call_name<'a>(all: &'a [Message], idx: usize, call_id: &str) -> Option<&'a str> {
    all[..idx].iter().rev().find_map(|m| {
        if m.role != Role::Assistant {
            return None;
        }
        m.parts.iter().find_map(|p| match p {
            Part::ToolCall { id, name, .. } if id == call_id => Some(name.as_str()),
            _ => None,
        })
    })
}

fn tool_call_line(name: &str, arguments: &serde_json::Value) -> Line<'static> {
    let mut args = arguments.to_string();
    if args.len() > 72 {
        let cut = args
            .char_indices()
            .take_while(|(i, _)| *i < 69)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        args.truncate(cut);
        args.push('…');
    }
    Line::from(vec![
        Span::styled("⚙ ", Style::default().fg(Color::Yellow)),
        Span::styled(
            name.to_string(),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!(" {args}"), Style::default().fg(Color::DarkGray)),
    ])
}

fn display_width(s: &str) -> usize {
    use unicode_width::UnicodeWidthChar;
    s.chars().map(|c| c.width().unwrap_or(0)).sum()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quill_tools::{encode_diff_marker, DiffPayload};

    fn shared(messages: Vec<Message>) -> Arc<Mutex<Vec<Message>>> {
        Arc::new(Mutex::new(messages))
    }

    fn with_id(mut m: Message, id: i64) -> Message {
        m.id = id;
        m
    }

    fn flat(lines: &StyledLines) -> String {
        lines
            .iter()
            .map(|l| {
                l.spans
                    .iter()
                    .map(|s| s.content.as_ref())
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ── Per-message rendering ─────────────────────────────────────────────────

    #[test]
    fn user_message_gets_prompt_prefix_and_indent() {
        let msgs = vec![Message::user(
            "a fairly long user message that will wrap over the available width",
        )];
        let lines = render_message(&msgs, 0, 30);
        let text = flat(&lines);
        assert!(text.starts_with("❯ "));
        assert!(text.lines().nth(1).unwrap().starts_with("  "));
    }

    #[test]
    fn user_message_strips_attachment_suffix() {
        let full = crate::attach::append_attachments(
            "look at this",
            &[("x.rs".into(), "fn x() {}".into())],
        );
        let msgs = vec![Message::user(full)];
        let text = flat(&render_message(&msgs, 0, 60));
        assert!(text.contains("look at this"));
        assert!(!text.contains("Attached files"));
        assert!(!text.contains("fn x() {}"));
    }

    #[test]
    fn assistant_renders_text_and_tool_calls_skips_results() {
        let msgs = vec![Message::new(
            Role::Assistant,
            vec![
                Part::text("running it now"),
                Part::tool_call("c1", "shell", serde_json::json!({"cmd": "ls"})),
                Part::tool_result("c1", "shell", "should not appear", false),
            ],
        )];
        let text = flat(&render_message(&msgs, 0, 60));
        assert!(text.contains("running it now"));
        assert!(text.contains("shell"));
        assert!(!text.contains("should not appear"));
    }

    #[test]
    fn tool_message_renders_nothing_by_default() {
        let msgs = vec![
            Message::new(
                Role::Assistant,
                vec![Part::tool_call("c1", "shell", serde_json::json!({}))],
            ),
            Message::tool_results(vec![Part::tool_result("c1", "shell", "plain output", false)]),
        ];
        assert!(render_message(&msgs, 1, 60).is_empty());
    }

    #[test]
    fn edit_file_diff_marker_renders_as_diff() {
        let marker = encode_diff_marker(&DiffPayload {
            file: "src/a.rs".into(),
            old: "old line".into(),
            new: "new line".into(),
            line: 3,
        });
        let msgs = vec![
            Message::new(
                Role::Assistant,
                vec![Part::tool_call("c1", EDIT_FILE_TOOL, serde_json::json!({}))],
            ),
            Message::tool_results(vec![Part::tool_result(
                "c1",
                EDIT_FILE_TOOL,
                format!("edited\n{marker}"),
                false,
            )]),
        ];
        let text = flat(&render_message(&msgs, 1, 60));
        assert!(text.contains("src/a.rs:3"));
        assert!(text.contains("- old line"));
        assert!(text.contains("+ new line"));
    }

    #[test]
    fn diff_marker_from_other_tool_is_ignored() {
        let marker = encode_diff_marker(&DiffPayload {
            file: "x".into(),
            old: "o".into(),
            new: "n".into(),
            line: 1,
        });
        let msgs = vec![
            Message::new(
                Role::Assistant,
                vec![Part::tool_call("c1", "shell", serde_json::json!({}))],
            ),
            Message::tool_results(vec![Part::tool_result(
                "c1",
                "shell",
                format!("out\n{marker}"),
                false,
            )]),
        ];
        assert!(render_message(&msgs, 1, 60).is_empty());
    }

    // ── Cache behaviour ───────────────────────────────────────────────────────

    #[test]
    fn resize_invalidates_and_repopulates_at_new_width() {
        let msgs: Vec<Message> = (0..10)
            .map(|i| with_id(Message::user(format!("message number {i} with some body")), i + 1))
            .collect();
        let mut renderer = ChatRenderer::new(RenderMode::Alt, 80, 24, shared(msgs));

        let _ = renderer.render_history();
        assert!(renderer.cache().len() > 0, "first render populates cache");
        let before = renderer.cache().get(&BlockCache::key(1, 80)).unwrap();

        renderer.set_size(100, 24);
        assert_eq!(renderer.cache().len(), 0, "width change clears the cache");

        let _ = renderer.render_history();
        assert!(renderer.cache().len() > 0, "second render repopulates");
        let after = renderer.cache().get(&BlockCache::key(1, 100)).unwrap();
        assert_eq!(before.width, 80);
        assert_eq!(after.width, 100);
    }

    #[test]
    fn height_change_alone_keeps_cache() {
        let msgs = vec![with_id(Message::user("hi"), 1)];
        let mut renderer = ChatRenderer::new(RenderMode::Alt, 80, 24, shared(msgs));
        let _ = renderer.render_history();
        let populated = renderer.cache().len();
        renderer.set_size(80, 40);
        assert_eq!(renderer.cache().len(), populated);
    }

    #[test]
    fn message_added_invalidates_cache() {
        let msgs = vec![with_id(Message::user("hi"), 1)];
        let mut renderer = ChatRenderer::new(RenderMode::Alt, 80, 24, shared(msgs));
        let _ = renderer.render_history();
        assert!(renderer.cache().len() > 0);
        renderer.handle_event(RendererEvent::MessageAdded);
        assert_eq!(renderer.cache().len(), 0);
    }

    // ── Frame composition ─────────────────────────────────────────────────────

    #[test]
    fn inline_frame_empty_when_idle() {
        let msgs = vec![with_id(Message::user("hi"), 1)];
        let mut renderer = ChatRenderer::new(RenderMode::Inline, 80, 24, shared(msgs));
        assert!(renderer.render_frame().is_empty());
    }

    #[test]
    fn inline_frame_shows_stream_content_while_streaming() {
        let mut renderer = ChatRenderer::new(RenderMode::Inline, 80, 24, shared(vec![]));
        renderer.handle_event(RendererEvent::StreamStarted);
        renderer.handle_event(RendererEvent::StreamText("streaming text".into()));
        let text = flat(&renderer.render_frame());
        assert!(text.contains("streaming text"));
    }

    #[test]
    fn inline_frame_shows_backscroll_when_scrolled() {
        let msgs: Vec<Message> = (0..5)
            .map(|i| with_id(Message::user(format!("m{i}")), i + 1))
            .collect();
        let mut renderer = ChatRenderer::new(RenderMode::Inline, 80, 24, shared(msgs));
        renderer.handle_event(RendererEvent::ScrolledBy(2));
        let text = flat(&renderer.render_frame());
        assert!(text.contains("m0"));
    }

    #[test]
    fn alt_frame_contains_history_and_stream() {
        let msgs = vec![with_id(Message::user("history entry"), 1)];
        let mut renderer = ChatRenderer::new(RenderMode::Alt, 80, 24, shared(msgs));
        renderer.handle_event(RendererEvent::StreamStarted);
        renderer.handle_event(RendererEvent::StreamText("live delta".into()));
        let text = flat(&renderer.render_frame());
        assert!(text.contains("history entry"));
        assert!(text.contains("live delta"));
    }

    #[test]
    fn messages_persisted_mid_stream_stay_out_of_history_until_end() {
        let shared_msgs = shared(vec![with_id(Message::user("question"), 1)]);
        let mut renderer = ChatRenderer::new(RenderMode::Alt, 80, 24, shared_msgs.clone());
        renderer.handle_event(RendererEvent::StreamStarted);
        renderer.handle_event(RendererEvent::StreamText("partial answer".into()));

        // The response callback persists the assistant message mid-stream.
        shared_msgs
            .lock()
            .unwrap()
            .push(with_id(Message::assistant("partial answer"), 2));
        renderer.handle_event(RendererEvent::MessageAdded);

        let text = flat(&renderer.render_frame());
        assert_eq!(
            text.matches("partial answer").count(),
            1,
            "no double display while streaming"
        );

        renderer.handle_event(RendererEvent::StreamEnded);
        let text = flat(&renderer.render_frame());
        assert_eq!(text.matches("partial answer").count(), 1);
    }
}
