// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ordered segment model for one streaming turn.
//!
//! Stream events fold into a flat arena of segments (text, tool, image,
//! diff, external UI) in arrival order. Exactly one text segment is open at
//! a time; any non-text segment closes it. Tool segments are addressed
//! through a `call_id → index` map rather than links between segments.

use std::collections::HashMap;
use std::path::PathBuf;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::markdown::StyledLines;

/// Renders raw text to width-correct styled lines (the markdown shim, or a
/// plain-text fallback in tests). Passed at call time; never stored.
pub type RenderFn<'a> = &'a dyn Fn(&str, u16) -> StyledLines;

const WAVE_PERIOD: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Segment {
    Text {
        content: String,
        completed: bool,
        rendered: Option<StyledLines>,
    },
    Tool {
        call_id: String,
        name: String,
        info: String,
        status: SegmentStatus,
    },
    Image {
        path: PathBuf,
    },
    Diff {
        path: String,
        old: String,
        new: String,
        line: u32,
        rendered: Option<StyledLines>,
    },
    ExternalUi {
        summary: String,
    },
}

impl Segment {
    /// Stable segments render identically on every frame and may be flushed
    /// to scrollback. A pending tool or an open text segment still mutates.
    fn is_stable(&self) -> bool {
        match self {
            Segment::Text { completed, .. } => *completed,
            Segment::Tool { status, .. } => *status != SegmentStatus::Pending,
            Segment::Image { .. } | Segment::Diff { .. } | Segment::ExternalUi { .. } => true,
        }
    }
}

/// Next step the driver should schedule for the wave animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveCmd {
    /// Schedule another tick.
    Tick,
    /// Cycle finished (or nothing pending); schedule the pause timer.
    Pause,
}

#[derive(Default)]
pub struct StreamTracker {
    segments: Vec<Segment>,
    by_call: HashMap<String, usize>,
    /// Rendered lines already moved to scrollback (inline mode).
    flushed_lines: usize,
    version: u64,
    wave_pos: usize,
    wave_active: bool,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic content version; bumps on every visible mutation,
    /// including wave movement while tools are pending.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn wave_pos(&self) -> usize {
        self.wave_pos
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    // ── Mutation ──────────────────────────────────────────────────────────────

    /// Append text to the open text segment, opening a new one when the
    /// last segment is not open text.
    pub fn add_text_segment(&mut self, text: &str) {
        match self.segments.last_mut() {
            Some(Segment::Text {
                content,
                completed: false,
                rendered,
            }) => {
                content.push_str(text);
                *rendered = None;
            }
            _ => self.segments.push(Segment::Text {
                content: text.to_string(),
                completed: false,
                rendered: None,
            }),
        }
        self.version += 1;
    }

    /// Close the current text segment and eagerly render it for caching.
    pub fn mark_current_text_complete(&mut self, width: u16, render_fn: RenderFn) {
        if let Some(Segment::Text {
            content,
            completed: completed @ false,
            rendered,
        }) = self.segments.last_mut()
        {
            *completed = true;
            *rendered = Some(render_fn(content, width));
            self.version += 1;
        }
    }

    /// Close any open text segment (turn end).
    pub fn complete_text_segments(&mut self, width: u16, render_fn: RenderFn) {
        self.mark_current_text_complete(width, render_fn);
    }

    /// Record a starting tool. Returns `true` when this is the first
    /// pending tool, which the driver uses to start the wave animation.
    pub fn handle_tool_start(&mut self, call_id: &str, name: &str, info: &str) -> bool {
        self.close_open_text();
        let first_pending = !self.has_pending();
        self.by_call.insert(call_id.to_string(), self.segments.len());
        self.segments.push(Segment::Tool {
            call_id: call_id.to_string(),
            name: name.to_string(),
            info: info.to_string(),
            status: SegmentStatus::Pending,
        });
        self.version += 1;
        first_pending
    }

    /// Resolve a tool segment by call id. Idempotent: a second end for the
    /// same call leaves the first outcome in place.
    pub fn handle_tool_end(&mut self, call_id: &str, success: bool) {
        if let Some(&idx) = self.by_call.get(call_id) {
            if let Some(Segment::Tool { status, .. }) = self.segments.get_mut(idx) {
                if *status == SegmentStatus::Pending {
                    *status = if success {
                        SegmentStatus::Success
                    } else {
                        SegmentStatus::Failed
                    };
                    self.version += 1;
                }
            }
        }
    }

    pub fn add_image_segment(&mut self, path: PathBuf) {
        self.close_open_text();
        self.segments.push(Segment::Image { path });
        self.version += 1;
    }

    pub fn add_diff_segment(&mut self, path: &str, old: &str, new: &str, line: u32) {
        self.close_open_text();
        self.segments.push(Segment::Diff {
            path: path.to_string(),
            old: old.to_string(),
            new: new.to_string(),
            line,
            rendered: None,
        });
        self.version += 1;
    }

    pub fn add_external_ui_result(&mut self, summary: &str) {
        self.close_open_text();
        self.segments.push(Segment::ExternalUi {
            summary: summary.to_string(),
        });
        self.version += 1;
    }

    fn close_open_text(&mut self) {
        if let Some(Segment::Text {
            completed: completed @ false,
            ..
        }) = self.segments.last_mut()
        {
            *completed = true;
        }
    }

    /// Drop all segments and flush bookkeeping (new turn).
    pub fn clear(&mut self) {
        self.segments.clear();
        self.by_call.clear();
        self.flushed_lines = 0;
        self.wave_pos = 0;
        self.wave_active = false;
        self.version += 1;
    }

    /// Invalidate width-dependent render caches after a terminal resize.
    pub fn resize_stream_renderers(&mut self) {
        for seg in &mut self.segments {
            match seg {
                Segment::Text { rendered, .. } => *rendered = None,
                Segment::Diff { rendered, .. } => *rendered = None,
                _ => {}
            }
        }
        self.version += 1;
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn has_pending(&self) -> bool {
        self.segments.iter().any(
            |s| matches!(s, Segment::Tool { status: SegmentStatus::Pending, .. }),
        )
    }

    /// Indices of pending tool segments.
    pub fn active_segments(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Segment::Tool { status: SegmentStatus::Pending, .. }))
            .map(|(i, _)| i)
            .collect()
    }

    /// Count of stable (no longer mutating) segments.
    pub fn completed_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.is_stable()).count()
    }

    // ── Wave animation ────────────────────────────────────────────────────────

    /// Arm the wave if tools are pending. Returns `true` when the driver
    /// should schedule the first tick.
    pub fn start_wave(&mut self) -> bool {
        if self.wave_active || !self.has_pending() {
            return false;
        }
        self.wave_active = true;
        self.wave_pos = 0;
        true
    }

    /// Advance the wave one step. `Tick` asks the driver to schedule the
    /// next step; `Pause` ends the cycle (schedule [`Self::handle_wave_pause`]).
    pub fn handle_wave_tick(&mut self) -> WaveCmd {
        if !self.has_pending() {
            self.wave_active = false;
            return WaveCmd::Pause;
        }
        self.wave_pos = (self.wave_pos + 1) % WAVE_PERIOD;
        self.version += 1;
        if self.wave_pos == 0 {
            WaveCmd::Pause
        } else {
            WaveCmd::Tick
        }
    }

    /// End of the pause between cycles: restart when tools are still
    /// pending, stay quiet otherwise.
    pub fn handle_wave_pause(&mut self) -> WaveCmd {
        if self.has_pending() {
            WaveCmd::Tick
        } else {
            self.wave_active = false;
            WaveCmd::Pause
        }
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    /// Render the full segment list to lines, filling caches for stable
    /// segments.
    fn render_all(&mut self, width: u16, render_fn: RenderFn, include_images: bool) -> StyledLines {
        let wave_pos = self.wave_pos;
        let mut out: StyledLines = Vec::new();
        for seg in &mut self.segments {
            match seg {
                Segment::Text {
                    content,
                    completed,
                    rendered,
                } => {
                    if *completed {
                        if rendered.is_none() {
                            *rendered = Some(render_fn(content, width));
                        }
                        out.extend(rendered.clone().unwrap_or_default());
                    } else {
                        out.extend(render_fn(content, width));
                    }
                }
                Segment::Tool {
                    name,
                    info,
                    status,
                    ..
                } => out.push(tool_line(name, info, *status, wave_pos)),
                Segment::Image { path } => {
                    if include_images {
                        out.push(Line::from(Span::styled(
                            format!("▣ image: {}", path.display()),
                            Style::default().fg(Color::Magenta),
                        )));
                    }
                }
                Segment::Diff {
                    path,
                    old,
                    new,
                    line,
                    rendered,
                } => {
                    if rendered.is_none() {
                        *rendered = Some(render_diff_lines(path, old, new, *line, width));
                    }
                    out.extend(rendered.clone().unwrap_or_default());
                }
                Segment::ExternalUi { summary } => {
                    out.push(Line::from(Span::styled(
                        format!("⊕ {summary}"),
                        Style::default().fg(Color::Blue),
                    )));
                }
            }
        }
        out
    }

    /// Frame content not yet flushed to scrollback.
    pub fn render_unflushed(
        &mut self,
        width: u16,
        render_fn: RenderFn,
        include_images: bool,
    ) -> StyledLines {
        let all = self.render_all(width, render_fn, include_images);
        let skip = self.flushed_lines.min(all.len());
        all[skip..].to_vec()
    }

    /// Number of lines that belong to the stable prefix (stable segments,
    /// plus all but the last line of the first open text segment).
    fn stable_prefix_lines(
        &mut self,
        width: u16,
        render_fn: RenderFn,
        include_images: bool,
    ) -> usize {
        let mut lines = 0usize;
        for seg in &mut self.segments {
            if seg.is_stable() {
                lines += match seg {
                    Segment::Text { content, rendered, .. } => {
                        if rendered.is_none() {
                            *rendered = Some(render_fn(content, width));
                        }
                        rendered.as_ref().map(|r| r.len()).unwrap_or(0)
                    }
                    Segment::Tool { .. } => 1,
                    Segment::Image { .. } => usize::from(include_images),
                    Segment::Diff { path, old, new, line, rendered } => {
                        if rendered.is_none() {
                            *rendered = Some(render_diff_lines(path, old, new, *line, width));
                        }
                        rendered.as_ref().map(|r| r.len()).unwrap_or(0)
                    }
                    Segment::ExternalUi { .. } => 1,
                };
                continue;
            }
            // An open text segment contributes its settled lines; the last
            // line may still reflow as deltas arrive.
            if let Segment::Text { content, completed: false, .. } = seg {
                let open_lines = render_fn(content, width).len();
                lines += open_lines.saturating_sub(1);
            }
            break;
        }
        lines
    }

    /// When the unflushed content exceeds `max_view_lines`, return the
    /// stable prefix above that threshold as a block to append to
    /// scrollback, record it as flushed, and keep the remainder live.
    /// Call-rate throttling (≥ 100 ms between flushes) is the driver's job.
    pub fn flush_to_scrollback(
        &mut self,
        width: u16,
        max_view_lines: usize,
        render_fn: RenderFn,
    ) -> Option<StyledLines> {
        let all = self.render_all(width, render_fn, true);
        let unflushed = all.len().saturating_sub(self.flushed_lines);
        if unflushed <= max_view_lines {
            return None;
        }
        let overflow = unflushed - max_view_lines;
        let stable = self.stable_prefix_lines(width, render_fn, true);
        let flushable = overflow.min(stable.saturating_sub(self.flushed_lines));
        if flushable == 0 {
            return None;
        }
        let block = all[self.flushed_lines..self.flushed_lines + flushable].to_vec();
        self.flushed_lines += flushable;
        Some(block)
    }

    /// Return everything not yet flushed; called on stream end in inline
    /// mode so the final frame lands in scrollback.
    pub fn flush_all_remaining(
        &mut self,
        width: u16,
        render_fn: RenderFn,
    ) -> Option<StyledLines> {
        let all = self.render_all(width, render_fn, true);
        if self.flushed_lines >= all.len() {
            return None;
        }
        let block = all[self.flushed_lines..].to_vec();
        self.flushed_lines = all.len();
        Some(block)
    }
}

/// One-line rendering of a tool segment. Pending tools show a moving
/// highlight driven by `wave_pos`.
fn tool_line(name: &str, info: &str, status: SegmentStatus, wave_pos: usize) -> Line<'static> {
    let (glyph, glyph_style) = match status {
        SegmentStatus::Pending => ("⚙", Style::default().fg(Color::Yellow)),
        SegmentStatus::Success => ("✓", Style::default().fg(Color::Green)),
        SegmentStatus::Failed => ("✗", Style::default().fg(Color::Red)),
    };
    let mut spans = vec![Span::styled(format!("{glyph} "), glyph_style)];

    if status == SegmentStatus::Pending && !name.is_empty() {
        // Moving gradient: one character of the name lit per wave step.
        let lit = wave_pos % name.chars().count().max(1);
        for (i, c) in name.chars().enumerate() {
            let style = if i == lit {
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::Yellow)
            };
            spans.push(Span::styled(c.to_string(), style));
        }
    } else {
        spans.push(Span::styled(
            name.to_string(),
            Style::default().add_modifier(Modifier::BOLD),
        ));
    }
    if !info.is_empty() {
        spans.push(Span::styled(
            format!(" {info}"),
            Style::default().fg(Color::DarkGray),
        ));
    }
    Line::from(spans)
}

/// Styled unified diff body for a diff segment.
pub(crate) fn render_diff_lines(
    path: &str,
    old: &str,
    new: &str,
    start_line: u32,
    _width: u16,
) -> StyledLines {
    let mut out: StyledLines = Vec::new();
    out.push(Line::from(Span::styled(
        format!("∆ {path}:{start_line}"),
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    )));
    let diff = similar::TextDiff::from_lines(old, new);
    for change in diff.iter_all_changes() {
        let text = change.value().trim_end_matches('\n').to_string();
        let (prefix, style) = match change.tag() {
            similar::ChangeTag::Delete => ("- ", Style::default().fg(Color::Red)),
            similar::ChangeTag::Insert => ("+ ", Style::default().fg(Color::Green)),
            similar::ChangeTag::Equal => ("  ", Style::default().fg(Color::DarkGray)),
        };
        out.push(Line::from(Span::styled(format!("{prefix}{text}"), style)));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Plain renderer: one line per newline-separated row.
    fn plain(text: &str, _width: u16) -> StyledLines {
        text.split('\n').map(|l| Line::raw(l.to_string())).collect()
    }

    // ── Text segment lifecycle ────────────────────────────────────────────────

    #[test]
    fn text_deltas_accumulate_into_one_open_segment() {
        let mut t = StreamTracker::new();
        t.add_text_segment("hel");
        t.add_text_segment("lo");
        assert_eq!(t.segments().len(), 1);
        match &t.segments()[0] {
            Segment::Text { content, completed, .. } => {
                assert_eq!(content, "hello");
                assert!(!completed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_text_segment_closes_open_text() {
        let mut t = StreamTracker::new();
        t.add_text_segment("before");
        t.handle_tool_start("c1", "shell", "{}");
        t.add_text_segment("after");
        assert_eq!(t.segments().len(), 3);
        assert!(matches!(
            &t.segments()[0],
            Segment::Text { completed: true, .. }
        ));
        assert!(matches!(
            &t.segments()[2],
            Segment::Text { completed: false, .. }
        ));
    }

    #[test]
    fn mark_current_text_complete_caches_render() {
        let mut t = StreamTracker::new();
        t.add_text_segment("line1\nline2");
        t.mark_current_text_complete(80, &plain);
        match &t.segments()[0] {
            Segment::Text { completed, rendered, .. } => {
                assert!(*completed);
                assert_eq!(rendered.as_ref().unwrap().len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── Tool lifecycle ────────────────────────────────────────────────────────

    #[test]
    fn first_tool_start_reports_first_pending() {
        let mut t = StreamTracker::new();
        assert!(t.handle_tool_start("c1", "shell", ""));
        assert!(!t.handle_tool_start("c2", "grep", ""));
        assert!(t.has_pending());
        assert_eq!(t.active_segments().len(), 2);
    }

    #[test]
    fn tool_end_resolves_by_call_id_and_is_idempotent() {
        let mut t = StreamTracker::new();
        t.handle_tool_start("c1", "shell", "");
        t.handle_tool_start("c2", "grep", "");
        t.handle_tool_end("c1", true);
        t.handle_tool_end("c1", false); // second end ignored
        let statuses: Vec<SegmentStatus> = t
            .segments()
            .iter()
            .filter_map(|s| match s {
                Segment::Tool { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![SegmentStatus::Success, SegmentStatus::Pending]);
    }

    #[test]
    fn segment_accounting_adds_up() {
        let mut t = StreamTracker::new();
        t.add_text_segment("a");
        t.handle_tool_start("c1", "shell", "");
        t.add_diff_segment("f.rs", "x", "y", 1);
        // text(closed) + tool(pending) + diff
        assert_eq!(
            t.completed_segments() + t.active_segments().len(),
            t.segments().len()
        );
    }

    // ── Wave ──────────────────────────────────────────────────────────────────

    #[test]
    fn wave_starts_only_with_pending_tools() {
        let mut t = StreamTracker::new();
        assert!(!t.start_wave());
        t.handle_tool_start("c1", "shell", "");
        assert!(t.start_wave());
        assert!(!t.start_wave(), "already active");
    }

    #[test]
    fn wave_tick_advances_and_pauses_at_cycle_end() {
        let mut t = StreamTracker::new();
        t.handle_tool_start("c1", "shell", "");
        t.start_wave();
        let v0 = t.version();
        let mut pauses = 0;
        for _ in 0..WAVE_PERIOD {
            if t.handle_wave_tick() == WaveCmd::Pause {
                pauses += 1;
            }
        }
        assert_eq!(pauses, 1, "one pause per full cycle");
        assert!(t.version() > v0, "wave movement bumps the version");
    }

    #[test]
    fn wave_stops_when_no_tools_pending() {
        let mut t = StreamTracker::new();
        t.handle_tool_start("c1", "shell", "");
        t.start_wave();
        t.handle_tool_end("c1", true);
        assert_eq!(t.handle_wave_tick(), WaveCmd::Pause);
        assert_eq!(t.handle_wave_pause(), WaveCmd::Pause);
    }

    // ── Flushing ──────────────────────────────────────────────────────────────

    #[test]
    fn render_unflushed_skips_flushed_lines() {
        let mut t = StreamTracker::new();
        t.add_text_segment("1\n2\n3\n4\n5");
        t.mark_current_text_complete(80, &plain);
        t.handle_tool_start("c1", "shell", "");

        // 6 lines total (5 text + 1 tool); cap the live view at 2.
        let block = t.flush_to_scrollback(80, 2, &plain).expect("should flush");
        assert_eq!(block.len(), 4);
        let rest = t.render_unflushed(80, &plain, true);
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn flush_does_not_move_unstable_lines() {
        let mut t = StreamTracker::new();
        t.handle_tool_start("c1", "shell", "");
        // One pending tool line; nothing stable to flush even at cap 0.
        assert!(t.flush_to_scrollback(80, 0, &plain).is_none());
    }

    #[test]
    fn flush_under_threshold_returns_none() {
        let mut t = StreamTracker::new();
        t.add_text_segment("only\ntwo");
        t.mark_current_text_complete(80, &plain);
        assert!(t.flush_to_scrollback(80, 10, &plain).is_none());
    }

    #[test]
    fn flush_all_remaining_drains_everything_once() {
        let mut t = StreamTracker::new();
        t.add_text_segment("a\nb");
        t.mark_current_text_complete(80, &plain);
        t.handle_tool_start("c1", "shell", "");
        t.handle_tool_end("c1", true);

        let block = t.flush_all_remaining(80, &plain).unwrap();
        assert_eq!(block.len(), 3);
        assert!(t.flush_all_remaining(80, &plain).is_none());
        assert!(t.render_unflushed(80, &plain, true).is_empty());
    }

    #[test]
    fn open_text_keeps_last_line_live_when_flushing() {
        let mut t = StreamTracker::new();
        t.add_text_segment("a\nb\nc\nd\ne\nf");
        // Open segment: all but the last line are flushable.
        let block = t.flush_to_scrollback(80, 1, &plain).expect("flushable");
        assert_eq!(block.len(), 5);
        let rest = t.render_unflushed(80, &plain, true);
        assert_eq!(rest.len(), 1);
    }

    // ── Resize ────────────────────────────────────────────────────────────────

    #[test]
    fn resize_invalidates_cached_renders() {
        let mut t = StreamTracker::new();
        t.add_text_segment("content");
        t.mark_current_text_complete(80, &plain);
        t.resize_stream_renderers();
        match &t.segments()[0] {
            Segment::Text { rendered, .. } => assert!(rendered.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn version_bumps_on_every_mutation() {
        let mut t = StreamTracker::new();
        let v0 = t.version();
        t.add_text_segment("x");
        let v1 = t.version();
        t.handle_tool_start("c1", "shell", "");
        let v2 = t.version();
        t.handle_tool_end("c1", true);
        let v3 = t.version();
        assert!(v0 < v1 && v1 < v2 && v2 < v3);
    }
}
