// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Roles and parts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One content part of a message.
///
/// A message is an ordered sequence of parts. A `ToolResult` part's `id`
/// always references a `ToolCall` emitted earlier in the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. `"image/png"`.
        media_type: String,
        /// Base64-encoded bytes.
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Opaque JSON argument object; never interpreted by the engine.
        arguments: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// Newline-join of all text parts. This is the canonical derivation of
/// `Message::extracted_text`; the two must never diverge.
pub fn join_text_parts(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single message in the conversation history.
///
/// `id` and `sequence` are store-assigned: both stay at their unassigned
/// sentinels (`0` and `-1`) until the message is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Newline-join of the text parts; kept for full-text search and
    /// summaries. Reproducible from `parts` via [`join_text_parts`].
    pub extracted_text: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Dense per-session ordering starting at 0; `-1` until assigned.
    #[serde(default = "unassigned_sequence")]
    pub sequence: i64,
}

fn unassigned_sequence() -> i64 {
    -1
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        let extracted_text = join_text_parts(&parts);
        Self {
            id: 0,
            session_id: String::new(),
            role,
            parts,
            extracted_text,
            duration_ms: None,
            created_at: Utc::now(),
            sequence: -1,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    /// A tool-role message carrying one `ToolResult` part per executed call.
    pub fn tool_results(parts: Vec<Part>) -> Self {
        Self::new(Role::Tool, parts)
    }

    /// Append a part and keep `extracted_text` in sync.
    pub fn push_part(&mut self, part: Part) {
        self.parts.push(part);
        self.extracted_text = join_text_parts(&self.parts);
    }

    /// All tool-call parts in order of appearance.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall { .. }))
    }

    /// Approximate token count used for context management.
    ///
    /// 4-chars-per-token heuristic for text; images use a flat conservative
    /// estimate comparable to provider vision pricing.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self
            .parts
            .iter()
            .map(|p| match p {
                Part::Text { text } => text.len(),
                Part::Image { .. } => 765 * 4,
                Part::ToolCall {
                    name, arguments, ..
                } => name.len() + arguments.to_string().len(),
                Part::ToolResult { content, .. } => content.len(),
            })
            .sum();
        (chars / 4).max(1)
    }
}

// ─── Tool specs and requests ──────────────────────────────────────────────────

/// A tool schema provided to the model. Immutable per registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub schema: serde_json::Value,
}

/// Request for one model turn.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Opaque to the core; providers may use it as a cache or conversation key.
    pub session_id: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// Session-level web-search preference.
    pub search: bool,
    /// Force tool-based search even on providers with native search.
    pub force_external_search: bool,
    pub parallel_tool_calls: bool,
    pub max_turns: u32,
    /// Provider-specific hints; opaque to the core.
    pub hints: HashMap<String, serde_json::Value>,
}

// ─── Provider stream events ───────────────────────────────────────────────────

/// A single streamed event from the model provider.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// Incremental tool-call data. Providers interleave chunks for parallel
    /// calls by `index`; `id`/`name` arrive once, `arguments` accumulates.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Native web search performed server-side by the provider.
    WebSearch { query: String },
    /// Usage statistics for the turn.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    },
    /// The stream finished normally.
    Done,
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_extracted_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.extracted_text, "hello");
        assert_eq!(m.sequence, -1);
        assert_eq!(m.id, 0);
    }

    #[test]
    fn extracted_text_joins_text_parts_with_newline() {
        let m = Message::new(
            Role::Assistant,
            vec![
                Part::text("first"),
                Part::tool_call("c1", "shell", serde_json::json!({})),
                Part::text("second"),
            ],
        );
        assert_eq!(m.extracted_text, "first\nsecond");
        assert_eq!(m.extracted_text, join_text_parts(&m.parts));
    }

    #[test]
    fn push_part_keeps_extracted_text_in_sync() {
        let mut m = Message::assistant("a");
        m.push_part(Part::text("b"));
        assert_eq!(m.extracted_text, "a\nb");
    }

    #[test]
    fn tool_calls_returns_calls_in_order() {
        let m = Message::new(
            Role::Assistant,
            vec![
                Part::tool_call("c1", "shell", serde_json::json!({"cmd": "ls"})),
                Part::text("between"),
                Part::tool_call("c2", "read_file", serde_json::json!({})),
            ],
        );
        let calls = m.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "c1");
        assert_eq!(calls[1].1, "read_file");
        assert!(m.has_tool_calls());
    }

    #[test]
    fn non_text_only_message_has_empty_extracted_text() {
        let m = Message::tool_results(vec![Part::tool_result("c1", "shell", "out", false)]);
        assert_eq!(m.extracted_text, "");
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_image_uses_flat_estimate() {
        let m = Message::new(Role::User, vec![Part::image("image/png", "AAAA")]);
        assert_eq!(m.approx_tokens(), 765);
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_parts_round_trip_through_json() {
        let original = Message::new(
            Role::Assistant,
            vec![
                Part::text("answer"),
                Part::tool_call("c1", "shell", serde_json::json!({"cmd": "ls"})),
                Part::tool_result("c1", "shell", "a.txt", false),
                Part::image("image/png", "QUJD"),
            ],
        );
        let json = serde_json::to_string(&original.parts).unwrap();
        let back: Vec<Part> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original.parts);
    }

    #[test]
    fn role_serialises_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
    }

    #[test]
    fn part_tags_are_snake_case() {
        let json = serde_json::to_string(&Part::tool_call("x", "f", serde_json::json!({}))).unwrap();
        assert!(json.contains("\"type\":\"tool_call\""), "got: {json}");
    }
}
