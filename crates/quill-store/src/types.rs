// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_config::ChatMode;

/// Lifecycle state of a session.
///
/// Transitions form a DAG: `Active → {Complete, Error, Interrupted}`;
/// terminal states re-activate on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Complete,
    Error,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Complete => "complete",
            SessionStatus::Error => "error",
            SessionStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "complete" => Some(SessionStatus::Complete),
            "error" => Some(SessionStatus::Error),
            "interrupted" => Some(SessionStatus::Interrupted),
            _ => None,
        }
    }
}

/// Cumulative per-session counters. Non-decreasing over a session's life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub user_turns: u64,
    pub llm_turns: u64,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

/// Additive metrics update applied in a single statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsDelta {
    pub llm_turns: u64,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
}

/// A persisted conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique id; a UUID assigned on create when empty.
    pub id: String,
    /// Sequential human-facing number, unique and ≥ 1.
    pub number: i64,
    pub name: Option<String>,
    pub summary: String,
    /// Display label of the provider that ran the session.
    pub provider_label: String,
    /// Stable provider key used for re-instantiation on resume.
    pub provider_key: String,
    pub model: String,
    pub mode: ChatMode,
    pub agent: Option<String>,
    pub cwd: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Hidden from default listings without deletion.
    pub archived: bool,
    pub parent_id: Option<String>,
    /// Session-level web-search preference.
    pub search_flag: bool,
    /// Comma-separated tool names enabled for this session.
    pub tools_csv: String,
    /// Comma-separated MCP server names attached to this session.
    pub mcp_csv: String,
    pub metrics: SessionMetrics,
    pub status: SessionStatus,
    pub tags_csv: String,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            number: 0,
            name: None,
            summary: String::new(),
            provider_label: String::new(),
            provider_key: String::new(),
            model: String::new(),
            mode: ChatMode::Chat,
            agent: None,
            cwd: None,
            created_at: now,
            updated_at: now,
            archived: false,
            parent_id: None,
            search_flag: false,
            tools_csv: String::new(),
            mcp_csv: String::new(),
            metrics: SessionMetrics::default(),
            status: SessionStatus::Active,
            tags_csv: String::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Projection used by list UIs: the session plus its message count.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: Session,
    pub message_count: u64,
}

/// Filters for [`crate::SessionStore::list`]. Empty/None fields match all.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Substring match against the session name.
    pub name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub mode: Option<ChatMode>,
    pub status: Option<SessionStatus>,
    /// Exact tag match within the comma-separated tag list.
    pub tag: Option<String>,
    pub include_archived: bool,
    /// Defaults to 50 when zero.
    pub limit: usize,
    pub offset: usize,
}

/// One full-text search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub session_id: String,
    pub message_id: i64,
    /// Matching fragment with hits wrapped in `**…**`.
    pub snippet: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_unique_id_and_active_status() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, SessionStatus::Active);
        assert_eq!(a.mode, ChatMode::Chat);
        assert!(a.updated_at >= a.created_at);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            SessionStatus::Active,
            SessionStatus::Complete,
            SessionStatus::Error,
            SessionStatus::Interrupted,
        ] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("zombie"), None);
    }
}
