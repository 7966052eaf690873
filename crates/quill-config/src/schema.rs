// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tui: TuiConfig,
}

/// Conversation mode. Selects the system prompt flavour and is recorded on
/// the session row so listings can be filtered by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Chat,
    Ask,
    Plan,
    Exec,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Chat => "chat",
            ChatMode::Ask => "ask",
            ChatMode::Plan => "plan",
            ChatMode::Exec => "exec",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(ChatMode::Chat),
            "ask" => Some(ChatMode::Ask),
            "plan" => Some(ChatMode::Plan),
            "exec" => Some(ChatMode::Exec),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, e.g. "mock". Concrete providers register
    /// themselves with `quill_model::from_config`.
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Base URL override for local proxies and compatible endpoints.
    pub base_url: Option<String>,
    /// Context window override in tokens. When unset the provider's own
    /// declared limit is used.
    pub context_window: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            base_url: None,
            context_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum model↔tool round-trips per submission before the loop stops.
    pub max_turns: u32,
    /// Execute tool calls from one turn concurrently.
    #[serde(default = "default_true")]
    pub parallel_tool_calls: bool,
    /// Upper bound on concurrently running tools when parallel execution
    /// is enabled.
    pub parallel_tool_limit: usize,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 24,
            parallel_tool_calls: true,
            parallel_tool_limit: 8,
            compaction: CompactionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fraction of the model's input window that triggers compaction
    /// when the next turn is projected to exceed it.
    pub threshold: f32,
    /// Number of most-recent user/assistant exchanges preserved verbatim.
    pub keep_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.8,
            keep_recent: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Explicit database path. Honoured verbatim when set; otherwise
    /// `$XDG_DATA_HOME/quill/sessions.db` is used.
    pub path: Option<std::path::PathBuf>,
    /// Delete non-archived sessions older than this many days at startup.
    /// Zero disables age-based cleanup.
    pub max_age_days: u32,
    /// Keep at most this many non-archived sessions. Zero disables trimming.
    pub max_count: u32,
    /// Disable persistence entirely (the null store is used instead).
    #[serde(default)]
    pub disable: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_age_days: 0,
            max_count: 0,
            disable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuiConfig {
    /// Render inline at the shell cursor instead of the alternate screen.
    #[serde(default = "default_true")]
    pub inline: bool,
    /// ASCII-only decorations (no box-drawing or braille glyphs).
    #[serde(default)]
    pub ascii: bool,
    /// Characters released from the smooth-typing buffer per tick.
    pub typing_chars_per_tick: usize,
    /// Maximum run of consecutive newlines kept in streamed text.
    pub newline_cap: usize,
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            inline: true,
            ascii: false,
            typing_chars_per_tick: 6,
            newline_cap: 2,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
