// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

/// Events emitted by the engine during a single submission.
/// Consumers (the TUI driver, headless runners) treat reception order as
/// authoritative.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text chunk streamed from the model.
    Text(String),
    /// A tool execution is starting. `info` is a short human-readable
    /// rendering of the arguments for status display.
    ToolExecStart {
        call_id: String,
        name: String,
        info: String,
    },
    /// A tool execution finished.
    ToolExecEnd {
        call_id: String,
        name: String,
        info: String,
        success: bool,
    },
    /// A tool produced an image on disk.
    Image { path: PathBuf },
    /// A structured diff extracted from a file-edit tool result.
    Diff {
        path: String,
        old: String,
        new: String,
        line: u32,
    },
    /// Result of the reserved ask-user tool, surfaced as an external-UI
    /// summary rather than inline text.
    AskUserResult { summary: String },
    /// Token usage reported by the provider for the current turn.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    },
    /// A retriable provider failure; the engine waits `wait` and re-attempts.
    Retry {
        attempt: u32,
        max: u32,
        wait: Duration,
    },
    /// The submission finished. Fires exactly once per submission, even
    /// after an error or cancellation.
    Done { total_tokens: u64 },
    /// A non-retriable failure; the turn loop has terminated.
    Error(String),
}

/// Token and call counters accumulated over one turn. Deltas, not totals:
/// the persistence callback adds them onto the session row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnMetrics {
    pub llm_turns: u64,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

impl TurnMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cached_input_tokens + self.output_tokens
    }
}
