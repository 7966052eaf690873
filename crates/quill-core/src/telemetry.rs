// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Opt-in stream telemetry.
//!
//! `QUILL_STREAM_SUMMARY` emits one log line per turn with event and token
//! totals; `QUILL_STREAM_TRACE` logs per-event timing. Both accept
//! `0|1|true|false|yes|no` case-insensitively.

use std::time::Instant;

use tracing::{info, trace};

pub const SUMMARY_ENV: &str = "QUILL_STREAM_SUMMARY";
pub const TRACE_ENV: &str = "QUILL_STREAM_TRACE";

/// Parse a boolean environment toggle. Unset or unrecognised means `false`.
pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => parse_flag(&v),
        Err(_) => false,
    }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Per-turn telemetry collector, constructed once per provider stream.
pub struct StreamTelemetry {
    summary: bool,
    trace: bool,
    started: Instant,
    events: u64,
    text_bytes: u64,
    tool_calls: u64,
}

impl StreamTelemetry {
    pub fn from_env() -> Self {
        Self {
            summary: env_flag(SUMMARY_ENV),
            trace: env_flag(TRACE_ENV),
            started: Instant::now(),
            events: 0,
            text_bytes: 0,
            tool_calls: 0,
        }
    }

    pub fn record_event(&mut self, kind: &str, detail_len: usize) {
        self.events += 1;
        match kind {
            "text" => self.text_bytes += detail_len as u64,
            "tool_call" => self.tool_calls += 1,
            _ => {}
        }
        if self.trace {
            trace!(
                kind,
                detail_len,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "stream event"
            );
        }
    }

    pub fn finish_turn(&mut self, input_tokens: u64, output_tokens: u64) {
        if self.summary {
            info!(
                events = self.events,
                text_bytes = self.text_bytes,
                tool_calls = self.tool_calls,
                input_tokens,
                output_tokens,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "turn summary"
            );
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_accepts_documented_tokens() {
        for on in ["1", "true", "TRUE", "Yes", "yes", " true "] {
            assert!(parse_flag(on), "{on} should enable");
        }
        for off in ["0", "false", "no", "NO", "", "maybe", "2"] {
            assert!(!parse_flag(off), "{off} should disable");
        }
    }
}
