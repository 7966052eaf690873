// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-embedded diff marker protocol.
//!
//! The file-editing tool embeds a structured diff inside its plain-text
//! result as `__DIFF__:<base64 JSON>`. The marker may appear anywhere in
//! the text; consumers search for the literal prefix. The renderer only
//! honours the marker when the originating tool call is named
//! [`crate::EDIT_FILE_TOOL`] — other tools must not emit it.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};

pub const DIFF_MARKER_PREFIX: &str = "__DIFF__:";

/// The structured payload carried by a diff marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffPayload {
    /// Path of the edited file.
    pub file: String,
    /// Replaced content.
    pub old: String,
    /// Replacement content.
    pub new: String,
    /// 1-based line where the edit starts.
    pub line: u32,
}

/// Encode a diff payload into the marker form appended to tool output.
pub fn encode_diff_marker(payload: &DiffPayload) -> String {
    // Serialization of a plain struct with string/number fields cannot fail.
    let json = serde_json::to_vec(payload).unwrap_or_default();
    format!("{DIFF_MARKER_PREFIX}{}", B64.encode(json))
}

/// Find and decode the first diff marker in `content`.
///
/// Returns `None` when no marker is present or the payload does not decode;
/// a malformed marker is treated as ordinary text rather than an error.
pub fn extract_diff_marker(content: &str) -> Option<DiffPayload> {
    let start = content.find(DIFF_MARKER_PREFIX)? + DIFF_MARKER_PREFIX.len();
    let rest = &content[start..];
    // The base64 blob ends at the first character outside the standard
    // alphabet (whitespace, punctuation, end of string).
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='))
        .unwrap_or(rest.len());
    let bytes = B64.decode(&rest[..end]).ok()?;
    serde_json::from_slice(&bytes).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
