// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod marker;
mod registry;
mod tool;

pub use marker::{encode_diff_marker, extract_diff_marker, DiffPayload, DIFF_MARKER_PREFIX};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCall, ToolOutput, ToolOutputPart};

/// Tool name reserved by the engine for routing a question back to the user.
/// Its results are surfaced as an external-UI segment rather than plain text.
pub const ASK_USER_TOOL: &str = "ask_user";

/// Tool name reserved by the engine for loading a skill into context.
pub const ACTIVATE_SKILL_TOOL: &str = "activate_skill";

/// The only tool whose results may carry the embedded diff marker; the
/// renderer gates diff extraction on this name.
pub const EDIT_FILE_TOOL: &str = "edit_file";

/// Tool name the engine injects when external search is forced on a provider
/// without native search support.
pub const WEB_SEARCH_TOOL: &str = "web_search";
