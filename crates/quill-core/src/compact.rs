// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use quill_model::{Message, Part, Role};

/// Instruction sent to the model when the history is summarised. The exact
/// wording is an implementation detail; only the trigger and post-conditions
/// are contractual.
pub(crate) const SUMMARIZE_PROMPT: &str =
    "Summarise the conversation so far in a concise, information-dense way. \
     Preserve all technical details, decisions, file names, code snippets, and \
     tool outputs that may be relevant to future work. The summary will replace \
     the earlier history to free up context space. Reply with the summary only.";

/// Compute how many leading messages of `messages` should be summarised,
/// preserving the most recent `keep_recent` user/assistant exchanges
/// verbatim.
///
/// The returned split index never lands inside a tool-interaction group: if
/// the preserved tail would begin with a tool-role message (results whose
/// originating calls would be summarised away), the split moves backward
/// until the whole group — the assistant message carrying the calls plus
/// all its results — stays intact on the preserved side.
///
/// Returns 0 when there is nothing worth summarising (the history is already
/// mostly "recent").
pub(crate) fn split_point(messages: &[Message], keep_recent: usize) -> usize {
    if keep_recent == 0 {
        return messages.len();
    }
    // Walk backward counting user messages; each starts one exchange.
    let mut kept = 0usize;
    let mut split = None;
    for idx in (0..messages.len()).rev() {
        if messages[idx].role == Role::User {
            kept += 1;
            if kept == keep_recent {
                split = Some(idx);
                break;
            }
        }
    }
    let Some(mut split) = split else {
        // Fewer exchanges than we want to keep; nothing to summarise.
        return 0;
    };

    // Never start the preserved tail on a tool-role message.
    while split > 0 && messages[split].role == Role::Tool {
        split -= 1;
    }
    split
}

/// Build the message list for the compaction request: a single user
/// message carrying the summarisation instruction plus the serialised old
/// history. The system prompt is handled by the caller (it is preserved
/// verbatim, not summarised).
pub(crate) fn compaction_request_messages(to_summarize: &[Message]) -> Vec<Message> {
    let history_text = serialize_history(to_summarize);
    vec![Message::user(format!(
        "{SUMMARIZE_PROMPT}\n\n---\n\n{history_text}"
    ))]
}

/// Serialise a message list into plain text for inclusion in a compaction
/// prompt.
pub(crate) fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let body = m
                .parts
                .iter()
                .map(|p| match p {
                    Part::Text { text } => text.clone(),
                    Part::Image { .. } => "[image]".to_string(),
                    Part::ToolCall { name, arguments, .. } => {
                        format!("[tool_call: {name}({arguments})]")
                    }
                    Part::ToolResult { name, content, .. } => {
                        format!("[tool_result {name}: {content}]")
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            format!("{}: {}", capitalised_role(m.role), body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn capitalised_role(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
        Role::Tool => "Tool",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
