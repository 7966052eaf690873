// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "quill",
    about = "An interactive terminal assistant with streaming LLM turns, tool use, and persistent sessions",
    version
)]
pub struct Cli {
    /// Initial prompt; the TUI starts and submits it immediately.
    pub prompt: Vec<String>,

    /// Explicit config file (merged on top of the discovered layers).
    #[arg(long, short = 'C')]
    pub config: Option<PathBuf>,

    /// Resume a saved session by id, `#N`, number, or short-id prefix.
    #[arg(long, short = 'r')]
    pub resume: Option<String>,

    /// Resume the most recently opened session.
    #[arg(long = "continue", short = 'c')]
    pub continue_last: bool,

    /// Model override: `provider` or `provider/model-name`.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Conversation mode: chat | ask | plan | exec.
    #[arg(long)]
    pub mode: Option<String>,

    /// Database path override (honoured verbatim).
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Disable persistence for this run.
    #[arg(long)]
    pub no_save: bool,

    /// Use the alternate screen instead of inline rendering.
    #[arg(long)]
    pub alt: bool,

    /// Render inline at the shell cursor (overrides a config file that
    /// selects the alternate screen).
    #[arg(long, conflicts_with = "alt")]
    pub inline: bool,

    /// Log to stderr (only useful outside the TUI; see QUILL_LOG_FILE).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn initial_prompt(&self) -> Option<String> {
        if self.prompt.is_empty() {
            None
        } else {
            Some(self.prompt.join(" "))
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and manage saved sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List sessions, most recently updated first.
    List {
        /// Include archived sessions.
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only sessions carrying this tag.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Full-text search over message content.
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete a session (and its messages) by id, `#N`, or prefix.
    Delete { target: String },

    /// Archive a session so it is hidden from default listings.
    Archive { target: String },
}
