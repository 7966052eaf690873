// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! File and image attachments.
//!
//! Attached files are inlined into the user-message text behind a separator
//! the display renderer strips; the model sees the full content, the
//! transcript shows only what the user typed. Reads are guarded by a size
//! cap, a binary sniff, and a persisted approved-directories list.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Maximum attached-file size.
pub const MAX_ATTACHMENT_BYTES: u64 = 2 * 1024 * 1024;
/// Maximum pasted-image size.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;
/// A NUL byte within this prefix classifies the file as binary.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Separator between the typed message and inlined attachments. Everything
/// from this marker on is stripped for display.
pub const ATTACHMENT_SEPARATOR: &str = "\n\n---\n**Attached files:**";

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("binary file rejected")]
    Binary,

    #[error("cannot read file: {0}")]
    Unreadable(String),

    #[error("directory not approved for attachment: {}", .0.display())]
    Unapproved(PathBuf),
}

/// Clipboard collaborator. The real backend lives at the application layer;
/// the core only needs "give me image bytes if the clipboard holds an
/// image". Non-image clipboard content returns `None`.
pub trait Clipboard: Send {
    /// `(mime_type, bytes)` of a clipboard image, if any.
    fn image(&mut self) -> Option<(String, Vec<u8>)>;
}

/// Clipboard stub for environments without one (CI, tests).
#[derive(Debug, Default)]
pub struct NoClipboard;

impl Clipboard for NoClipboard {
    fn image(&mut self) -> Option<(String, Vec<u8>)> {
        None
    }
}

/// Persisted allow-list of directories the user has approved for file
/// attachment: a JSON document `{ "directories": [...] }` under the app
/// config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovedDirs {
    pub directories: Vec<PathBuf>,
}

impl ApprovedDirs {
    /// Default location: `$XDG_CONFIG_HOME/quill/approved_dirs.json`.
    pub fn default_path() -> PathBuf {
        let root = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| dirs::config_dir())
            .unwrap_or_else(|| PathBuf::from("."));
        root.join("quill").join("approved_dirs.json")
    }

    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into());
        std::fs::write(path, json)
    }

    /// A directory is approved when it equals, or sits below, an approved
    /// entry.
    pub fn is_approved(&self, dir: &Path) -> bool {
        self.directories.iter().any(|d| dir.starts_with(d))
    }

    pub fn approve(&mut self, dir: PathBuf) {
        if !self.directories.contains(&dir) {
            debug!(dir = %dir.display(), "approving attachment directory");
            self.directories.push(dir);
        }
    }
}

/// Validate and read a file for attachment.
pub fn read_attachment(path: &Path, approved: &ApprovedDirs) -> Result<String, AttachmentError> {
    let meta =
        std::fs::metadata(path).map_err(|e| AttachmentError::Unreadable(e.to_string()))?;
    if meta.len() > MAX_ATTACHMENT_BYTES {
        return Err(AttachmentError::TooLarge {
            size: meta.len(),
            limit: MAX_ATTACHMENT_BYTES,
        });
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let canonical_dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !approved.is_approved(&canonical_dir) {
        return Err(AttachmentError::Unapproved(canonical_dir));
    }

    let bytes = std::fs::read(path).map_err(|e| AttachmentError::Unreadable(e.to_string()))?;
    if bytes
        .iter()
        .take(BINARY_SNIFF_BYTES)
        .any(|&b| b == 0)
    {
        return Err(AttachmentError::Binary);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Append attachment contents to the typed message text in the transport
/// format the renderer knows how to strip.
pub fn append_attachments(text: &str, attachments: &[(String, String)]) -> String {
    if attachments.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 256);
    out.push_str(text);
    out.push_str(ATTACHMENT_SEPARATOR);
    for (name, content) in attachments {
        out.push_str(&format!("\n### {name}\n```\n{content}\n```"));
    }
    out
}

/// The display form of a user message: everything from the attachment
/// separator on is dropped.
pub fn strip_attachments(text: &str) -> &str {
    match text.find(ATTACHMENT_SEPARATOR) {
        Some(idx) => &text[..idx],
        None => text,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
