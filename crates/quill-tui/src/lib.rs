// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod app;
mod attach;
mod block_cache;
mod layout;
mod markdown;
mod renderer;
mod tracker;
mod viewport;
mod widgets;

pub use app::{engine_task, wire_persistence, App, AppOptions, CancelSlot, EngineRequest};
pub use attach::{ApprovedDirs, AttachmentError, Clipboard, NoClipboard};
pub use block_cache::{BlockCache, MessageBlock};
pub use markdown::{count_lines, render_markdown, StyledLines};
pub use renderer::{ChatRenderer, RenderMode, RendererEvent};
pub use tracker::{Segment, SegmentStatus, StreamTracker, WaveCmd};
pub use viewport::VirtualViewport;
