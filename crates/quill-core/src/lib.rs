// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod adapter;
mod compact;
mod engine;
mod events;
mod telemetry;
#[cfg(test)]
mod tests;

pub use adapter::{StreamAdapter, DEFAULT_BUFFER};
pub use engine::{
    CompactionFn, Engine, InterjectionSlot, ResponseCompletedFn, TurnCompletedFn,
};
pub use events::{StreamEvent, TurnMetrics};
pub use telemetry::{env_flag, parse_flag, SUMMARY_ENV, TRACE_ENV};
