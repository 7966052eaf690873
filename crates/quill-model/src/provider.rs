// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::{ProviderEvent, Request};

pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// Failure classification for provider calls.
///
/// The engine retries `Transient` and `RateLimit` (emitting `Retry` events);
/// everything else terminates the turn with an `Error` event.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {message}")]
    Transient {
        message: String,
        /// Provider-declared backoff; the engine falls back to exponential
        /// backoff when absent.
        retry_after: Option<Duration>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimit { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } | Self::RateLimit { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable display label; may include parenthesized model info,
    /// e.g. `"acme (tiny-1)"`.
    fn name(&self) -> String;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Begin one turn. The returned stream yields events until `Done` or an
    /// error item; dropping the stream aborts the turn.
    async fn stream(&self, req: Request) -> Result<EventStream, ProviderError>;

    /// Input-token window of the current model, when known.
    fn input_token_limit(&self) -> Option<u32> {
        None
    }

    /// Maximum retry attempts the engine should make on retriable errors.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Whether the provider performs web search server-side. When false and
    /// external search is forced, the engine injects the search tool instead.
    fn supports_native_search(&self) -> bool {
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
