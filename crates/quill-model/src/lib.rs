// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation data model and the provider abstraction.
//!
//! The core never names a concrete provider in its public API: everything
//! upstream of the wire protocol speaks [`Provider`], [`Request`], and the
//! [`ProviderEvent`] stream. Concrete adapters (OpenAI-family,
//! Anthropic-family, local servers) are collaborators that translate to and
//! from this event stream; the deterministic mocks in [`mock`] are the only
//! implementations shipped with the core.

mod mock;
mod provider;
mod types;

pub use mock::{MockProvider, ScriptStep, ScriptedProvider};
pub use provider::{EventStream, Provider, ProviderError};
pub use types::{
    join_text_parts, Message, Part, ProviderEvent, Request, Role, ToolSpec, Usage,
};

/// Instantiate a provider from a model configuration.
///
/// Only the built-in mock is constructed here; real wire-protocol adapters
/// register at the application layer and are out of scope for the core.
pub fn from_config(
    cfg: &quill_config::ModelConfig,
) -> anyhow::Result<std::sync::Arc<dyn Provider>> {
    tracing::debug!(provider = %cfg.provider, model = %cfg.name, "instantiating provider");
    match cfg.provider.as_str() {
        "mock" => Ok(std::sync::Arc::new(MockProvider)),
        other => anyhow::bail!(
            "unknown provider '{other}': concrete providers are registered by the application"
        ),
    }
}
