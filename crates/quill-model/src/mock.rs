// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::EventStream, Provider, ProviderError, ProviderEvent, Request, Role};

/// Deterministic mock provider for tests. Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> String {
        "mock".into()
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: Request) -> Result<EventStream, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.extracted_text.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<Result<ProviderEvent, ProviderError>> = vec![
            Ok(ProviderEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ProviderEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cached_tokens: 0,
            }),
            Ok(ProviderEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One step of a scripted response.
#[derive(Debug)]
pub enum ScriptStep {
    Event(ProviderEvent),
    /// Surface an error item mid-stream. Retriable errors exercise the
    /// engine's retry loop; others terminate the turn.
    Fail(ProviderError),
}

/// A pre-scripted mock provider. Each call to `stream` pops the next
/// response script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls and failures — without network
/// access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<ScriptStep>>>>,
    label: String,
    model: String,
    input_limit: Option<u32>,
    retries: u32,
    native_search: bool,
    /// The last `Request` seen by this provider. Written on each `stream()`
    /// call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<Request>>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of response scripts. The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence for
    /// that call.
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            label: "scripted-mock".into(),
            model: "scripted-mock-model".into(),
            input_limit: None,
            retries: 3,
            native_search: false,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Declare an input-token window so compaction paths can be exercised.
    pub fn with_input_limit(mut self, limit: u32) -> Self {
        self.input_limit = Some(limit);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_native_search(mut self) -> Self {
        self.native_search = true;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ScriptStep::Event(ProviderEvent::TextDelta(r)),
            ScriptStep::Event(ProviderEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
                cached_tokens: 0,
            }),
            ScriptStep::Event(ProviderEvent::Done),
        ]])
    }

    /// Convenience: provider that returns a tool call followed by a text
    /// reply on the next round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Round 1 – model emits a tool call
            vec![
                ScriptStep::Event(ProviderEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                }),
                ScriptStep::Event(ProviderEvent::Done),
            ],
            // Round 2 – model responds after the tool result
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta(final_text.into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
        ])
    }

    /// Convenience: a transient failure on the first call, then a text reply.
    pub fn fail_once_then_text(final_text: impl Into<String>) -> Self {
        Self::new(vec![
            vec![ScriptStep::Fail(ProviderError::transient("connection reset"))],
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta(final_text.into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
        ])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> String {
        format!("{} ({})", self.label, self.model)
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn input_token_limit(&self) -> Option<u32> {
        self.input_limit
    }
    fn max_retries(&self) -> u32 {
        self.retries
    }
    fn supports_native_search(&self) -> bool {
        self.native_search
    }

    async fn stream(&self, req: Request) -> Result<EventStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let steps = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ScriptStep::Event(ProviderEvent::TextDelta("[no more scripts]".into())),
                    ScriptStep::Event(ProviderEvent::Done),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let items: Vec<Result<ProviderEvent, ProviderError>> = steps
            .into_iter()
            .map(|s| match s {
                ScriptStep::Event(ev) => Ok(ev),
                ScriptStep::Fail(e) => Err(e),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
