// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use quill_config::{CompactionConfig, EngineConfig};
use quill_model::{Message, Part, Provider, ProviderError, ProviderEvent, Request, Role};
use quill_tools::{
    extract_diff_marker, ToolCall, ToolOutput, ToolRegistry, ASK_USER_TOOL, EDIT_FILE_TOOL,
    WEB_SEARCH_TOOL,
};

use crate::compact::{compaction_request_messages, split_point};
use crate::events::{StreamEvent, TurnMetrics};
use crate::telemetry::StreamTelemetry;

/// Invoked once the assistant's textual response for a turn is finalised,
/// before any tool execution, so the message is durable even if a tool
/// crashes the process. Receives `(turn_index, assistant_message, metrics)`.
pub type ResponseCompletedFn =
    dyn Fn(u32, &Message, &TurnMetrics) -> anyhow::Result<()> + Send + Sync;

/// Invoked at the end of each turn with the messages not yet covered by the
/// response callback: the tool-result message (plus any interjection), or
/// the assistant message itself on a tool-free turn.
pub type TurnCompletedFn =
    dyn Fn(u32, &[Message], &TurnMetrics) -> anyhow::Result<()> + Send + Sync;

/// Invoked when compaction produced a replacement history. The callback
/// must replace the stored messages transactionally.
pub type CompactionFn = dyn Fn(&[Message]) -> anyhow::Result<()> + Send + Sync;

/// Shared slot holding at most one queued user interjection.
///
/// The driver holds a clone so it can enqueue (and, on cancellation,
/// recover) an instruction while the engine worker owns the engine itself.
#[derive(Clone, Default)]
pub struct InterjectionSlot(Arc<Mutex<Option<String>>>);

impl InterjectionSlot {
    /// Queue `text` for injection after the current turn's tool results.
    /// A second call before the slot drains replaces the first.
    pub fn set(&self, text: impl Into<String>) {
        let mut slot = self.0.lock().expect("interjection lock poisoned");
        *slot = Some(text.into());
    }

    /// Atomically remove and return the pending interjection.
    pub fn drain(&self) -> Option<String> {
        self.0.lock().expect("interjection lock poisoned").take()
    }

    pub fn is_pending(&self) -> bool {
        self.0.lock().expect("interjection lock poisoned").is_some()
    }
}

/// The conversation engine. Owns the in-memory history and drives the
/// model ↔ tool loop for one session.
pub struct Engine {
    provider: Arc<dyn Provider>,
    provider_label: String,
    model: String,
    tools: Arc<ToolRegistry>,
    session_id: String,
    system_prompt: Option<String>,
    history: Vec<Message>,
    /// Input-token window of the current model; 0 disables compaction.
    input_limit: usize,
    compaction: CompactionConfig,
    max_turns: u32,
    parallel_tool_calls: bool,
    parallel_limit: usize,
    search_flag: bool,
    force_external_search: bool,
    interjection: InterjectionSlot,
    /// Server-side conversation state (provider-specific key). Cleared by
    /// [`Engine::reset_conversation`].
    server_conversation: Option<String>,
    compactions_run: u64,
    on_response_completed: Option<Arc<ResponseCompletedFn>>,
    on_turn_completed: Option<Arc<TurnCompletedFn>>,
    on_compaction: Option<Arc<CompactionFn>>,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: &EngineConfig,
        session_id: impl Into<String>,
    ) -> Self {
        let input_limit = provider.input_token_limit().unwrap_or(0) as usize;
        Self {
            provider_label: provider.name(),
            model: provider.model_name().to_string(),
            provider,
            tools,
            session_id: session_id.into(),
            system_prompt: None,
            history: Vec::new(),
            input_limit,
            compaction: config.compaction.clone(),
            max_turns: config.max_turns,
            parallel_tool_calls: config.parallel_tool_calls,
            parallel_limit: config.parallel_tool_limit.max(1),
            search_flag: false,
            force_external_search: false,
            interjection: InterjectionSlot::default(),
            server_conversation: None,
            compactions_run: 0,
            on_response_completed: None,
            on_turn_completed: None,
            on_compaction: None,
        }
    }

    /// Refresh the provider handle, display info, and compaction limits.
    /// Called every turn by the driver so mid-session model switches take
    /// effect without rebuilding the engine.
    pub fn configure_context_management(
        &mut self,
        provider: Arc<dyn Provider>,
        provider_label: impl Into<String>,
        model: impl Into<String>,
        compaction: CompactionConfig,
    ) {
        self.input_limit = provider.input_token_limit().unwrap_or(0) as usize;
        self.provider = provider;
        self.provider_label = provider_label.into();
        self.model = model.into();
        self.compaction = compaction;
    }

    /// Override the input-token window (config-declared limits win over the
    /// provider's own declaration).
    pub fn set_input_limit(&mut self, limit: usize) {
        self.input_limit = limit;
    }

    pub fn set_search(&mut self, search_flag: bool, force_external: bool) {
        self.search_flag = search_flag;
        self.force_external_search = force_external;
    }

    pub fn set_system_prompt(&mut self, prompt: Option<String>) {
        self.system_prompt = prompt;
    }

    pub fn set_response_completed_callback(&mut self, cb: Arc<ResponseCompletedFn>) {
        self.on_response_completed = Some(cb);
    }

    pub fn set_turn_completed_callback(&mut self, cb: Arc<TurnCompletedFn>) {
        self.on_turn_completed = Some(cb);
    }

    pub fn set_compaction_callback(&mut self, cb: Arc<CompactionFn>) {
        self.on_compaction = Some(cb);
    }

    /// Queue a user instruction to be appended after the current turn's tool
    /// results and before the next turn begins.
    pub fn interject(&self, text: impl Into<String>) {
        self.interjection.set(text);
    }

    /// Atomically remove and return the pending interjection. Used on
    /// cancellation to recover the text into the composer.
    pub fn drain_interjection(&self) -> Option<String> {
        self.interjection.drain()
    }

    /// A clonable handle the driver keeps so interjections can be queued
    /// while the engine worker owns `self`.
    pub fn interjection_slot(&self) -> InterjectionSlot {
        self.interjection.clone()
    }

    /// Clear per-session provider state and compaction bookkeeping.
    pub fn reset_conversation(&mut self) {
        self.server_conversation = None;
        self.compactions_run = 0;
        self.history.clear();
    }

    /// Pre-load history (resume flow) without submitting. System messages
    /// are dropped; the engine re-injects its own prompt per request.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        self.history = messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// How many times this session's history has been compacted.
    pub fn compactions_run(&self) -> u64 {
        self.compactions_run
    }

    pub fn provider_label(&self) -> &str {
        &self.provider_label
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Push a user message and drive the turn loop, streaming events through
    /// `tx`. Dropping the sender half of `cancel` (or sending `()`) aborts
    /// the run at the next await point.
    pub async fn submit(
        &mut self,
        user_message: Message,
        tx: mpsc::Sender<StreamEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        // Pre-submit compaction so a long resumed history does not overflow
        // on the very first turn.
        self.maybe_compact(&tx, &mut cancel).await;
        self.history.push(user_message);
        self.run_loop(tx, cancel).await
    }

    async fn run_loop(
        &mut self,
        tx: mpsc::Sender<StreamEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut turn_index = 0u32;
        let mut total_tokens = 0u64;

        loop {
            // Treat both an explicit send(()) and a dropped sender as a
            // cancellation signal; a plain `is_ok()` would miss the drop.
            match cancel.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => {
                    let _ = tx.send(StreamEvent::Done { total_tokens }).await;
                    return Ok(());
                }
            }

            turn_index += 1;
            let turn_started = std::time::Instant::now();
            let mut metrics = TurnMetrics {
                llm_turns: 1,
                ..Default::default()
            };

            let turn = self
                .stream_one_turn(&tx, &mut cancel, None, true, true)
                .await;

            let outcome = match turn {
                TurnResult::Completed(o) => o,
                TurnResult::Cancelled { partial_text } => {
                    if !partial_text.is_empty() {
                        let partial = Message::assistant(&partial_text);
                        self.history.push(partial.clone());
                        self.fire_turn_completed(turn_index, std::slice::from_ref(&partial), &metrics);
                    }
                    let _ = tx.send(StreamEvent::Done { total_tokens }).await;
                    return Ok(());
                }
                TurnResult::Failed => {
                    let _ = tx.send(StreamEvent::Done { total_tokens }).await;
                    return Ok(());
                }
            };

            metrics.input_tokens += outcome.usage.0;
            metrics.output_tokens += outcome.usage.1;
            metrics.cached_input_tokens += outcome.usage.2;
            total_tokens += outcome.usage.0 + outcome.usage.1 + outcome.usage.2;

            // Assemble the assistant message: text first, then the tool
            // calls in provider order.
            let mut parts: Vec<Part> = Vec::new();
            if !outcome.text.is_empty() {
                parts.push(Part::text(&outcome.text));
            }
            for tc in &outcome.tool_calls {
                parts.push(Part::tool_call(&tc.id, &tc.name, tc.args.clone()));
            }
            let mut assistant = Message::new(Role::Assistant, parts);
            assistant.duration_ms = Some(turn_started.elapsed().as_millis() as i64);

            if outcome.tool_calls.is_empty() || turn_index >= self.max_turns {
                // Tool-free (or budget-exhausted) turn: the assistant message
                // travels in the turn callback; no response callback fires.
                let final_messages: Vec<Message> = if assistant.parts.is_empty() {
                    Vec::new()
                } else {
                    self.history.push(assistant.clone());
                    vec![assistant]
                };
                let _ = tx.send(StreamEvent::Done { total_tokens }).await;
                self.fire_turn_completed(turn_index, &final_messages, &metrics);
                return Ok(());
            }

            // Persist the assistant message before any tool runs.
            self.fire_response_completed(turn_index, &assistant, &metrics);
            self.history.push(assistant);

            let (outputs, cancelled) = self
                .dispatch_tools(&outcome.tool_calls, &tx, &mut cancel)
                .await;
            metrics.tool_calls = outcome.tool_calls.len() as u64;

            if cancelled {
                let _ = tx.send(StreamEvent::Done { total_tokens }).await;
                return Ok(());
            }

            // One tool-role message, results ordered by call position.
            let result_parts: Vec<Part> = outcome
                .tool_calls
                .iter()
                .zip(outputs.iter())
                .map(|(tc, out)| Part::tool_result(&tc.id, &tc.name, &out.content, out.is_error))
                .collect();
            let tool_message = Message::tool_results(result_parts);
            self.history.push(tool_message.clone());

            let mut new_messages = vec![tool_message];
            if let Some(text) = self.interjection.drain() {
                let interjection = Message::user(text);
                self.history.push(interjection.clone());
                new_messages.push(interjection);
            }

            self.fire_turn_completed(turn_index, &new_messages, &metrics);

            self.maybe_compact(&tx, &mut cancel).await;
        }
    }

    fn fire_response_completed(&self, turn: u32, msg: &Message, metrics: &TurnMetrics) {
        if let Some(cb) = &self.on_response_completed {
            if let Err(e) = cb(turn, msg, metrics) {
                warn!(turn, error = %e, "response-completed callback failed");
            }
        }
    }

    fn fire_turn_completed(&self, turn: u32, msgs: &[Message], metrics: &TurnMetrics) {
        if let Some(cb) = &self.on_turn_completed {
            if let Err(e) = cb(turn, msgs, metrics) {
                warn!(turn, error = %e, "turn-completed callback failed");
            }
        }
    }

    fn build_request(&self, messages_override: Option<Vec<Message>>, with_tools: bool) -> Request {
        let messages = messages_override.unwrap_or_else(|| {
            let mut msgs = Vec::with_capacity(self.history.len() + 1);
            if let Some(sp) = &self.system_prompt {
                msgs.push(Message::system(sp.clone()));
            }
            msgs.extend(self.history.iter().cloned());
            msgs
        });
        let tools = if with_tools { self.tools.specs() } else { Vec::new() };
        if self.force_external_search
            && !self.provider.supports_native_search()
            && !self.tools.contains(WEB_SEARCH_TOOL)
        {
            warn!("external search forced but no '{WEB_SEARCH_TOOL}' tool is registered");
        }
        let mut hints = HashMap::new();
        if let Some(conv) = &self.server_conversation {
            hints.insert("conversation".to_string(), serde_json::json!(conv));
        }
        Request {
            session_id: self.session_id.clone(),
            messages,
            tools,
            search: self.search_flag && !self.force_external_search,
            force_external_search: self.force_external_search,
            parallel_tool_calls: self.parallel_tool_calls,
            max_turns: self.max_turns,
            hints,
        }
    }

    /// One provider round-trip with retry handling. Returns the accumulated
    /// text, tool calls (ordered by provider index), and usage.
    async fn stream_one_turn(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &mut oneshot::Receiver<()>,
        messages_override: Option<Vec<Message>>,
        with_tools: bool,
        forward: bool,
    ) -> TurnResult {
        let max_retries = self.provider.max_retries();
        let mut attempt = 0u32;

        loop {
            let req = self.build_request(messages_override.clone(), with_tools);
            let opened = tokio::select! {
                biased;
                _ = &mut *cancel => {
                    return TurnResult::Cancelled { partial_text: String::new() };
                }
                result = self.provider.stream(req) => result,
            };

            let stream = match opened {
                Ok(s) => s,
                Err(ProviderError::Cancelled) => {
                    return TurnResult::Cancelled { partial_text: String::new() };
                }
                Err(e) if e.is_retriable() && attempt < max_retries => {
                    attempt += 1;
                    if !self.wait_before_retry(&e, attempt, max_retries, tx, cancel).await {
                        return TurnResult::Cancelled { partial_text: String::new() };
                    }
                    continue;
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    return TurnResult::Failed;
                }
            };

            match self.consume_stream(stream, tx, cancel, forward).await {
                Consumed::Finished(outcome) => return TurnResult::Completed(outcome),
                Consumed::Cancelled { partial_text } => {
                    return TurnResult::Cancelled { partial_text };
                }
                Consumed::Failed { error, had_content } => {
                    // Retry only when nothing was delivered yet; replaying a
                    // stream that already produced output would duplicate it.
                    if error.is_retriable() && !had_content && attempt < max_retries {
                        attempt += 1;
                        if !self
                            .wait_before_retry(&error, attempt, max_retries, tx, cancel)
                            .await
                        {
                            return TurnResult::Cancelled { partial_text: String::new() };
                        }
                        continue;
                    }
                    let _ = tx.send(StreamEvent::Error(error.to_string())).await;
                    return TurnResult::Failed;
                }
            }
        }
    }

    /// Emit a `Retry` event and sleep the backoff, racing cancellation.
    /// Returns `false` when cancelled.
    async fn wait_before_retry(
        &self,
        error: &ProviderError,
        attempt: u32,
        max: u32,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> bool {
        let wait = error
            .retry_after()
            .unwrap_or_else(|| Duration::from_secs(2u64.pow(attempt.min(5)).min(30)));
        debug!(attempt, max, wait_secs = wait.as_secs(), "provider retry");
        let _ = tx
            .send(StreamEvent::Retry { attempt, max, wait })
            .await;
        tokio::select! {
            biased;
            _ = &mut *cancel => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn consume_stream(
        &self,
        mut stream: quill_model::EventStream,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &mut oneshot::Receiver<()>,
        forward: bool,
    ) -> Consumed {
        let mut telemetry = StreamTelemetry::from_env();
        let mut text = String::new();
        let mut usage = (0u64, 0u64, 0u64);
        // Keyed by the parallel-tool-call index from the provider; chunks
        // for different calls may interleave.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut had_content = false;

        loop {
            let item = tokio::select! {
                biased;
                _ = &mut *cancel => {
                    return Consumed::Cancelled { partial_text: text };
                }
                item = stream.next() => item,
            };

            let event = match item {
                None => break,
                Some(Ok(ev)) => ev,
                Some(Err(error)) => {
                    return Consumed::Failed { error, had_content };
                }
            };

            match event {
                ProviderEvent::TextDelta(delta) if !delta.is_empty() => {
                    telemetry.record_event("text", delta.len());
                    had_content = true;
                    text.push_str(&delta);
                    if forward {
                        let _ = tx.send(StreamEvent::Text(delta)).await;
                    }
                }
                ProviderEvent::TextDelta(_) => {}
                ProviderEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    telemetry.record_event("tool_call", arguments.len());
                    had_content = true;
                    let ptc = pending.entry(index).or_default();
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ProviderEvent::WebSearch { query } => {
                    telemetry.record_event("web_search", query.len());
                    if forward {
                        let call_id = format!("native-search-{}", uuid::Uuid::new_v4());
                        let _ = tx
                            .send(StreamEvent::ToolExecStart {
                                call_id: call_id.clone(),
                                name: WEB_SEARCH_TOOL.into(),
                                info: query.clone(),
                            })
                            .await;
                        let _ = tx
                            .send(StreamEvent::ToolExecEnd {
                                call_id,
                                name: WEB_SEARCH_TOOL.into(),
                                info: query,
                                success: true,
                            })
                            .await;
                    }
                }
                ProviderEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cached_tokens,
                } => {
                    telemetry.record_event("usage", 0);
                    usage.0 += input_tokens;
                    usage.1 += output_tokens;
                    usage.2 += cached_tokens;
                    if forward {
                        let _ = tx
                            .send(StreamEvent::Usage {
                                input_tokens,
                                output_tokens,
                                cached_tokens,
                            })
                            .await;
                    }
                }
                ProviderEvent::Done => break,
            }
        }

        telemetry.finish_turn(usage.0 + usage.2, usage.1);

        // Flush accumulated tool calls ordered by provider index. Calls with
        // an empty name cannot be dispatched and are dropped; an empty id
        // gets a synthetic fallback so the turn can still complete.
        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::with_capacity(sorted.len());
        for (i, (_, ptc)) in sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc-synthetic-{i}");
                warn!(tool = %tc.name, "tool call had empty id; generated synthetic id");
            }
            tool_calls.push(tc);
        }

        Consumed::Finished(TurnOutcome {
            text,
            tool_calls,
            usage,
        })
    }

    /// Execute the turn's tool calls and stream exec events. Outputs are
    /// returned ordered by call position regardless of completion order.
    async fn dispatch_tools(
        &self,
        calls: &[ToolCall],
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> (Vec<ToolOutput>, bool) {
        let mut outputs: Vec<ToolOutput> = Vec::with_capacity(calls.len());

        if self.parallel_tool_calls && calls.len() > 1 {
            for call in calls {
                let _ = tx
                    .send(StreamEvent::ToolExecStart {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        info: summarize_args(&call.args),
                    })
                    .await;
            }
            let semaphore = Arc::new(Semaphore::new(self.parallel_limit));
            let mut handles = Vec::with_capacity(calls.len());
            for call in calls.iter().cloned() {
                let registry = Arc::clone(&self.tools);
                let semaphore = Arc::clone(&semaphore);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    registry.execute(&call).await
                }));
            }
            // Await in call order, so events and results keep that order.
            let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
            for (i, handle) in handles.into_iter().enumerate() {
                let joined = tokio::select! {
                    biased;
                    _ = &mut *cancel => {
                        for abort in &aborts {
                            abort.abort();
                        }
                        return (outputs, true);
                    }
                    joined = handle => joined,
                };
                let output = match joined {
                    Ok(o) => o,
                    Err(e) => ToolOutput::err(&calls[i].id, format!("tool panicked: {e}")),
                };
                self.emit_tool_end(&calls[i], &output, tx).await;
                outputs.push(output);
            }
        } else {
            for call in calls {
                let _ = tx
                    .send(StreamEvent::ToolExecStart {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        info: summarize_args(&call.args),
                    })
                    .await;
                let output = tokio::select! {
                    biased;
                    _ = &mut *cancel => return (outputs, true),
                    output = self.tools.execute(call) => output,
                };
                self.emit_tool_end(call, &output, tx).await;
                outputs.push(output);
            }
        }

        (outputs, false)
    }

    async fn emit_tool_end(
        &self,
        call: &ToolCall,
        output: &ToolOutput,
        tx: &mpsc::Sender<StreamEvent>,
    ) {
        let _ = tx
            .send(StreamEvent::ToolExecEnd {
                call_id: call.id.clone(),
                name: call.name.clone(),
                info: summarize_args(&call.args),
                success: !output.is_error,
            })
            .await;
        if call.name == ASK_USER_TOOL && !output.is_error {
            let _ = tx
                .send(StreamEvent::AskUserResult {
                    summary: output.content.clone(),
                })
                .await;
        }
        for path in output.image_paths() {
            let _ = tx.send(StreamEvent::Image { path: path.clone() }).await;
        }
        // Only the file-edit tool may carry the embedded diff marker.
        if call.name == EDIT_FILE_TOOL {
            if let Some(diff) = extract_diff_marker(&output.content) {
                let _ = tx
                    .send(StreamEvent::Diff {
                        path: diff.file,
                        old: diff.old,
                        new: diff.new,
                        line: diff.line,
                    })
                    .await;
            }
        }
    }

    /// Token estimate for the next request: history plus system prompt plus
    /// tool schema overhead, chars/4.
    fn projected_input_tokens(&self) -> usize {
        let history: usize = self.history.iter().map(|m| m.approx_tokens()).sum();
        let system = self
            .system_prompt
            .as_ref()
            .map(|s| s.len() / 4)
            .unwrap_or(0);
        let schemas: usize = self
            .tools
            .specs()
            .iter()
            .map(|s| (s.name.len() + s.description.len() + s.schema.to_string().len()) / 4)
            .sum();
        history + system + schemas
    }

    /// Run compaction when the projected next-turn input exceeds the
    /// configured fraction of the model's window. Failures surface as an
    /// `Error` event and leave the history untouched.
    async fn maybe_compact(
        &mut self,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) {
        if !self.compaction.enabled || self.input_limit == 0 {
            return;
        }
        let projected = self.projected_input_tokens();
        let threshold = (self.compaction.threshold * self.input_limit as f32) as usize;
        if projected <= threshold {
            return;
        }

        let split = split_point(&self.history, self.compaction.keep_recent);
        if split == 0 {
            warn!(
                projected,
                threshold, "over compaction threshold but nothing to summarise"
            );
            return;
        }

        let to_summarize = self.history[..split].to_vec();
        let recent = self.history[split..].to_vec();
        // The compaction request carries only the old region plus the
        // instruction; the system prompt is preserved verbatim outside it.
        let request_messages = compaction_request_messages(&to_summarize);

        let result = self
            .stream_one_turn(tx, cancel, Some(request_messages), false, false)
            .await;

        match result {
            TurnResult::Completed(outcome) if !outcome.text.is_empty() => {
                let mut new_history = Vec::with_capacity(recent.len() + 1);
                new_history.push(Message::assistant(&outcome.text));
                new_history.extend(recent);
                self.history = new_history;
                self.compactions_run += 1;
                debug!(
                    summarized = split,
                    kept = self.history.len(),
                    "history compacted"
                );
                if let Some(cb) = &self.on_compaction {
                    if let Err(e) = cb(&self.history) {
                        let _ = tx
                            .send(StreamEvent::Error(format!(
                                "failed to persist compacted history: {e}"
                            )))
                            .await;
                    }
                }
            }
            TurnResult::Completed(_) => {
                let _ = tx
                    .send(StreamEvent::Error(
                        "compaction produced an empty summary; history unchanged".into(),
                    ))
                    .await;
            }
            TurnResult::Cancelled { .. } => {}
            TurnResult::Failed => {
                // The provider error event was already emitted by
                // stream_one_turn; the original history remains intact.
            }
        }
    }
}

enum TurnResult {
    Completed(TurnOutcome),
    Cancelled { partial_text: String },
    /// An `Error` event has already been emitted.
    Failed,
}

struct TurnOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    /// (input, output, cached)
    usage: (u64, u64, u64),
}

enum Consumed {
    Finished(TurnOutcome),
    Cancelled { partial_text: String },
    Failed {
        error: ProviderError,
        had_content: bool,
    },
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        // Always resolve to a JSON object: providers reject a `null` tool
        // input on the next request, which would poison the whole session.
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match repair_json(&self.args_buf) {
                    Some(v) => {
                        warn!(tool = %self.name, "repaired invalid JSON arguments from model");
                        v
                    }
                    None => {
                        warn!(
                            tool = %self.name,
                            error = %parse_err,
                            "invalid JSON tool arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}

/// Attempt to repair common JSON syntax errors in streamed tool arguments:
/// invalid escape sequences inside strings, and truncation that dropped the
/// closing quote/brace.
fn repair_json(raw: &str) -> Option<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(raw);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }
    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed;
        if completed.chars().filter(|&c| c == '"').count() % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }
    None
}

/// Replace invalid escape sequences inside string values with an escaped
/// backslash so serde_json can parse. Valid JSON escapes are
/// `" \ / b f n r t u`; anything else becomes `\\X`.
fn fix_invalid_json_escapes(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len() + 16);
    let mut chars = raw.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Compact single-line rendering of tool arguments for status display.
fn summarize_args(args: &serde_json::Value) -> String {
    let mut s = args.to_string();
    if s.len() > 96 {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < 93)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        s.truncate(cut);
        s.push('…');
    }
    s
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interjection_slot_holds_at_most_one() {
        let slot = InterjectionSlot::default();
        assert!(!slot.is_pending());
        slot.set("first");
        slot.set("second");
        assert_eq!(slot.drain().as_deref(), Some("second"));
        assert!(slot.drain().is_none());
    }

    #[test]
    fn pending_tool_call_empty_args_becomes_object() {
        let ptc = PendingToolCall {
            id: "c1".into(),
            name: "shell".into(),
            args_buf: String::new(),
        };
        let tc = ptc.finish();
        assert_eq!(tc.args, serde_json::json!({}));
    }

    #[test]
    fn pending_tool_call_parses_accumulated_json() {
        let ptc = PendingToolCall {
            id: "c1".into(),
            name: "shell".into(),
            args_buf: r#"{"cmd":"ls"}"#.into(),
        };
        assert_eq!(ptc.finish().args, serde_json::json!({"cmd": "ls"}));
    }

    #[test]
    fn repair_fixes_invalid_escape() {
        let v = repair_json(r#"{"path":"C:\projects\x"}"#).unwrap();
        assert_eq!(v["path"], "C:\\projects\\x");
    }

    #[test]
    fn repair_completes_truncated_object() {
        let v = repair_json(r#"{"cmd":"ls -la"#).unwrap();
        assert_eq!(v["cmd"], "ls -la");
    }

    #[test]
    fn repair_gives_up_on_garbage() {
        assert!(repair_json("not json at all").is_none());
    }

    #[test]
    fn summarize_args_truncates_long_values() {
        let long = serde_json::json!({"text": "x".repeat(300)});
        let s = summarize_args(&long);
        assert!(s.len() < 120);
        assert!(s.ends_with('…'));
    }
}
