// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! TUI driver: the cooperative event loop that owns all component
//! mutations. Inputs are key/mouse/resize events, timer ticks, and engine
//! stream events bridged in through the stream adapter's receiver.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseEventKind};
use futures::StreamExt;
use ratatui::widgets::{Paragraph, Widget};
use ratatui::DefaultTerminal;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use quill_config::Config;
use quill_core::{Engine, InterjectionSlot, StreamAdapter, StreamEvent, TurnMetrics};
use quill_model::{Message, Part, Role};
use quill_store::{MetricsDelta, Session, SessionStatus, SessionStore};

use crate::attach::{
    append_attachments, read_attachment, ApprovedDirs, Clipboard, NoClipboard, MAX_IMAGE_BYTES,
};
use crate::layout::AppLayout;
use crate::markdown::{render_markdown, StyledLines};
use crate::renderer::{render_message, ChatRenderer, RenderMode, RendererEvent};
use crate::tracker::WaveCmd;
use crate::widgets;

/// Minimum interval between streaming re-renders (alt-screen throttle).
const STREAM_RENDER_MIN_INTERVAL: Duration = Duration::from_millis(33);
/// Minimum interval between scrollback flushes in inline mode.
const FLUSH_MIN_INTERVAL: Duration = Duration::from_millis(100);
const WAVE_TICK_INTERVAL: Duration = Duration::from_millis(80);
const WAVE_PAUSE_INTERVAL: Duration = Duration::from_millis(500);

pub type CancelSlot = Arc<tokio::sync::Mutex<Option<oneshot::Sender<()>>>>;

/// Requests from the driver to the background engine worker.
pub enum EngineRequest {
    Submit(Message),
    LoadHistory(Vec<Message>),
}

/// Background task that owns the engine and streams events back through
/// the adapter's sender. A fresh cancel channel is armed per submission;
/// the driver fires it to interrupt the running turn.
pub async fn engine_task(
    mut engine: Engine,
    mut rx: mpsc::Receiver<EngineRequest>,
    events: mpsc::Sender<StreamEvent>,
    cancel_slot: CancelSlot,
) {
    while let Some(req) = rx.recv().await {
        match req {
            EngineRequest::Submit(message) => {
                debug!(len = message.extracted_text.len(), "engine task received message");
                let (cancel_tx, cancel_rx) = oneshot::channel();
                *cancel_slot.lock().await = Some(cancel_tx);
                let result = engine.submit(message, events.clone(), cancel_rx).await;
                cancel_slot.lock().await.take();
                if let Err(e) = result {
                    let _ = events.send(StreamEvent::Error(format!("{e:#}"))).await;
                }
            }
            EngineRequest::LoadHistory(messages) => {
                debug!(n = messages.len(), "engine task loading history");
                engine.seed_history(messages);
            }
        }
    }
}

/// Wire the engine's persistence callbacks to the store and the driver's
/// shared message list.
///
/// The turn callback carries metrics exactly once per turn, so metrics are
/// only written there; the response callback persists the assistant
/// message early (before tool execution) without touching counters. The
/// compaction callback replaces stored messages transactionally and swaps
/// the shared in-memory list under its mutex.
pub fn wire_persistence(
    engine: &mut Engine,
    store: Arc<dyn SessionStore>,
    session_id: String,
    messages: Arc<Mutex<Vec<Message>>>,
) {
    {
        let store = Arc::clone(&store);
        let session_id = session_id.clone();
        let messages = Arc::clone(&messages);
        engine.set_response_completed_callback(Arc::new(
            move |_turn, assistant: &Message, _metrics: &TurnMetrics| {
                let mut msg = assistant.clone();
                store.add_message(&session_id, &mut msg)?;
                messages
                    .lock()
                    .expect("message list lock poisoned")
                    .push(msg);
                Ok(())
            },
        ));
    }
    {
        let store = Arc::clone(&store);
        let session_id = session_id.clone();
        let messages = Arc::clone(&messages);
        engine.set_turn_completed_callback(Arc::new(
            move |_turn, new_messages: &[Message], metrics: &TurnMetrics| {
                for message in new_messages {
                    let mut msg = message.clone();
                    store.add_message(&session_id, &mut msg)?;
                    messages
                        .lock()
                        .expect("message list lock poisoned")
                        .push(msg);
                }
                store.update_metrics(
                    &session_id,
                    &MetricsDelta {
                        llm_turns: metrics.llm_turns,
                        tool_calls: metrics.tool_calls,
                        input_tokens: metrics.input_tokens,
                        output_tokens: metrics.output_tokens,
                        cached_input_tokens: metrics.cached_input_tokens,
                    },
                )?;
                Ok(())
            },
        ));
    }
    {
        engine.set_compaction_callback(Arc::new(move |new_history: &[Message]| {
            let mut msgs = new_history.to_vec();
            store.replace_messages(&session_id, &mut msgs)?;
            *messages.lock().expect("message list lock poisoned") = msgs;
            Ok(())
        }));
    }
}

pub struct AppOptions {
    pub initial_prompt: Option<String>,
    pub inline: bool,
    pub clipboard: Option<Box<dyn Clipboard>>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            initial_prompt: None,
            inline: true,
            clipboard: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WavePhase {
    Idle,
    Ticking,
    Paused,
}

pub struct App {
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
    session: Session,
    messages: Arc<Mutex<Vec<Message>>>,
    renderer: ChatRenderer,

    composer: String,
    cursor: usize,
    attachments: Vec<(String, String)>,
    image_attachments: Vec<(String, Vec<u8>)>,
    approved: ApprovedDirs,
    approved_path: PathBuf,
    clipboard: Box<dyn Clipboard>,

    engine_tx: mpsc::Sender<EngineRequest>,
    event_rx: Option<mpsc::Receiver<StreamEvent>>,
    interjection: InterjectionSlot,
    interjection_preview: Option<String>,
    cancel_slot: CancelSlot,

    busy: bool,
    cancelled: bool,
    error_banner: Option<String>,
    status_note: Option<String>,
    current_tool: Option<String>,
    context_tokens: u64,
    initial_prompt: Option<String>,

    // Smooth-typing buffer: deltas accumulate here and drain at a fixed
    // pace so display cadence is independent of network burstiness.
    typing_buffer: String,
    newline_run: usize,

    wave_phase: WavePhase,
    wave_deadline: Option<Instant>,
    last_flush: Instant,
    last_draw: Instant,
    last_drawn_version: u64,
    render_pending: bool,
    force_draw: bool,

    width: u16,
    height: u16,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SessionStore>,
        session: Session,
        messages: Arc<Mutex<Vec<Message>>>,
        engine_tx: mpsc::Sender<EngineRequest>,
        event_rx: mpsc::Receiver<StreamEvent>,
        interjection: InterjectionSlot,
        cancel_slot: CancelSlot,
        opts: AppOptions,
    ) -> Self {
        let mode = if opts.inline {
            RenderMode::Inline
        } else {
            RenderMode::Alt
        };
        let approved_path = ApprovedDirs::default_path();
        let approved = ApprovedDirs::load(&approved_path);
        Self {
            renderer: ChatRenderer::new(mode, 80, 24, Arc::clone(&messages)),
            config,
            store,
            session,
            messages,
            composer: String::new(),
            cursor: 0,
            attachments: Vec::new(),
            image_attachments: Vec::new(),
            approved,
            approved_path,
            clipboard: opts.clipboard.unwrap_or_else(|| Box::new(NoClipboard)),
            engine_tx,
            event_rx: Some(event_rx),
            interjection,
            interjection_preview: None,
            cancel_slot,
            busy: false,
            cancelled: false,
            error_banner: None,
            status_note: None,
            current_tool: None,
            context_tokens: 0,
            initial_prompt: opts.initial_prompt,
            typing_buffer: String::new(),
            newline_run: 0,
            wave_phase: WavePhase::Idle,
            wave_deadline: None,
            last_flush: Instant::now(),
            last_draw: Instant::now(),
            last_drawn_version: 0,
            render_pending: false,
            force_draw: true,
            width: 80,
            height: 24,
        }
    }

    /// Build the adapter + channels + worker for an engine and return the
    /// pieces the app needs. The engine worker runs until the request
    /// channel closes.
    pub fn spawn_engine(engine: Engine) -> (
        mpsc::Sender<EngineRequest>,
        mpsc::Receiver<StreamEvent>,
        InterjectionSlot,
        CancelSlot,
    ) {
        let mut adapter = StreamAdapter::default();
        let events_tx = adapter.sender();
        let events_rx = adapter.events().expect("fresh adapter");
        adapter.close();

        let slot = engine.interjection_slot();
        let cancel_slot: CancelSlot = Arc::new(tokio::sync::Mutex::new(None));
        let (req_tx, req_rx) = mpsc::channel(16);
        tokio::spawn(engine_task(engine, req_rx, events_tx, cancel_slot.clone()));
        (req_tx, events_rx, slot, cancel_slot)
    }

    pub async fn run(mut self, terminal: &mut DefaultTerminal) -> anyhow::Result<()> {
        if let Ok(size) = terminal.size() {
            self.width = size.width;
            self.height = size.height;
            self.renderer.set_size(size.width, size.height.saturating_sub(5));
        }

        // Resumed history: in inline mode it belongs to the scrollback.
        if self.renderer.mode() == RenderMode::Inline {
            let blocks: StyledLines = {
                let msgs = self.messages.lock().expect("message list lock poisoned");
                (0..msgs.len())
                    .flat_map(|i| render_message(&msgs, i, self.width))
                    .collect()
            };
            insert_scrollback(terminal, blocks)?;
        }

        if let Some(prompt) = self.initial_prompt.take() {
            self.submit_text(prompt, terminal).await;
        }

        let mut term_events = crossterm::event::EventStream::new();
        let mut event_rx = self.event_rx.take().expect("event receiver available");
        let mut engine_gone = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(33));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.maybe_draw(terminal)?;

            tokio::select! {
                maybe_event = event_rx.recv(), if !engine_gone => {
                    match maybe_event {
                        Some(event) => self.handle_stream_event(event, terminal).await?,
                        None => engine_gone = true,
                    }
                }
                maybe_term = term_events.next() => {
                    if let Some(Ok(event)) = maybe_term {
                        if self.handle_term_event(event, terminal).await? {
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.handle_tick(terminal)?;
                }
            }
        }

        Ok(())
    }

    // ── Drawing ───────────────────────────────────────────────────────────────

    fn maybe_draw(&mut self, terminal: &mut DefaultTerminal) -> anyhow::Result<()> {
        let version = self.renderer.streaming.version();
        let content_changed = version != self.last_drawn_version;
        if !content_changed && !self.force_draw {
            return Ok(());
        }
        // During streaming, viewport recomputation is rate-limited; a
        // suppressed update is caught up by the tick handler.
        if self.busy
            && !self.force_draw
            && self.last_draw.elapsed() < STREAM_RENDER_MIN_INTERVAL
        {
            self.render_pending = true;
            return Ok(());
        }
        self.force_draw = false;
        self.render_pending = false;
        self.last_drawn_version = version;
        self.last_draw = Instant::now();

        let mut chat_lines = self.renderer.render_frame();
        if self.renderer.scroll_offset() > 0 {
            chat_lines.insert(
                0,
                ratatui::text::Line::from(format!(
                    "↑ scrolled back {} message(s)",
                    self.renderer.scroll_offset()
                )),
            );
        }

        let banner = self.error_banner.clone();
        let interjection_note = self.interjection_preview.clone();
        let provider_label = self.session.provider_label.clone();
        let model = self.session.model.clone();
        let mode = self.session.mode;
        let number = self.session.number;
        let context_tokens = self.context_tokens;
        let busy = self.busy;
        let tool = self.status_note.clone().or_else(|| self.current_tool.clone());
        let ascii = self.config.tui.ascii;
        let composer = self.composer.clone();
        let cursor = self.cursor;

        terminal.draw(|frame| {
            let layout = AppLayout::new(frame, banner.is_some(), interjection_note.is_some());
            widgets::draw_chat(frame, layout.chat_pane, &chat_lines, 0);
            if let Some(ref msg) = banner {
                widgets::draw_banner(frame, layout.banner, msg);
            }
            if let Some(ref note) = interjection_note {
                widgets::draw_interjection_note(frame, layout.interjection, note);
            }
            widgets::draw_composer(frame, layout.composer, &composer, cursor, busy, ascii);
            widgets::draw_status(
                frame,
                layout.status_bar,
                &provider_label,
                &model,
                mode,
                number,
                context_tokens,
                busy,
                tool.as_deref(),
                ascii,
            );
        })?;
        Ok(())
    }

    // ── Stream events ─────────────────────────────────────────────────────────

    async fn handle_stream_event(
        &mut self,
        event: StreamEvent,
        terminal: &mut DefaultTerminal,
    ) -> anyhow::Result<()> {
        match event {
            StreamEvent::Text(delta) => {
                self.typing_buffer.push_str(&delta);
            }
            StreamEvent::ToolExecStart {
                call_id,
                name,
                info,
            } => {
                self.flush_typing_buffer();
                self.current_tool = Some(name.clone());
                self.renderer.handle_event(RendererEvent::StreamToolStart {
                    call_id,
                    name,
                    info,
                });
                if self.renderer.streaming.start_wave() {
                    self.wave_phase = WavePhase::Ticking;
                    self.wave_deadline = Some(Instant::now() + WAVE_TICK_INTERVAL);
                }
            }
            StreamEvent::ToolExecEnd {
                call_id, success, ..
            } => {
                self.current_tool = None;
                self.renderer
                    .handle_event(RendererEvent::StreamToolEnd { call_id, success });
            }
            StreamEvent::Image { path } => {
                self.flush_typing_buffer();
                self.renderer.handle_event(RendererEvent::StreamImage(path));
            }
            StreamEvent::Diff {
                path,
                old,
                new,
                line,
            } => {
                self.flush_typing_buffer();
                self.renderer.handle_event(RendererEvent::StreamDiff {
                    path,
                    old,
                    new,
                    line,
                });
            }
            StreamEvent::AskUserResult { summary } => {
                self.flush_typing_buffer();
                self.renderer
                    .handle_event(RendererEvent::StreamAskUserResult(summary));
            }
            StreamEvent::Usage {
                input_tokens,
                cached_tokens,
                ..
            } => {
                if input_tokens + cached_tokens > 0 {
                    self.context_tokens = input_tokens + cached_tokens;
                }
            }
            StreamEvent::Retry { attempt, max, wait } => {
                self.status_note = Some(format!(
                    "retrying ({attempt}/{max}, waiting {}s)",
                    wait.as_secs()
                ));
            }
            StreamEvent::Done { .. } => {
                self.flush_typing_buffer();
                self.status_note = None;
                self.current_tool = None;
                self.interjection_preview = None;

                if self.renderer.mode() == RenderMode::Inline {
                    let width = self.renderer.width();
                    if let Some(block) = self
                        .renderer
                        .streaming
                        .flush_all_remaining(width, &render_markdown)
                    {
                        insert_scrollback(terminal, block)?;
                    }
                }
                self.renderer.handle_event(RendererEvent::StreamEnded);
                self.busy = false;
                self.wave_phase = WavePhase::Idle;
                self.wave_deadline = None;

                // An interjection the turn never consumed returns to the
                // composer rather than silently vanishing.
                if let Some(text) = self.interjection.drain() {
                    if self.composer.is_empty() {
                        self.composer = text;
                        self.cursor = self.composer.len();
                    }
                }

                if !self.cancelled && self.error_banner.is_none() {
                    self.set_session_status(SessionStatus::Complete);
                }
                self.force_draw = true;
            }
            StreamEvent::Error(message) => {
                self.flush_typing_buffer();
                if !self.cancelled {
                    warn!(error = %message, "stream error");
                    self.error_banner = Some(message);
                    self.set_session_status(SessionStatus::Error);
                }
                self.force_draw = true;
            }
        }
        Ok(())
    }

    // ── Terminal events ───────────────────────────────────────────────────────

    async fn handle_term_event(
        &mut self,
        event: Event,
        terminal: &mut DefaultTerminal,
    ) -> anyhow::Result<bool> {
        match event {
            Event::Key(key) => return self.handle_key(key, terminal).await,
            Event::Mouse(mouse) => match mouse.kind {
                MouseEventKind::ScrollUp => {
                    self.renderer.handle_event(RendererEvent::ScrolledBy(1));
                    self.force_draw = true;
                }
                MouseEventKind::ScrollDown => {
                    self.renderer.handle_event(RendererEvent::ScrolledBy(-1));
                    self.force_draw = true;
                }
                _ => {}
            },
            Event::Resize(width, height) => {
                self.width = width;
                self.height = height;
                self.renderer.handle_event(RendererEvent::Resized {
                    width,
                    height: height.saturating_sub(5),
                });
                self.force_draw = true;
            }
            _ => {}
        }
        Ok(false)
    }

    async fn handle_key(
        &mut self,
        key: KeyEvent,
        terminal: &mut DefaultTerminal,
    ) -> anyhow::Result<bool> {
        match (key.code, key.modifiers) {
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
                if self.busy {
                    self.cancel_stream().await;
                }
                return Ok(true);
            }
            (KeyCode::Esc, _) => {
                if self.busy {
                    self.cancel_stream().await;
                } else if self.renderer.scroll_offset() > 0 {
                    self.renderer
                        .handle_event(RendererEvent::ScrolledBy(-(i32::MAX / 2)));
                }
                self.force_draw = true;
            }
            (KeyCode::Char('v'), KeyModifiers::CONTROL) => {
                self.paste_image(terminal)?;
            }
            (KeyCode::Enter, _) => {
                // A trailing backslash is a soft newline.
                if self.composer.ends_with('\\') {
                    self.composer.pop();
                    self.composer.push('\n');
                    self.cursor = self.composer.len();
                } else {
                    let text = std::mem::take(&mut self.composer);
                    self.cursor = 0;
                    self.submit_text(text, terminal).await;
                }
                self.force_draw = true;
            }
            (KeyCode::Backspace, _) => {
                if self.cursor > 0 {
                    let prev = floor_char_boundary(&self.composer, self.cursor - 1);
                    self.composer.remove(prev);
                    self.cursor = prev;
                }
                self.force_draw = true;
            }
            (KeyCode::Left, _) => {
                if self.cursor > 0 {
                    self.cursor = floor_char_boundary(&self.composer, self.cursor - 1);
                }
                self.force_draw = true;
            }
            (KeyCode::Right, _) => {
                if self.cursor < self.composer.len() {
                    self.cursor = ceil_char_boundary(&self.composer, self.cursor + 1);
                }
                self.force_draw = true;
            }
            (KeyCode::PageUp, _) => {
                self.renderer.handle_event(RendererEvent::ScrolledBy(3));
                self.force_draw = true;
            }
            (KeyCode::PageDown, _) => {
                self.renderer.handle_event(RendererEvent::ScrolledBy(-3));
                self.force_draw = true;
            }
            (KeyCode::Char(c), mods)
                if mods.is_empty() || mods == KeyModifiers::SHIFT =>
            {
                self.composer.insert(self.cursor, c);
                self.cursor += c.len_utf8();
                self.force_draw = true;
            }
            _ => {}
        }
        Ok(false)
    }

    // ── Submission ────────────────────────────────────────────────────────────

    async fn submit_text(&mut self, raw: String, terminal: &mut DefaultTerminal) {
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() && self.image_attachments.is_empty() {
            return;
        }

        // During streaming, the composer queues an interjection instead.
        if self.busy {
            self.interjection.set(trimmed.clone());
            self.interjection_preview = Some(trimmed);
            self.force_draw = true;
            return;
        }

        // `@path` tokens are file attachments; rejections become system
        // messages in the transcript.
        let (text, mentions) = extract_file_mentions(&trimmed);
        for path in mentions {
            match read_attachment(&path, &self.approved) {
                Ok(content) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string());
                    self.attachments.push((name, content));
                }
                Err(err) => {
                    self.push_system_note(
                        format!("attachment rejected ({}): {err}", path.display()),
                        terminal,
                    );
                }
            }
        }

        let full_text = append_attachments(&text, &self.attachments);
        self.attachments.clear();

        let mut parts: Vec<Part> = Vec::new();
        if !full_text.is_empty() {
            parts.push(Part::text(full_text));
        }
        for (mime, bytes) in self.image_attachments.drain(..) {
            parts.push(Part::image(mime, B64.encode(bytes)));
        }
        if parts.is_empty() {
            return;
        }
        let mut message = Message::new(Role::User, parts);

        if let Err(e) = self.store.add_message(&self.session.id, &mut message) {
            warn!(error = %e, "failed to persist user message");
        }
        let _ = self.store.increment_user_turns(&self.session.id);
        self.set_session_status(SessionStatus::Active);

        self.messages
            .lock()
            .expect("message list lock poisoned")
            .push(message.clone());
        self.renderer.handle_event(RendererEvent::MessageAdded);

        if self.renderer.mode() == RenderMode::Inline {
            let block = {
                let msgs = self.messages.lock().expect("message list lock poisoned");
                render_message(&msgs, msgs.len() - 1, self.width)
            };
            let _ = insert_scrollback(terminal, block);
        }

        self.busy = true;
        self.cancelled = false;
        self.error_banner = None;
        self.context_tokens = 0;
        self.newline_run = 0;
        self.renderer.handle_event(RendererEvent::StreamStarted);
        self.force_draw = true;

        if self.engine_tx.send(EngineRequest::Submit(message)).await.is_err() {
            self.error_banner = Some("engine worker is gone".into());
            self.busy = false;
        }
    }

    /// Record a directory approval (invoked by the approval-dialog
    /// collaborator on first-time access) and persist the list.
    pub fn approve_directory(&mut self, dir: PathBuf) {
        self.approved.approve(dir);
        if let Err(e) = self.approved.save(&self.approved_path) {
            debug!(error = %e, "failed to persist approved directories");
        }
    }

    /// Cancel the in-flight turn: abort the engine, recover any pending
    /// interjection into the composer, and mark the session interrupted.
    async fn cancel_stream(&mut self) {
        if !self.busy {
            return;
        }
        self.cancelled = true;
        if let Some(cancel) = self.cancel_slot.lock().await.take() {
            let _ = cancel.send(());
        }
        if let Some(text) = self.interjection.drain() {
            self.composer = text;
            self.cursor = self.composer.len();
            self.interjection_preview = None;
        }
        self.set_session_status(SessionStatus::Interrupted);
        self.force_draw = true;
    }

    fn set_session_status(&mut self, status: SessionStatus) {
        if self.session.status == status {
            return;
        }
        self.session.status = status;
        if let Err(e) = self.store.update_status(&self.session.id, status) {
            debug!(error = %e, "status update failed");
        }
    }

    fn push_system_note(&mut self, note: String, terminal: &mut DefaultTerminal) {
        let mut msg = Message::system(note);
        if let Err(e) = self.store.add_message(&self.session.id, &mut msg) {
            debug!(error = %e, "failed to persist system note");
        }
        self.messages
            .lock()
            .expect("message list lock poisoned")
            .push(msg);
        self.renderer.handle_event(RendererEvent::MessageAdded);
        if self.renderer.mode() == RenderMode::Inline {
            let block = {
                let msgs = self.messages.lock().expect("message list lock poisoned");
                render_message(&msgs, msgs.len() - 1, self.width)
            };
            let _ = insert_scrollback(terminal, block);
        }
        self.force_draw = true;
    }

    /// Poll the clipboard for image bytes and stage them as an attachment.
    /// Non-image clipboard content is ignored.
    fn paste_image(&mut self, terminal: &mut DefaultTerminal) -> anyhow::Result<()> {
        let Some((mime, bytes)) = self.clipboard.image() else {
            return Ok(());
        };
        if bytes.len() > MAX_IMAGE_BYTES {
            self.push_system_note(
                format!(
                    "attachment rejected (clipboard image): {} bytes exceeds the {} MiB limit",
                    bytes.len(),
                    MAX_IMAGE_BYTES / (1024 * 1024)
                ),
                terminal,
            );
            return Ok(());
        }
        self.image_attachments.push((mime, bytes));
        self.force_draw = true;
        Ok(())
    }

    // ── Ticks: smooth typing, wave, flush throttle, catch-up draws ────────────

    fn handle_tick(&mut self, terminal: &mut DefaultTerminal) -> anyhow::Result<()> {
        self.release_typed_chars();

        if let Some(deadline) = self.wave_deadline {
            if Instant::now() >= deadline {
                let cmd = match self.wave_phase {
                    WavePhase::Ticking => self.renderer.streaming.handle_wave_tick(),
                    WavePhase::Paused => self.renderer.streaming.handle_wave_pause(),
                    WavePhase::Idle => WaveCmd::Pause,
                };
                match (self.wave_phase, cmd) {
                    (WavePhase::Idle, _) => self.wave_deadline = None,
                    (_, WaveCmd::Tick) => {
                        self.wave_phase = WavePhase::Ticking;
                        self.wave_deadline = Some(Instant::now() + WAVE_TICK_INTERVAL);
                    }
                    (WavePhase::Ticking, WaveCmd::Pause) => {
                        self.wave_phase = WavePhase::Paused;
                        self.wave_deadline = Some(Instant::now() + WAVE_PAUSE_INTERVAL);
                    }
                    (WavePhase::Paused, WaveCmd::Pause) => {
                        self.wave_phase = WavePhase::Idle;
                        self.wave_deadline = None;
                    }
                }
            }
        }

        if self.busy
            && self.renderer.mode() == RenderMode::Inline
            && self.last_flush.elapsed() >= FLUSH_MIN_INTERVAL
        {
            let width = self.renderer.width();
            let max_view = self.height.saturating_sub(6) as usize;
            if let Some(block) = self.renderer.streaming.flush_to_scrollback(
                width,
                max_view.max(4),
                &render_markdown,
            ) {
                insert_scrollback(terminal, block)?;
                self.last_flush = Instant::now();
            }
        }

        if self.render_pending && self.last_draw.elapsed() >= STREAM_RENDER_MIN_INTERVAL {
            self.force_draw = true;
        }
        Ok(())
    }

    /// Release a few buffered characters into the tracker, capping runs of
    /// consecutive newlines.
    fn release_typed_chars(&mut self) {
        if self.typing_buffer.is_empty() {
            return;
        }
        let budget = self.config.tui.typing_chars_per_tick.max(1);
        let split = self
            .typing_buffer
            .char_indices()
            .nth(budget)
            .map(|(i, _)| i)
            .unwrap_or(self.typing_buffer.len());
        let chunk: String = self.typing_buffer.drain(..split).collect();
        let released = self.compact_newlines(&chunk);
        if !released.is_empty() {
            self.renderer
                .handle_event(RendererEvent::StreamText(released));
        }
    }

    fn flush_typing_buffer(&mut self) {
        if self.typing_buffer.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.typing_buffer);
        let released = self.compact_newlines(&rest);
        if !released.is_empty() {
            self.renderer
                .handle_event(RendererEvent::StreamText(released));
        }
    }

    fn compact_newlines(&mut self, text: &str) -> String {
        let cap = self.config.tui.newline_cap.max(1);
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if c == '\n' {
                self.newline_run += 1;
                if self.newline_run > cap {
                    continue;
                }
            } else {
                self.newline_run = 0;
            }
            out.push(c);
        }
        out
    }
}

/// Print a pre-rendered block above the inline viewport (scrollback).
fn insert_scrollback(
    terminal: &mut DefaultTerminal,
    lines: StyledLines,
) -> std::io::Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let height = lines.len().min(u16::MAX as usize) as u16;
    terminal.insert_before(height, |buf| {
        Paragraph::new(ratatui::text::Text::from(lines)).render(buf.area, buf);
    })?;
    Ok(())
}

/// Split `@path` mentions out of the submitted text. When none are present
/// the text is returned untouched.
fn extract_file_mentions(text: &str) -> (String, Vec<PathBuf>) {
    if !text.split_whitespace().any(|t| t.len() > 1 && t.starts_with('@')) {
        return (text.to_string(), Vec::new());
    }
    let mut kept: Vec<&str> = Vec::new();
    let mut paths = Vec::new();
    for token in text.split_whitespace() {
        match token.strip_prefix('@') {
            Some(path) if !path.is_empty() => paths.push(PathBuf::from(path)),
            _ => kept.push(token),
        }
    }
    (kept.join(" "), paths)
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
