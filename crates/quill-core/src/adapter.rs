// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use futures::StreamExt;
use tokio::sync::mpsc;

use quill_model::{EventStream, ProviderEvent};

use crate::events::StreamEvent;

/// Default buffered-channel capacity between the engine worker and the UI.
pub const DEFAULT_BUFFER: usize = 256;

/// Bounded fan-out of engine events to the UI consumer.
///
/// Single producer (the engine worker holds a cloned sender), single
/// consumer (the driver takes the receiver). Emission order is preserved;
/// when the buffer is full the producer blocks, applying backpressure to
/// the engine and provider.
pub struct StreamAdapter {
    tx: Option<mpsc::Sender<StreamEvent>>,
    rx: Option<mpsc::Receiver<StreamEvent>>,
}

impl StreamAdapter {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }

    /// A sender handle for the producer. Clone as needed before calling
    /// [`StreamAdapter::close`].
    pub fn sender(&self) -> mpsc::Sender<StreamEvent> {
        self.tx
            .as_ref()
            .expect("stream adapter already closed")
            .clone()
    }

    /// The consumer handle. Can be taken once.
    pub fn events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.rx.take()
    }

    /// Drop the adapter's own sender; the channel closes once every cloned
    /// producer handle is gone.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Consume a raw provider stream, translate each event into its UI form
    /// in order, and close when the stream ends or errors. Used for
    /// provider passthrough paths that bypass the engine's tool loop.
    pub async fn process_stream(&mut self, mut stream: EventStream) {
        let Some(tx) = self.tx.clone() else { return };
        let mut total_tokens = 0u64;
        while let Some(item) = stream.next().await {
            match item {
                Ok(ProviderEvent::TextDelta(delta)) => {
                    if !delta.is_empty() && tx.send(StreamEvent::Text(delta)).await.is_err() {
                        break;
                    }
                }
                Ok(ProviderEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cached_tokens,
                }) => {
                    total_tokens += input_tokens + output_tokens + cached_tokens;
                    let _ = tx
                        .send(StreamEvent::Usage {
                            input_tokens,
                            output_tokens,
                            cached_tokens,
                        })
                        .await;
                }
                Ok(ProviderEvent::Done) => break,
                // Tool-call and search events only make sense inside the
                // engine loop; a passthrough stream ignores them.
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    self.close();
                    return;
                }
            }
        }
        let _ = tx.send(StreamEvent::Done { total_tokens }).await;
        self.close();
    }

    /// Emit a single `Error` event and close the channel.
    pub async fn emit_error_and_close(&mut self, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StreamEvent::Error(message.into())).await;
        }
        self.close();
    }
}

impl Default for StreamAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
