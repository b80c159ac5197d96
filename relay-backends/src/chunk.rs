//! Adapter for SDK-style backends that only expose a blocking chunk iterator.

use crate::adapter::{BackendAdapter, EventStream};
use crate::error::{BackendError, Result};
use crate::types::{BackendRequest, StreamEvent, UsageStats};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// One unit as returned by the vendor iterator.
#[derive(Debug, Clone)]
pub struct VendorChunk {
    pub text: String,
    /// True when the unit belongs to the model's thinking phase.
    pub thought: bool,
    pub usage: Option<VendorUsage>,
}

#[derive(Debug, Clone)]
pub struct VendorUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The vendor SDK seam. `generate` blocks, so the adapter always drives it
/// from a dedicated worker thread.
pub trait ChunkSource: Send + Sync {
    fn generate(
        &self,
        request: &BackendRequest,
    ) -> Result<Box<dyn Iterator<Item = Result<VendorChunk>> + Send>>;
}

pub struct ChunkAdapter {
    source: Arc<dyn ChunkSource>,
}

impl ChunkAdapter {
    pub fn new(source: Arc<dyn ChunkSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl BackendAdapter for ChunkAdapter {
    fn backend_id(&self) -> &str {
        "chunk"
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(&self, request: BackendRequest) -> Result<EventStream> {
        let source = self.source.clone();
        let started = Instant::now();

        // Opening the vendor call blocks; run it on a worker so connection
        // failures still surface as an Err the retry policy can classify.
        let open_request = request.clone();
        let iter = tokio::task::spawn_blocking(move || source.generate(&open_request))
            .await
            .map_err(|e| BackendError::Transport(format!("chunk worker join failed: {e}")))??;

        let (tx, rx) = mpsc::channel::<StreamEvent>(32);
        tokio::task::spawn_blocking(move || relay_chunks(iter, &request, started, tx));

        Ok(receiver_stream(rx))
    }
}

fn relay_chunks(
    iter: Box<dyn Iterator<Item = Result<VendorChunk>> + Send>,
    request: &BackendRequest,
    started: Instant,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut usage = UsageStats {
        model: request.model.clone().unwrap_or_default(),
        ..UsageStats::default()
    };
    let mut delta_chunks = 0usize;

    for unit in iter {
        let chunk = match unit {
            Ok(chunk) => chunk,
            Err(e) => {
                // One terminal Error and stop; a half-consumed vendor stream
                // is never retried mid-flight.
                let _ = tx.blocking_send(StreamEvent::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        if let Some(vendor_usage) = chunk.usage {
            if !vendor_usage.model.is_empty() {
                usage.model = vendor_usage.model;
            }
            usage.input_tokens = vendor_usage.input_tokens;
            usage.output_tokens = vendor_usage.output_tokens;
        }

        if chunk.text.is_empty() {
            continue;
        }
        delta_chunks += 1;
        let event = if chunk.thought {
            StreamEvent::ThinkingDelta { text: chunk.text }
        } else {
            StreamEvent::ContentDelta { text: chunk.text }
        };
        if tx.blocking_send(event).is_err() {
            // Receiver dropped; nobody is listening anymore.
            return;
        }
    }

    usage.latency_ms = started.elapsed().as_millis() as u64;
    tracing::debug!(
        delta_chunks,
        latency_ms = usage.latency_ms,
        "chunk stream finished"
    );
    let _ = tx.blocking_send(StreamEvent::Usage(usage));
}

fn receiver_stream(rx: mpsc::Receiver<StreamEvent>) -> EventStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}
