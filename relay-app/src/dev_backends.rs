//! Local stand-ins for the external collaborators so `relaybot serve` runs
//! end-to-end without a backend, card service, or tool service.

use anyhow::Result;
use async_trait::async_trait;
use relay_backends::{BackendRequest, ChunkSource, Role, VendorChunk, VendorUsage};
use relay_core::{TargetId, UiSurface};
use serde_json::Value;
use uuid::Uuid;

/// Deterministic echo source behind the chunk adapter.
pub struct DevChunkSource;

impl ChunkSource for DevChunkSource {
    fn generate(
        &self,
        request: &BackendRequest,
    ) -> relay_backends::Result<Box<dyn Iterator<Item = relay_backends::Result<VendorChunk>> + Send>>
    {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let reply = format!("[dev] acknowledged: {prompt}");
        let half = reply.len() / 2;
        let split = reply
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= half)
            .unwrap_or(0);
        let (head, tail) = reply.split_at(split);

        let chunks = vec![
            Ok(VendorChunk {
                text: format!("Considering: {}", truncate(&prompt, 80)),
                thought: true,
                usage: None,
            }),
            Ok(VendorChunk {
                text: head.to_string(),
                thought: false,
                usage: None,
            }),
            Ok(VendorChunk {
                text: tail.to_string(),
                thought: false,
                usage: Some(VendorUsage {
                    model: "dev-echo".to_string(),
                    input_tokens: (prompt.len() / 4) as u64,
                    output_tokens: (reply.len() / 4) as u64,
                }),
            }),
        ];
        Ok(Box::new(chunks.into_iter()))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let shown: String = text.chars().take(max_chars).collect();
    format!("{shown}...")
}

/// Surface that renders to the log instead of a chat platform.
pub struct LogSurface;

#[async_trait]
impl UiSurface for LogSurface {
    async fn create_stream_target(
        &self,
        conversation_id: &str,
        _initial: Value,
    ) -> Result<TargetId> {
        let target = TargetId::new(Uuid::new_v4().to_string());
        tracing::info!(%conversation_id, %target, "dev surface target created");
        Ok(target)
    }

    async fn push_update(
        &self,
        target: &TargetId,
        field: &str,
        text: &str,
        is_final: bool,
    ) -> Result<()> {
        tracing::debug!(%target, field, is_final, text_len = text.len(), "dev surface update");
        Ok(())
    }

    async fn commit_final(&self, target: &TargetId, payload: Value) -> Result<()> {
        tracing::info!(%target, %payload, "dev surface commit");
        Ok(())
    }
}
