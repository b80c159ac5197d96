//! Collaborator seams consumed by the relay core.

use crate::types::{BufferedBatch, SessionKey, TargetId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sender_label: Option<String>,
    #[serde(default)]
    pub origin_label: Option<String>,
}

/// Persistent conversation history. The relay treats every error here as
/// non-fatal and continues without history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get(&self, key: &SessionKey, limit: usize) -> Result<Vec<StoredMessage>>;

    async fn append(
        &self,
        key: &SessionKey,
        role: &str,
        content: &str,
        sender_label: Option<&str>,
        origin_label: Option<&str>,
    ) -> Result<()>;

    async fn clear(&self, key: &SessionKey) -> Result<()>;
}

/// Outbound UI writes. The presenter never assumes these calls succeed; a
/// failed non-final push is simply superseded by the next push.
#[async_trait]
pub trait UiSurface: Send + Sync {
    async fn create_stream_target(
        &self,
        conversation_id: &str,
        initial: serde_json::Value,
    ) -> Result<TargetId>;

    async fn push_update(
        &self,
        target: &TargetId,
        field: &str,
        text: &str,
        is_final: bool,
    ) -> Result<()>;

    async fn commit_final(&self, target: &TargetId, payload: serde_json::Value) -> Result<()>;
}

/// Bounded-timeout request/response tool calls, used upstream of the
/// coalescer to turn binary attachments into text.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, arguments: serde_json::Value)
        -> Result<serde_json::Value>;
}

/// Invoked by the coalescer when a session's quiet period elapses.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn on_flush(&self, key: &SessionKey, batch: BufferedBatch) -> Result<()>;
}
