use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// One normalized event on the adapter-to-presenter stream.
///
/// Adapters never raise past the stream boundary: every failure mode after
/// the stream exists becomes a terminal `Error` event so the consumer can
/// still flush partial content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    ThinkingDelta { text: String },
    ContentDelta { text: String },
    Usage(UsageStats),
    Error { message: String },
}

/// One streaming exchange as handed to an adapter.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub messages: Vec<ChatMessage>,
    /// Conversation scope, forwarded so the far end can route per session.
    pub session_key: String,
    pub sender_label: String,
    pub model: Option<String>,
    /// Bearer credential resolved by the caller per attempt. Adapters that
    /// authenticate differently ignore it.
    pub auth_token: Option<String>,
}

impl BackendRequest {
    pub fn new(messages: Vec<ChatMessage>, session_key: impl Into<String>) -> Self {
        Self {
            messages,
            session_key: session_key.into(),
            sender_label: "User".to_string(),
            model: None,
            auth_token: None,
        }
    }

    pub fn with_sender_label(mut self, sender_label: impl Into<String>) -> Self {
        self.sender_label = sender_label.into();
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token;
        self
    }
}
