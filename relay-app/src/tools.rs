//! HTTP tool-invoke client, used to turn binary attachments into text
//! before they enter the coalescer.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use relay_core::ToolInvoker;
use serde_json::{Value, json};
use std::time::Duration;

pub struct HttpToolInvoker {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpToolInvoker {
    pub fn new(http: reqwest::Client, url: String, token: Option<String>, timeout: Duration) -> Self {
        Self {
            http,
            url,
            token,
            timeout,
        }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    #[tracing::instrument(level = "info", skip_all, fields(tool_name = %tool_name))]
    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<Value> {
        let payload = json!({
            "tool_name": tool_name,
            "arguments": arguments,
        });

        let mut builder = self.http.post(&self.url).timeout(self.timeout).json(&payload);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let excerpt: String = text.chars().take(1000).collect();
            return Err(anyhow::anyhow!("tools invoke status={status} body={excerpt}"));
        }
        if text.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("tools invoke returned non-JSON: {e}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Audio,
    Image,
    File,
}

pub fn attachment_kind(content_type: &str) -> AttachmentKind {
    let lower = content_type.to_ascii_lowercase();
    if lower.starts_with("audio/") {
        AttachmentKind::Audio
    } else if lower.starts_with("image/") {
        AttachmentKind::Image
    } else {
        AttachmentKind::File
    }
}

// Argument shapes stay generic; the actual tool decides how to parse them.

pub fn audio_arguments(data: &[u8], filename: &str) -> Value {
    json!({
        "filename": filename,
        "audio_base64": BASE64.encode(data),
    })
}

pub fn file_arguments(data: &[u8], filename: &str) -> Value {
    json!({
        "filename": filename,
        "file_base64": BASE64.encode(data),
    })
}

pub fn image_arguments(data: &[u8], filename: &str, prompt: &str) -> Value {
    json!({
        "filename": filename,
        "image_base64": BASE64.encode(data),
        "prompt": prompt,
    })
}

/// The response schema varies by tool version; look for the first usable
/// text field under `result` (or at the top level).
pub fn extract_tool_text(result: &Value) -> Option<String> {
    let inner = result.get("result").unwrap_or(result);
    match inner {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Object(map) => {
            for field in ["text", "content", "summary"] {
                if let Some(Value::String(s)) = map.get(field) {
                    let trimmed = s.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_kinds_follow_content_type() {
        assert_eq!(attachment_kind("audio/ogg"), AttachmentKind::Audio);
        assert_eq!(attachment_kind("Image/JPEG"), AttachmentKind::Image);
        assert_eq!(attachment_kind("application/pdf"), AttachmentKind::File);
        assert_eq!(attachment_kind(""), AttachmentKind::File);
    }

    #[test]
    fn argument_builders_encode_payloads() {
        let args = audio_arguments(b"abc", "voice.ogg");
        assert_eq!(args["filename"], "voice.ogg");
        assert_eq!(args["audio_base64"], BASE64.encode(b"abc"));

        let args = image_arguments(b"xyz", "pic.jpg", "what is this?");
        assert_eq!(args["prompt"], "what is this?");
        assert_eq!(args["image_base64"], BASE64.encode(b"xyz"));

        let args = file_arguments(b"doc", "notes.pdf");
        assert_eq!(args["file_base64"], BASE64.encode(b"doc"));
    }

    #[test]
    fn tool_text_is_extracted_from_common_shapes() {
        assert_eq!(
            extract_tool_text(&json!({"result": {"text": " spoken words "}})).as_deref(),
            Some("spoken words")
        );
        assert_eq!(
            extract_tool_text(&json!({"result": {"summary": "file summary"}})).as_deref(),
            Some("file summary")
        );
        assert_eq!(
            extract_tool_text(&json!({"result": "plain"})).as_deref(),
            Some("plain")
        );
        assert_eq!(
            extract_tool_text(&json!({"text": "top level"})).as_deref(),
            Some("top level")
        );
        assert_eq!(extract_tool_text(&json!({"result": {"other": 3}})), None);
        assert_eq!(extract_tool_text(&json!({"result": ""})), None);
    }
}
