//! OpenAI-compatible streaming chat completions over SSE.

use crate::adapter::{BackendAdapter, EventStream};
use crate::error::{BackendError, Result};
use crate::types::{BackendRequest, StreamEvent, UsageStats};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone)]
pub struct SseConfig {
    pub url: String,
    pub token: Option<String>,
    pub model: Option<String>,
    /// Forwarded verbatim; the gateway side may route on it.
    pub agent: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Clone)]
pub struct SseAdapter {
    http: reqwest::Client,
    config: SseConfig,
}

impl SseAdapter {
    pub fn new(http: reqwest::Client, config: SseConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl BackendAdapter for SseAdapter {
    fn backend_id(&self) -> &str {
        "sse"
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_key = %request.session_key))]
    async fn stream(&self, request: BackendRequest) -> Result<EventStream> {
        let body = SseChatRequest {
            model: request.model.clone().or_else(|| self.config.model.clone()),
            agent: self.config.agent.clone(),
            messages: &request.messages,
            stream: true,
        };

        let started = Instant::now();
        let mut builder = self
            .http
            .post(&self.config.url)
            .timeout(self.config.request_timeout)
            .json(&body);
        let token = request.auth_token.as_ref().or(self.config.token.as_ref());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let state = SseStreamState {
            model: body.model.unwrap_or_default(),
            input_tokens: 0,
            output_tokens: 0,
            started,
            pending: VecDeque::new(),
            finished: false,
        };
        let lines = decode_lines(response.bytes_stream());

        let stream = futures_util::stream::unfold(
            (lines, state),
            |(mut lines, mut state)| async move {
                loop {
                    if let Some(event) = state.pending.pop_front() {
                        return Some((event, (lines, state)));
                    }
                    if state.finished {
                        return None;
                    }
                    match lines.next().await {
                        None => {
                            state.finished = true;
                            return Some((state.final_usage(), (lines, state)));
                        }
                        Some(Err(e)) => {
                            // Surface the fault on the stream so partial
                            // content already delivered is still flushed.
                            state.finished = true;
                            let event = StreamEvent::Error {
                                message: format!("sse transport fault: {e}"),
                            };
                            return Some((event, (lines, state)));
                        }
                        Some(Ok(line)) => {
                            let line = line.trim();
                            if line.is_empty() || line.starts_with(':') {
                                continue;
                            }
                            let Some(data) = line.strip_prefix(DATA_PREFIX) else {
                                continue;
                            };
                            let data = data.trim_start();
                            if data == DONE_SENTINEL {
                                state.finished = true;
                                return Some((state.final_usage(), (lines, state)));
                            }
                            match serde_json::from_str::<SseChunk>(data) {
                                Ok(chunk) => state.apply(chunk),
                                Err(e) => {
                                    tracing::debug!(%e, "skipping malformed sse data line");
                                }
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> BackendError {
    let excerpt: String = body.chars().take(500).collect();
    let message = format!("sse chat status={status} body={excerpt}");
    match status.as_u16() {
        401 | 403 => BackendError::Auth(message),
        408 | 429 => BackendError::Transport(message),
        s if s >= 500 => BackendError::Transport(message),
        _ => BackendError::Content(message),
    }
}

#[derive(Debug, Serialize)]
struct SseChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    messages: &'a [crate::types::ChatMessage],
    stream: bool,
}

struct SseStreamState {
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    started: Instant,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl SseStreamState {
    fn apply(&mut self, chunk: SseChunk) {
        if let Some(model) = chunk.model {
            if !model.is_empty() {
                self.model = model;
            }
        }
        if let Some(usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        let thinking = choice
            .delta
            .reasoning_content
            .or(choice.delta.thinking)
            .unwrap_or_default();
        if !thinking.is_empty() {
            self.pending
                .push_back(StreamEvent::ThinkingDelta { text: thinking });
        }
        let content = choice.delta.content.unwrap_or_default();
        if !content.is_empty() {
            self.pending
                .push_back(StreamEvent::ContentDelta { text: content });
        }
    }

    fn final_usage(&self) -> StreamEvent {
        StreamEvent::Usage(UsageStats {
            model: self.model.clone(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            latency_ms: self.started.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<SseUsage>,
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Debug, Deserialize)]
struct SseUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Debug, Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Decode a byte stream into individual lines without ever buffering the
/// whole body; frame boundaries are preserved even across chunk splits.
fn decode_lines<S>(bytes_stream: S) -> LineStream
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    Box::pin(futures_util::stream::unfold(
        (bytes_stream, String::new(), false),
        |(mut stream, mut buffer, mut eof)| async move {
            loop {
                if let Some(idx) = buffer.find('\n') {
                    let mut line = buffer[..idx].to_string();
                    buffer = buffer[idx + 1..].to_string();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    return Some((Ok(line), (stream, buffer, eof)));
                }
                if eof {
                    if buffer.is_empty() {
                        return None;
                    }
                    let line = std::mem::take(&mut buffer);
                    return Some((Ok(line), (stream, buffer, eof)));
                }
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(BackendError::Transport(e.to_string())),
                            (stream, buffer, eof),
                        ));
                    }
                    None => {
                        eof = true;
                    }
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SseStreamState {
        SseStreamState {
            model: "relay".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            started: Instant::now(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    #[test]
    fn extracts_thinking_and_content_deltas() {
        let mut state = state();
        let chunk: SseChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"reasoning_content":"hmm","content":"hello"}}]}"#,
        )
        .expect("parse chunk");
        state.apply(chunk);

        assert_eq!(
            state.pending.pop_front(),
            Some(StreamEvent::ThinkingDelta {
                text: "hmm".to_string()
            })
        );
        assert_eq!(
            state.pending.pop_front(),
            Some(StreamEvent::ContentDelta {
                text: "hello".to_string()
            })
        );
        assert_eq!(state.pending.pop_front(), None);
    }

    #[test]
    fn captures_model_and_usage() {
        let mut state = state();
        let chunk: SseChunk = serde_json::from_str(
            r#"{"model":"gw-7","usage":{"prompt_tokens":21,"completion_tokens":9},"choices":[]}"#,
        )
        .expect("parse chunk");
        state.apply(chunk);

        match state.final_usage() {
            StreamEvent::Usage(usage) => {
                assert_eq!(usage.model, "gw-7");
                assert_eq!(usage.input_tokens, 21);
                assert_eq!(usage.output_tokens, 9);
            }
            other => panic!("expected usage, got {other:?}"),
        }
    }

    #[test]
    fn empty_choices_produce_no_events() {
        let mut state = state();
        let chunk: SseChunk =
            serde_json::from_str(r#"{"choices":[]}"#).expect("parse chunk");
        state.apply(chunk);
        assert!(state.pending.is_empty());
    }

    #[test]
    fn status_mapping_matches_failure_taxonomy() {
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED, "nope"),
            BackendError::Auth(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::BAD_GATEWAY, "nope"),
            BackendError::Transport(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::BAD_REQUEST, "nope"),
            BackendError::Content(_)
        ));
    }

    #[tokio::test]
    async fn line_decoder_preserves_frames_across_chunk_splits() {
        let chunks: Vec<std::result::Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\"")),
            Ok(Bytes::from_static(b":1}\r\ndata: [DO")),
            Ok(Bytes::from_static(b"NE]\n")),
        ];
        let mut lines = decode_lines(futures_util::stream::iter(chunks));

        let first = lines.next().await.expect("first line").expect("ok line");
        assert_eq!(first, "data: {\"a\":1}");
        let second = lines.next().await.expect("second line").expect("ok line");
        assert_eq!(second, "data: [DONE]");
        assert!(lines.next().await.is_none());
    }
}
