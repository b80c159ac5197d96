//! Challenge-response WebSocket RPC adapter.
//!
//! One connection per call, walked through
//! disconnected -> handshaking -> ready -> draining. The far end resends the
//! cumulative run text on every delta, so incremental output is recovered by
//! diffing against the last-seen cumulative string.

use crate::adapter::{BackendAdapter, EventStream};
use crate::error::{BackendError, Result, is_auth_message};
use crate::types::{BackendRequest, StreamEvent, UsageStats};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const PROTOCOL_VERSION_MIN: u32 = 1;
const PROTOCOL_VERSION_MAX: u32 = 3;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub token: Option<String>,
    /// Client identity sent in the connect request.
    pub client_id: String,
    pub handshake_timeout: Duration,
    /// Bounded deadline for the whole run, also forwarded to the far end.
    pub run_deadline: Duration,
}

pub struct RpcStreamAdapter {
    config: RpcConfig,
}

impl RpcStreamAdapter {
    pub fn new(config: RpcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendAdapter for RpcStreamAdapter {
    fn backend_id(&self) -> &str {
        "rpc"
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_key = %request.session_key))]
    async fn stream(&self, request: BackendRequest) -> Result<EventStream> {
        let started = Instant::now();

        let connect = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::connect_async(&self.config.url),
        )
        .await
        .map_err(|_| BackendError::Transport("rpc connect timed out".to_string()))?;
        let (ws, _) = connect?;
        let (mut write, mut read) = ws.split();

        // handshaking: challenge, then authenticated connect, then ack.
        let nonce = wait_for_challenge(&mut read, self.config.handshake_timeout).await?;

        let token = request
            .auth_token
            .clone()
            .or_else(|| self.config.token.clone())
            .unwrap_or_default();
        let connect_id = Uuid::new_v4().to_string();
        let connect_frame = json!({
            "type": "req",
            "id": connect_id,
            "method": "connect",
            "params": {
                "minProtocolVersion": PROTOCOL_VERSION_MIN,
                "maxProtocolVersion": PROTOCOL_VERSION_MAX,
                "client": {
                    "id": self.config.client_id,
                    "version": env!("CARGO_PKG_VERSION"),
                    "platform": "relaybot",
                },
                "auth": { "token": token },
                "nonce": nonce,
            },
        });
        write
            .send(Message::Text(connect_frame.to_string().into()))
            .await?;

        let protocol =
            wait_for_connect_ack(&mut read, &connect_id, self.config.handshake_timeout).await?;
        tracing::debug!(protocol, "rpc handshake acknowledged");

        // ready: issue the run request with an idempotency key and deadline.
        let request_id = Uuid::new_v4().to_string();
        let chat_frame = json!({
            "type": "req",
            "id": request_id,
            "method": "chat.send",
            "params": {
                "sessionKey": request.session_key,
                "senderLabel": request.sender_label,
                "messages": request.messages,
                "idempotencyKey": Uuid::new_v4().to_string(),
                "timeoutMs": self.config.run_deadline.as_millis() as u64,
            },
        });
        write
            .send(Message::Text(chat_frame.to_string().into()))
            .await?;

        let state = RpcStreamState {
            read,
            write,
            demux: RunDemux::default(),
            pending: VecDeque::new(),
            request_id,
            deadline: started + self.config.run_deadline,
            started,
            finished: false,
        };

        Ok(Box::pin(futures_util::stream::unfold(
            state,
            |mut state| async move {
                loop {
                    if let Some(event) = state.pending.pop_front() {
                        return Some((event, state));
                    }
                    if state.finished {
                        return None;
                    }
                    state.step().await;
                }
            },
        )))
    }
}

struct RpcStreamState {
    read: SplitStream<WsStream>,
    write: SplitSink<WsStream, Message>,
    demux: RunDemux,
    pending: VecDeque<StreamEvent>,
    request_id: String,
    deadline: Instant,
    started: Instant,
    finished: bool,
}

impl RpcStreamState {
    /// Read one socket message and translate it into zero or more pending
    /// events. Terminal conditions mark the stream finished and drain the
    /// connection.
    async fn step(&mut self) {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.terminate(Some("run deadline exceeded".to_string())).await;
            return;
        }

        let message = match tokio::time::timeout(remaining, self.read.next()).await {
            Err(_) => {
                self.terminate(Some("run deadline exceeded".to_string())).await;
                return;
            }
            Ok(None) => {
                self.terminate(Some(
                    "connection closed before terminal state".to_string(),
                ))
                .await;
                return;
            }
            Ok(Some(Err(e))) => {
                self.terminate(Some(format!("rpc transport fault: {e}"))).await;
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => self.handle_frame(text.as_str()).await,
            Message::Ping(payload) => {
                let _ = self.write.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => {
                self.terminate(Some(
                    "connection closed before terminal state".to_string(),
                ))
                .await;
            }
            _ => {}
        }
    }

    async fn handle_frame(&mut self, raw: &str) {
        let frame: WireFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.terminate(Some(format!("unparseable control frame: {e}"))).await;
                return;
            }
        };

        match frame.kind.as_str() {
            "res" if frame.id.as_deref() == Some(self.request_id.as_str()) => {
                if frame.ok != Some(true) {
                    let message = frame
                        .error
                        .map(|e| e.message)
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "run request rejected".to_string());
                    self.terminate(Some(message)).await;
                }
            }
            "event" if frame.event.as_deref() == Some("chat") => {
                let payload: ChatEventPayload =
                    match serde_json::from_value(frame.payload) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::debug!(%e, "skipping malformed chat event payload");
                            return;
                        }
                    };
                let (events, outcome) = self.demux.on_chat(payload);
                self.pending.extend(events);
                match outcome {
                    RunOutcome::Open => {}
                    RunOutcome::Final => {
                        let mut usage = self.demux.usage.clone().unwrap_or_default();
                        usage.latency_ms = self.started.elapsed().as_millis() as u64;
                        self.pending.push_back(StreamEvent::Usage(usage));
                        self.terminate(None).await;
                    }
                    RunOutcome::Failed(message) => {
                        self.terminate(Some(message)).await;
                    }
                }
            }
            _ => {}
        }
    }

    /// draining: flag the stream finished, queue the terminal error if any,
    /// and close the socket best-effort.
    async fn terminate(&mut self, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(message) = error {
            self.pending.push_back(StreamEvent::Error { message });
        }
        let _ = self.write.send(Message::Close(None)).await;
    }
}

async fn wait_for_challenge(
    read: &mut SplitStream<WsStream>,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BackendError::Protocol(
                "handshake challenge not received".to_string(),
            ));
        }
        let message = tokio::time::timeout(remaining, read.next())
            .await
            .map_err(|_| {
                BackendError::Protocol("handshake challenge not received".to_string())
            })?
            .ok_or_else(|| {
                BackendError::Protocol("connection closed during handshake".to_string())
            })??;

        let Message::Text(text) = message else {
            continue;
        };
        let frame: WireFrame = serde_json::from_str(text.as_str())
            .map_err(|e| BackendError::Protocol(format!("malformed handshake frame: {e}")))?;
        if frame.kind == "event" && frame.event.as_deref() == Some("connect.challenge") {
            let nonce = frame
                .payload
                .get("nonce")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if nonce.is_empty() {
                return Err(BackendError::Protocol(
                    "handshake challenge missing nonce".to_string(),
                ));
            }
            return Ok(nonce);
        }
    }
}

async fn wait_for_connect_ack(
    read: &mut SplitStream<WsStream>,
    connect_id: &str,
    timeout: Duration,
) -> Result<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BackendError::Protocol(
                "handshake acknowledgement not received".to_string(),
            ));
        }
        let message = tokio::time::timeout(remaining, read.next())
            .await
            .map_err(|_| {
                BackendError::Protocol("handshake acknowledgement not received".to_string())
            })?
            .ok_or_else(|| {
                BackendError::Protocol("connection closed during handshake".to_string())
            })??;

        let Message::Text(text) = message else {
            continue;
        };
        let frame: WireFrame = serde_json::from_str(text.as_str())
            .map_err(|e| BackendError::Protocol(format!("malformed handshake frame: {e}")))?;
        if frame.kind != "res" || frame.id.as_deref() != Some(connect_id) {
            continue;
        }
        if frame.ok != Some(true) {
            let message = frame
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "connect rejected".to_string());
            return Err(ack_failure(message));
        }
        let protocol = frame
            .payload
            .get("protocol")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                BackendError::Protocol(
                    "acknowledgement missing negotiated protocol version".to_string(),
                )
            })?;
        return Ok(protocol as u32);
    }
}

/// A negative acknowledgement is permanent for this call, except that an
/// auth-flavored rejection is classified so the caller can refresh the
/// credential once before giving up.
fn ack_failure(message: String) -> BackendError {
    if is_auth_message(&message) {
        BackendError::Auth(message)
    } else {
        BackendError::Protocol(message)
    }
}

/// Previous and new cumulative payloads in, emitted delta out.
///
/// The far end resends the full run text on every event; normally the new
/// string extends the previous one and the suffix is the delta. A
/// non-monotonic correction replaces the text wholesale, so the entire new
/// string is the delta rather than dropping content.
pub fn cumulative_delta<'a>(previous: &str, next: &'a str) -> &'a str {
    match next.strip_prefix(previous) {
        Some(suffix) => suffix,
        None => next,
    }
}

#[derive(Debug, Default)]
struct RunDemux {
    /// The adapter locks onto the first run id that produces non-empty
    /// content; the handshake may fan out to a routing run before the real
    /// run starts, and those events are dropped.
    locked_run: Option<String>,
    last_cumulative: String,
    usage: Option<UsageStats>,
}

#[derive(Debug, PartialEq, Eq)]
enum RunOutcome {
    Open,
    Final,
    Failed(String),
}

impl RunDemux {
    fn on_chat(&mut self, payload: ChatEventPayload) -> (Vec<StreamEvent>, RunOutcome) {
        let text = payload.message.map(|m| m.text).unwrap_or_default();

        if self.locked_run.is_none() {
            if text.is_empty() {
                // A failure before any run produced content still has to
                // surface; there is nothing else to lock onto.
                if payload.state == "error" || payload.state == "aborted" {
                    let message = payload
                        .error
                        .map(|e| e.message)
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| format!("run {} before any content", payload.state));
                    return (Vec::new(), RunOutcome::Failed(message));
                }
                return (Vec::new(), RunOutcome::Open);
            }
            self.locked_run = Some(payload.run_id.clone());
        }

        if self.locked_run.as_deref() != Some(payload.run_id.as_str()) {
            return (Vec::new(), RunOutcome::Open);
        }

        if let Some(usage) = payload.usage {
            self.usage = Some(UsageStats {
                model: usage.model,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                latency_ms: 0,
            });
        }

        let mut events = Vec::new();
        let delta = cumulative_delta(&self.last_cumulative, &text);
        if !delta.is_empty() {
            events.push(StreamEvent::ContentDelta {
                text: delta.to_string(),
            });
        }
        if !text.is_empty() {
            self.last_cumulative = text;
        }

        let outcome = match payload.state.as_str() {
            "final" => RunOutcome::Final,
            "error" => RunOutcome::Failed(
                payload
                    .error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "backend reported an error".to_string()),
            ),
            "aborted" => RunOutcome::Failed("run aborted by the backend".to_string()),
            _ => RunOutcome::Open,
        };
        (events, outcome)
    }
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatEventPayload {
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    message: Option<ChatEventMessage>,
    #[serde(default)]
    usage: Option<ChatEventUsage>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct ChatEventMessage {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatEventUsage {
    #[serde(default)]
    model: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(run_id: &str, state: &str, text: &str) -> ChatEventPayload {
        ChatEventPayload {
            run_id: run_id.to_string(),
            state: state.to_string(),
            message: Some(ChatEventMessage {
                text: text.to_string(),
            }),
            usage: None,
            error: None,
        }
    }

    #[test]
    fn cumulative_delta_emits_suffix_growth() {
        assert_eq!(cumulative_delta("", "A"), "A");
        assert_eq!(cumulative_delta("A", "AB"), "B");
        assert_eq!(cumulative_delta("AB", "ABC"), "C");
        assert_eq!(cumulative_delta("ABC", "ABC"), "");
    }

    #[test]
    fn cumulative_delta_replays_non_monotonic_corrections() {
        assert_eq!(cumulative_delta("AB", "XY"), "XY");
        assert_eq!(cumulative_delta("long previous", "short"), "short");
    }

    #[test]
    fn demux_locks_onto_first_run_with_content() {
        let mut demux = RunDemux::default();

        let (events, outcome) = demux.on_chat(chat("run-routing", "delta", ""));
        assert!(events.is_empty());
        assert_eq!(outcome, RunOutcome::Open);
        assert!(demux.locked_run.is_none());

        let (events, _) = demux.on_chat(chat("run-real", "delta", "A"));
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta {
                text: "A".to_string()
            }]
        );
        assert_eq!(demux.locked_run.as_deref(), Some("run-real"));

        // Events for any other run on the same socket are dropped.
        let (events, outcome) = demux.on_chat(chat("run-routing", "delta", "noise"));
        assert!(events.is_empty());
        assert_eq!(outcome, RunOutcome::Open);

        let (events, _) = demux.on_chat(chat("run-real", "delta", "AB"));
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta {
                text: "B".to_string()
            }]
        );
    }

    #[test]
    fn demux_diffs_cumulative_payloads_per_run() {
        let mut demux = RunDemux::default();
        let mut emitted = Vec::new();
        for cumulative in ["A", "AB", "ABC"] {
            let (events, _) = demux.on_chat(chat("r1", "delta", cumulative));
            emitted.extend(events);
        }
        assert_eq!(
            emitted,
            vec![
                StreamEvent::ContentDelta {
                    text: "A".to_string()
                },
                StreamEvent::ContentDelta {
                    text: "B".to_string()
                },
                StreamEvent::ContentDelta {
                    text: "C".to_string()
                },
            ]
        );

        let (events, _) = demux.on_chat(chat("r1", "delta", "XY"));
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta {
                text: "XY".to_string()
            }]
        );
    }

    #[test]
    fn demux_reports_terminal_states() {
        let mut demux = RunDemux::default();
        let (_, outcome) = demux.on_chat(chat("r1", "delta", "hello"));
        assert_eq!(outcome, RunOutcome::Open);

        let (events, outcome) = demux.on_chat(chat("r1", "final", "hello world"));
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta {
                text: " world".to_string()
            }]
        );
        assert_eq!(outcome, RunOutcome::Final);
    }

    #[test]
    fn demux_surfaces_error_before_any_content() {
        let mut demux = RunDemux::default();
        let mut payload = chat("r1", "error", "");
        payload.error = Some(WireError {
            message: "agent offline".to_string(),
        });
        let (events, outcome) = demux.on_chat(payload);
        assert!(events.is_empty());
        assert_eq!(outcome, RunOutcome::Failed("agent offline".to_string()));
    }

    #[test]
    fn negative_ack_classification() {
        assert!(matches!(
            ack_failure("unauthorized".to_string()),
            BackendError::Auth(_)
        ));
        assert!(matches!(
            ack_failure("unsupported protocol range".to_string()),
            BackendError::Protocol(_)
        ));
    }

    #[test]
    fn wire_frames_parse_expected_shapes() {
        let challenge: WireFrame = serde_json::from_str(
            r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n-1"}}"#,
        )
        .expect("parse challenge");
        assert_eq!(challenge.kind, "event");
        assert_eq!(
            challenge.payload.get("nonce").and_then(|v| v.as_str()),
            Some("n-1")
        );

        let ack: WireFrame = serde_json::from_str(
            r#"{"type":"res","id":"c-1","ok":true,"payload":{"protocol":3}}"#,
        )
        .expect("parse ack");
        assert_eq!(ack.ok, Some(true));
        assert_eq!(ack.payload.get("protocol").and_then(|v| v.as_u64()), Some(3));

        let event: WireFrame = serde_json::from_str(
            r#"{"type":"event","event":"chat","payload":{"runId":"r","state":"delta","message":{"text":"A"}}}"#,
        )
        .expect("parse chat event");
        let payload: ChatEventPayload =
            serde_json::from_value(event.payload).expect("parse chat payload");
        assert_eq!(payload.run_id, "r");
        assert_eq!(payload.state, "delta");
    }
}
