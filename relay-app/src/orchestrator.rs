//! Gateway orchestrator: dedup -> coalescer -> (history fetch) -> backend
//! stream wrapped by the retry policy -> presenter -> history commit.
//!
//! This is the only layer aware of all collaborators, and the only layer
//! that decides user-facing wording for failures.

use crate::tools::{
    AttachmentKind, attachment_kind, audio_arguments, extract_tool_text, file_arguments,
    image_arguments,
};
use anyhow::Result;
use async_trait::async_trait;
use relay_backends::{
    BackendAdapter, BackendError, BackendRequest, ChatMessage, Role,
};
use relay_core::{
    BatchHandler, BufferedBatch, DedupCache, HistoryStore, InboundFragment, RetryPolicy,
    SessionCoalescer, SessionKey, StoredMessage, ThrottledPresenter, TokenVault, ToolInvoker,
    UiSurface, classify_backend_error, CONTENT_FIELD,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DESCRIBE_ATTACHMENTS_PROMPT: &str =
    "Describe the attached content in detail, including the main elements and any text it contains.";
const EMPTY_REPLY_NOTICE: &str = "No reply was produced. Please try again.";
const CLEARED_NOTICE: &str = "Context cleared.";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub quiet_period: Duration,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    pub history_limit: usize,
    pub clear_commands: Vec<String>,
    pub model: Option<String>,
    pub audio_tool: String,
    pub file_tool: String,
    pub image_tool: String,
    pub max_attachments: usize,
}

pub struct GatewayOrchestrator {
    dedup: DedupCache,
    coalescer: Arc<SessionCoalescer>,
    pipeline: Arc<FlushPipeline>,
    clear_commands: Vec<String>,
}

impl GatewayOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: OrchestratorSettings,
        history: Arc<dyn HistoryStore>,
        surface: Arc<dyn UiSurface>,
        tools: Option<Arc<dyn ToolInvoker>>,
        adapter: Arc<dyn BackendAdapter>,
        vault: Option<Arc<TokenVault>>,
        retry: RetryPolicy,
        presenter: ThrottledPresenter,
    ) -> Arc<Self> {
        let pipeline = Arc::new(FlushPipeline {
            history,
            surface,
            tools,
            adapter,
            vault,
            retry,
            presenter,
            history_limit: settings.history_limit,
            model: settings.model,
            audio_tool: settings.audio_tool,
            file_tool: settings.file_tool,
            image_tool: settings.image_tool,
            max_attachments: settings.max_attachments.max(1),
        });
        let coalescer = Arc::new(SessionCoalescer::new(
            settings.quiet_period,
            pipeline.clone(),
        ));
        Arc::new(Self {
            dedup: DedupCache::new(settings.dedup_ttl, settings.dedup_capacity),
            coalescer,
            pipeline,
            clear_commands: settings.clear_commands,
        })
    }

    /// Returns immediately after suppressing a duplicate, handling a command,
    /// or buffering the fragment.
    #[tracing::instrument(level = "info", skip_all, fields(message_id = %fragment.message_id))]
    pub async fn handle_inbound(&self, fragment: InboundFragment) -> Result<()> {
        if !fragment.message_id.is_empty() && !self.dedup.check_and_insert(&fragment.message_id) {
            tracing::debug!("duplicate delivery suppressed");
            return Ok(());
        }

        let metadata = fragment.metadata;
        let text = fragment.text.trim().to_string();

        if !text.is_empty() && self.clear_commands.iter().any(|c| c == &text) {
            self.pipeline.clear_session(&metadata.conversation_id).await;
            return Ok(());
        }
        if text.is_empty() && fragment.attachments.is_empty() {
            return Ok(());
        }

        let key = SessionKey::scoped(&metadata.conversation_id, &metadata.sender_id);
        self.coalescer
            .enqueue(key, Some(text), fragment.attachments, metadata);
        Ok(())
    }

    /// Drain in-flight work before the process exits.
    pub async fn shutdown(&self) {
        if !self.coalescer.drain(Duration::from_secs(30)).await {
            tracing::warn!("shutdown drain timed out with flushes still in flight");
        }
    }
}

struct FlushPipeline {
    history: Arc<dyn HistoryStore>,
    surface: Arc<dyn UiSurface>,
    tools: Option<Arc<dyn ToolInvoker>>,
    adapter: Arc<dyn BackendAdapter>,
    vault: Option<Arc<TokenVault>>,
    retry: RetryPolicy,
    presenter: ThrottledPresenter,
    history_limit: usize,
    model: Option<String>,
    audio_tool: String,
    file_tool: String,
    image_tool: String,
    max_attachments: usize,
}

#[async_trait]
impl BatchHandler for FlushPipeline {
    #[tracing::instrument(level = "info", skip_all, fields(session = %key))]
    async fn on_flush(&self, key: &SessionKey, batch: BufferedBatch) -> Result<()> {
        let metadata = batch.metadata.clone();
        // Group history is shared per conversation; buffering was scoped per
        // sender, history is not.
        let history_key = SessionKey::new(&metadata.conversation_id);

        let mut text = batch.joined_text();
        if text.is_empty() && !batch.attachments.is_empty() {
            text = DESCRIBE_ATTACHMENTS_PROMPT.to_string();
        }

        let mut user_content = format!("{}: {text}", metadata.sender_label);
        for section in self.resolve_attachments(&batch, &text).await {
            user_content.push_str("\n\n");
            user_content.push_str(&section);
        }

        let stored = match self.history.get(&history_key, self.history_limit).await {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(%error, "history unavailable, continuing without it");
                Vec::new()
            }
        };
        let mut messages: Vec<ChatMessage> = stored.iter().filter_map(to_chat_message).collect();
        messages.push(ChatMessage::new(Role::User, user_content.clone()));

        let initial = json!({
            "title": "Relay",
            "status": "Thinking...",
            "content": "",
        });
        let target = match self
            .surface
            .create_stream_target(&metadata.conversation_id, initial)
            .await
        {
            Ok(target) => target,
            Err(error) => {
                tracing::error!(%error, "could not create a stream target");
                return Err(error);
            }
        };

        let adapter = self.adapter.clone();
        let vault = self.vault.clone();
        let model = self.model.clone();
        let sender_label = metadata.sender_label.clone();
        let session_key = key.as_str().to_string();
        let stream_result = self
            .retry
            .run(self.vault.as_deref(), classify_backend_error, move || {
                let adapter = adapter.clone();
                let vault = vault.clone();
                let messages = messages.clone();
                let model = model.clone();
                let sender_label = sender_label.clone();
                let session_key = session_key.clone();
                async move {
                    let token = match vault.as_ref() {
                        Some(vault) => Some(vault.token().await?),
                        None => None,
                    };
                    let request = BackendRequest::new(messages, session_key)
                        .with_sender_label(sender_label)
                        .with_model(model)
                        .with_auth_token(token);
                    adapter.stream(request).await
                }
            })
            .await;

        let events = match stream_result {
            Ok(events) => events,
            Err(error) => {
                tracing::warn!(%error, "backend call failed after retries");
                let wording = user_facing_error(&error);
                let _ = self
                    .surface
                    .push_update(&target, CONTENT_FIELD, &wording, true)
                    .await;
                let _ = self
                    .surface
                    .commit_final(&target, json!({ "content": wording, "is_error": true }))
                    .await;
                return Ok(());
            }
        };

        let run = self.presenter.present(&target, events).await;

        if let Some(usage) = &run.usage {
            tracing::info!(
                model = %usage.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                latency_ms = usage.latency_ms,
                "backend usage"
            );
        }

        if let Some(error) = &run.error {
            let wording = format!("The request could not be completed: {error}");
            let _ = self
                .surface
                .commit_final(
                    &target,
                    json!({
                        "content": run.answer,
                        "error": wording,
                        "is_error": true,
                    }),
                )
                .await;
            return Ok(());
        }

        let mut final_answer = run.answer.trim().to_string();
        if final_answer.is_empty() {
            final_answer = EMPTY_REPLY_NOTICE.to_string();
            let _ = self
                .surface
                .push_update(&target, CONTENT_FIELD, &final_answer, true)
                .await;
        }

        if let Err(error) = self
            .history
            .append(
                &history_key,
                "user",
                &user_content,
                Some(&metadata.sender_label),
                None,
            )
            .await
        {
            tracing::warn!(%error, "failed to record user message");
        }
        if let Err(error) = self
            .history
            .append(
                &history_key,
                "assistant",
                &final_answer,
                None,
                Some(self.adapter.backend_id()),
            )
            .await
        {
            tracing::warn!(%error, "failed to record assistant message");
        }

        let status = run
            .usage
            .as_ref()
            .map(|u| format!("{} | {} in / {} out | {} ms", u.model, u.input_tokens, u.output_tokens, u.latency_ms))
            .unwrap_or_default();
        if let Err(error) = self
            .surface
            .commit_final(
                &target,
                json!({
                    "content": final_answer,
                    "status": status,
                }),
            )
            .await
        {
            tracing::warn!(%error, "final commit failed");
        }
        Ok(())
    }
}

impl FlushPipeline {
    async fn clear_session(&self, conversation_id: &str) {
        let key = SessionKey::new(conversation_id);
        if let Err(error) = self.history.clear(&key).await {
            tracing::warn!(%error, "history clear failed");
        }
        match self
            .surface
            .create_stream_target(conversation_id, json!({ "title": "Relay", "content": "" }))
            .await
        {
            Ok(target) => {
                let _ = self
                    .surface
                    .commit_final(&target, json!({ "content": CLEARED_NOTICE }))
                    .await;
            }
            Err(error) => tracing::warn!(%error, "could not confirm history clear"),
        }
    }

    async fn resolve_attachments(&self, batch: &BufferedBatch, prompt: &str) -> Vec<String> {
        if batch.attachments.is_empty() {
            return Vec::new();
        }
        let Some(tools) = &self.tools else {
            return vec![format!(
                "[{} attachment(s) received, but no tool service is configured]",
                batch.attachments.len()
            )];
        };

        let mut sections = Vec::new();
        for (index, attachment) in batch.attachments.iter().take(self.max_attachments).enumerate()
        {
            let position = index + 1;
            let (tool, arguments) = match attachment_kind(&attachment.content_type) {
                AttachmentKind::Audio => (
                    &self.audio_tool,
                    audio_arguments(&attachment.data, &attachment.name),
                ),
                AttachmentKind::Image => (
                    &self.image_tool,
                    image_arguments(&attachment.data, &attachment.name, prompt),
                ),
                AttachmentKind::File => (
                    &self.file_tool,
                    file_arguments(&attachment.data, &attachment.name),
                ),
            };
            match tools.invoke(tool, arguments).await {
                Ok(result) => match extract_tool_text(&result) {
                    Some(text) => {
                        sections.push(format!("[attachment {position}: {}]\n{text}", attachment.name));
                    }
                    None => {
                        sections.push(format!(
                            "[attachment {position}: {}]\n(empty result)",
                            attachment.name
                        ));
                    }
                },
                Err(error) => {
                    sections.push(format!(
                        "[attachment {position}: {} failed]\n{error}",
                        attachment.name
                    ));
                }
            }
        }
        if batch.attachments.len() > self.max_attachments {
            sections.push(format!(
                "[{} more attachment(s) were skipped]",
                batch.attachments.len() - self.max_attachments
            ));
        }
        sections
    }
}

fn to_chat_message(stored: &StoredMessage) -> Option<ChatMessage> {
    if stored.content.is_empty() {
        return None;
    }
    match stored.role.as_str() {
        "user" => Some(ChatMessage::new(Role::User, stored.content.clone())),
        "assistant" => {
            let content = match stored.origin_label.as_deref() {
                Some(origin) if !origin.is_empty() => {
                    format!("[{origin}] {}", stored.content)
                }
                _ => stored.content.clone(),
            };
            Some(ChatMessage::new(Role::Assistant, content))
        }
        _ => None,
    }
}

fn user_facing_error(error: &BackendError) -> String {
    match error {
        BackendError::Transport(_) => {
            "The backend is unreachable right now. Please try again shortly.".to_string()
        }
        BackendError::Auth(_) => {
            "The backend rejected our credentials. Please contact an administrator.".to_string()
        }
        BackendError::Protocol(message) => {
            format!("The backend answered with an unexpected protocol response: {message}")
        }
        BackendError::Content(message) => {
            format!("The request was declined by the backend: {message}")
        }
    }
}
