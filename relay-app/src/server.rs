//! Webhook server and component wiring.

use crate::config::{BackendKind, RelayConfig, SurfaceKind};
use crate::dev_backends::{DevChunkSource, LogSurface};
use crate::history::FileHistoryStore;
use crate::orchestrator::{GatewayOrchestrator, OrchestratorSettings};
use crate::surface::{HttpCredentialSource, HttpSurface, StaticCredentialSource};
use crate::tools::HttpToolInvoker;
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use relay_backends::{BackendAdapter, ChunkAdapter, RpcConfig, RpcStreamAdapter, SseAdapter, SseConfig};
use relay_core::{
    Attachment, CredentialSource, FragmentMetadata, HistoryStore, InboundFragment,
    ThrottledPresenter, TokenVault, ToolInvoker, UiSurface,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let orchestrator = build_orchestrator(&cfg)?;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator.clone());

    let addr = format!("{}:{}", cfg.server.bind, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, backend = ?cfg.backend.kind, "relaybot listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining in-flight sessions");
    orchestrator.shutdown().await;
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    println!("relaybot doctor: config OK");
    println!("backend: {:?} ({})", cfg.backend.kind, cfg.backend.url);
    println!("surface: {:?}", cfg.surface.kind);
    println!(
        "tools: {}",
        cfg.tools.url.as_deref().unwrap_or("not configured")
    );
    println!("history dir: {}", cfg.history_data_dir().display());
    println!(
        "quiet period: {}ms, update interval: {}ms",
        cfg.general.quiet_period_ms, cfg.presenter.update_interval_ms
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "failed to install ctrl-c handler");
    }
}

fn build_orchestrator(cfg: &RelayConfig) -> Result<Arc<GatewayOrchestrator>> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.backend.request_timeout_secs.max(1)))
        .build()?;
    let retry = cfg.retry_policy();

    let adapter: Arc<dyn BackendAdapter> = match cfg.backend.kind {
        BackendKind::Sse => Arc::new(SseAdapter::new(
            http.clone(),
            SseConfig {
                url: cfg.backend.url.clone(),
                token: cfg.backend.token.clone(),
                model: cfg.backend.model.clone(),
                agent: cfg.backend.agent.clone(),
                request_timeout: Duration::from_secs(cfg.backend.request_timeout_secs),
            },
        )),
        BackendKind::Rpc => Arc::new(RpcStreamAdapter::new(RpcConfig {
            url: cfg.backend.url.clone(),
            token: cfg.backend.token.clone(),
            client_id: cfg.backend.client_id.clone(),
            handshake_timeout: Duration::from_secs(cfg.backend.handshake_timeout_secs),
            run_deadline: Duration::from_secs(cfg.backend.run_deadline_secs),
        })),
        BackendKind::Dev => Arc::new(ChunkAdapter::new(Arc::new(DevChunkSource))),
    };

    let vault = build_vault(cfg, &http);
    let surface: Arc<dyn UiSurface> = match cfg.surface.kind {
        SurfaceKind::Http => {
            let vault = vault.clone().ok_or_else(|| {
                anyhow::anyhow!("http surface requires configured credentials")
            })?;
            Arc::new(HttpSurface::new(
                http.clone(),
                cfg.surface.base_url.clone(),
                vault,
                retry.clone(),
            ))
        }
        SurfaceKind::Log => Arc::new(LogSurface),
    };

    let tools: Option<Arc<dyn ToolInvoker>> = cfg.tools.url.as_ref().map(|url| {
        Arc::new(HttpToolInvoker::new(
            http.clone(),
            url.clone(),
            cfg.tools.token.clone(),
            Duration::from_secs(cfg.tools.timeout_secs.max(1)),
        )) as Arc<dyn ToolInvoker>
    });

    let history: Arc<dyn HistoryStore> = Arc::new(FileHistoryStore::new(
        cfg.history_data_dir(),
        Duration::from_secs(cfg.history.ttl_secs),
        cfg.history.max_messages,
    ));

    let presenter = ThrottledPresenter::new(surface.clone(), cfg.presenter_config());

    // The vault backs the adapter's bearer only when the backend has no
    // fixed token of its own; a static backend token is never refreshable.
    let backend_vault = if cfg.backend.token.is_none() {
        vault
    } else {
        None
    };

    Ok(GatewayOrchestrator::new(
        OrchestratorSettings {
            quiet_period: cfg.quiet_period(),
            dedup_ttl: Duration::from_secs(cfg.dedup.ttl_secs),
            dedup_capacity: cfg.dedup.capacity,
            history_limit: cfg.general.history_limit,
            clear_commands: cfg.general.clear_commands.clone(),
            model: cfg.backend.model.clone(),
            audio_tool: cfg.tools.audio_tool.clone(),
            file_tool: cfg.tools.file_tool.clone(),
            image_tool: cfg.tools.image_tool.clone(),
            max_attachments: cfg.tools.max_attachments,
        },
        history,
        surface,
        tools,
        adapter,
        backend_vault,
        retry,
        presenter,
    ))
}

fn build_vault(cfg: &RelayConfig, http: &reqwest::Client) -> Option<Arc<TokenVault>> {
    let margin = Duration::from_secs(cfg.credentials.early_refresh_secs);
    if let Some(token) = cfg
        .credentials
        .static_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
    {
        let source: Arc<dyn CredentialSource> = Arc::new(StaticCredentialSource::new(token));
        return Some(Arc::new(TokenVault::new(source, margin)));
    }
    if !cfg.credentials.token_url.trim().is_empty() {
        let source: Arc<dyn CredentialSource> = Arc::new(HttpCredentialSource::new(
            http.clone(),
            cfg.credentials.token_url.clone(),
            cfg.credentials.app_key.clone(),
            cfg.credentials.app_secret.clone(),
        ));
        return Some(Arc::new(TokenVault::new(source, margin)));
    }
    None
}

#[derive(Debug, Deserialize)]
struct WebhookAttachment {
    name: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    data_base64: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    message_id: String,
    conversation_id: String,
    sender_id: String,
    #[serde(default)]
    sender_label: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    attachments: Vec<WebhookAttachment>,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Acknowledges immediately after suppressing a duplicate, buffering, or
/// handling a command; the actual exchange runs on the coalescer's schedule.
async fn webhook(
    State(orchestrator): State<Arc<GatewayOrchestrator>>,
    Json(event): Json<WebhookEvent>,
) -> impl IntoResponse {
    let fragment = match to_fragment(event) {
        Ok(fragment) => fragment,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": error.to_string() })),
            );
        }
    };

    match orchestrator.handle_inbound(fragment).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(error) => {
            tracing::error!(%error, "webhook handling failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

fn to_fragment(event: WebhookEvent) -> Result<InboundFragment> {
    if event.conversation_id.trim().is_empty() {
        return Err(anyhow::anyhow!("conversation_id is required"));
    }
    if event.sender_id.trim().is_empty() {
        return Err(anyhow::anyhow!("sender_id is required"));
    }

    let mut attachments = Vec::with_capacity(event.attachments.len());
    for attachment in event.attachments {
        let data = BASE64
            .decode(attachment.data_base64.as_bytes())
            .map_err(|e| anyhow::anyhow!("attachment {}: invalid base64: {e}", attachment.name))?;
        attachments.push(Attachment {
            name: attachment.name,
            content_type: attachment.content_type,
            data,
        });
    }

    let sender_label = event
        .sender_label
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| event.sender_id.clone());

    Ok(InboundFragment {
        message_id: event.message_id,
        text: event.text,
        attachments,
        metadata: FragmentMetadata {
            conversation_id: event.conversation_id,
            sender_id: event.sender_id,
            sender_label,
            is_group: event.is_group,
            received_at: Utc::now(),
        },
    })
}
