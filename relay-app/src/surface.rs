//! HTTP UI-surface client: stream targets are created, updated, and
//! finalized against a card service, authenticated through the token vault
//! and wrapped by the retry policy.

use anyhow::Result;
use async_trait::async_trait;
use relay_backends::BackendError;
use relay_core::{
    CredentialSource, IssuedCredential, RetryPolicy, TargetId, TokenVault, UiSurface,
    classify_message,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Fixed-token deployments: the credential never rotates, so the vault
/// simply re-issues the same value.
pub struct StaticCredentialSource {
    token: String,
}

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn issue(&self) -> relay_backends::Result<IssuedCredential> {
        Ok(IssuedCredential {
            token: self.token.clone(),
            expires_in: Duration::from_secs(86_400),
        })
    }
}

/// Exchanges an app key/secret pair for a bearer token with a TTL.
pub struct HttpCredentialSource {
    http: reqwest::Client,
    token_url: String,
    app_key: String,
    app_secret: String,
}

impl HttpCredentialSource {
    pub fn new(
        http: reqwest::Client,
        token_url: String,
        app_key: String,
        app_secret: String,
    ) -> Self {
        Self {
            http,
            token_url,
            app_key,
            app_secret,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds.
    expires_in: u64,
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn issue(&self) -> relay_backends::Result<IssuedCredential> {
        let response = self
            .http
            .post(&self.token_url)
            .json(&json!({
                "app_key": self.app_key,
                "app_secret": self.app_secret,
            }))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(500).collect();
            let message = format!("token issue status={status} body={excerpt}");
            return Err(match status.as_u16() {
                401 | 403 => BackendError::Auth(message),
                _ => BackendError::Transport(message),
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("token response: {e}")))?;
        tracing::info!(expires_in = parsed.expires_in, "access token issued");
        Ok(IssuedCredential {
            token: parsed.access_token,
            expires_in: Duration::from_secs(parsed.expires_in),
        })
    }
}

pub struct HttpSurface {
    http: reqwest::Client,
    base_url: String,
    vault: Arc<TokenVault>,
    retry: RetryPolicy,
}

impl HttpSurface {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        vault: Arc<TokenVault>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            vault,
            retry,
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let token = self.vault.token().await?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let excerpt: String = text.chars().take(500).collect();
            return Err(anyhow::anyhow!("surface {path} status={status} body={excerpt}"));
        }
        if text.is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl UiSurface for HttpSurface {
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
    async fn create_stream_target(
        &self,
        conversation_id: &str,
        initial: Value,
    ) -> Result<TargetId> {
        let body = json!({
            "conversation_id": conversation_id,
            "payload": initial,
        });
        self.retry
            .run_nonempty(
                Some(self.vault.as_ref()),
                |e: &anyhow::Error| classify_message(&e.to_string()),
                || anyhow::anyhow!("target creation returned no target id"),
                || {
                    let body = body.clone();
                    async move {
                        let value = self.post_json("/v1/stream-targets", &body).await?;
                        Ok(value
                            .get("target_id")
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                            .map(TargetId::new))
                    }
                },
            )
            .await
    }

    async fn push_update(
        &self,
        target: &TargetId,
        field: &str,
        text: &str,
        is_final: bool,
    ) -> Result<()> {
        let path = format!("/v1/stream-targets/{target}/update");
        let body = json!({
            "field": field,
            "text": text,
            "is_final": is_final,
        });
        if !is_final {
            // Non-final pushes are superseded by the next push anyway.
            self.post_json(&path, &body).await.map(|_| ())
        } else {
            self.retry
                .run(
                    Some(self.vault.as_ref()),
                    |e: &anyhow::Error| classify_message(&e.to_string()),
                    || {
                        let body = body.clone();
                        let path = path.clone();
                        async move { self.post_json(&path, &body).await.map(|_| ()) }
                    },
                )
                .await
        }
    }

    async fn commit_final(&self, target: &TargetId, payload: Value) -> Result<()> {
        let path = format!("/v1/stream-targets/{target}/commit");
        let body = json!({ "payload": payload });
        self.retry
            .run(
                Some(self.vault.as_ref()),
                |e: &anyhow::Error| classify_message(&e.to_string()),
                || {
                    let body = body.clone();
                    let path = path.clone();
                    async move { self.post_json(&path, &body).await.map(|_| ()) }
                },
            )
            .await
    }
}
