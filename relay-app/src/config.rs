//! Relaybot configuration loader.

use relay_core::{AnimationConfig, PresenterConfig, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub presenter: PresenterSection,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Inbound silence required before a buffered batch is flushed.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Inbound texts that clear the session's history instead of dispatching.
    #[serde(default = "default_clear_commands")]
    pub clear_commands: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            history_limit: default_history_limit(),
            clear_commands: default_clear_commands(),
        }
    }
}

fn default_quiet_period_ms() -> u64 {
    2000
}

fn default_history_limit() -> usize {
    50
}

fn default_clear_commands() -> Vec<String> {
    vec!["/clear".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sse,
    Rpc,
    /// Deterministic local source; runs without external services.
    Dev,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Forwarded to SSE backends that route on an agent id.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

fn default_run_deadline_secs() -> u64 {
    180
}

fn default_client_id() -> String {
    "relaybot".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    Http,
    /// Log-only surface for dev and tests.
    #[default]
    Log,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default)]
    pub kind: SurfaceKind,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Fixed bearer token; takes precedence over the issuing endpoint.
    #[serde(default)]
    pub static_token: Option<String>,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_early_refresh_secs")]
    pub early_refresh_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            static_token: None,
            token_url: String::new(),
            app_key: String::new(),
            app_secret: String::new(),
            early_refresh_secs: default_early_refresh_secs(),
        }
    }
}

fn default_early_refresh_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_audio_tool")]
    pub audio_tool: String,
    #[serde(default = "default_file_tool")]
    pub file_tool: String,
    #[serde(default = "default_image_tool")]
    pub image_tool: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            audio_tool: default_audio_tool(),
            file_tool: default_file_tool(),
            image_tool: default_image_tool(),
            timeout_secs: default_tool_timeout_secs(),
            max_attachments: default_max_attachments(),
        }
    }
}

fn default_audio_tool() -> String {
    "asr.transcribe".to_string()
}

fn default_file_tool() -> String {
    "file.summarize".to_string()
}

fn default_image_tool() -> String {
    "vision.describe".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_max_attachments() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Default: `~/.relaybot/data/history`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_history_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_history_max_messages")]
    pub max_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            ttl_secs: default_history_ttl_secs(),
            max_messages: default_history_max_messages(),
        }
    }
}

fn default_history_ttl_secs() -> u64 {
    259_200
}

fn default_history_max_messages() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter_ms: default_retry_jitter_ms(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    800
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_retry_jitter_ms() -> u64 {
    350
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
            capacity: default_dedup_capacity(),
        }
    }
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_dedup_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenterSection {
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_typing_enabled")]
    pub typing_enabled: bool,
    #[serde(default = "default_typing_interval_ms")]
    pub typing_interval_ms: u64,
    #[serde(default = "default_typing_frames")]
    pub typing_frames: Vec<String>,
}

impl Default for PresenterSection {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            typing_enabled: default_typing_enabled(),
            typing_interval_ms: default_typing_interval_ms(),
            typing_frames: default_typing_frames(),
        }
    }
}

fn default_update_interval_ms() -> u64 {
    1000
}

fn default_typing_enabled() -> bool {
    true
}

fn default_typing_interval_ms() -> u64 {
    1500
}

fn default_typing_frames() -> Vec<String> {
    vec!["Typing.".to_string(), "Typing..".to_string(), "Typing...".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8089
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: RelayConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_BACKEND_URL") {
            if !v.trim().is_empty() {
                self.backend.url = v;
            }
        }
        if let Ok(v) = std::env::var("RELAY_BACKEND_TOKEN") {
            if !v.trim().is_empty() {
                self.backend.token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAY_SURFACE_BASE_URL") {
            if !v.trim().is_empty() {
                self.surface.base_url = v;
                self.surface.kind = SurfaceKind::Http;
            }
        }
        if let Ok(v) = std::env::var("RELAY_SURFACE_TOKEN") {
            if !v.trim().is_empty() {
                self.credentials.static_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAY_TOOLS_URL") {
            if !v.trim().is_empty() {
                self.tools.url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAY_TOOLS_TOKEN") {
            if !v.trim().is_empty() {
                self.tools.token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAY_PORT") {
            if let Ok(port) = v.trim().parse::<u16>() {
                self.server.port = port;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.quiet_period_ms == 0 {
            return Err(anyhow::anyhow!("general.quiet_period_ms must be > 0"));
        }
        if self.backend.kind != BackendKind::Dev && self.backend.url.trim().is_empty() {
            return Err(anyhow::anyhow!("backend.url is required for this backend kind"));
        }
        if self.surface.kind == SurfaceKind::Http {
            if self.surface.base_url.trim().is_empty() {
                return Err(anyhow::anyhow!("surface.base_url is required for the http surface"));
            }
            let has_static = self
                .credentials
                .static_token
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
            let has_issuer = !self.credentials.token_url.trim().is_empty()
                && !self.credentials.app_key.trim().is_empty()
                && !self.credentials.app_secret.trim().is_empty();
            if !has_static && !has_issuer {
                return Err(anyhow::anyhow!(
                    "http surface needs credentials.static_token or token_url + app_key + app_secret"
                ));
            }
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.retry.attempts == 0 {
            return Err(anyhow::anyhow!("retry.attempts must be > 0"));
        }
        Ok(())
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.general.quiet_period_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.attempts,
            Duration::from_millis(self.retry.base_delay_ms.max(100)),
            Duration::from_millis(self.retry.max_delay_ms),
            Duration::from_millis(self.retry.jitter_ms),
        )
    }

    pub fn presenter_config(&self) -> PresenterConfig {
        let animation = if self.presenter.typing_enabled {
            let frames: Vec<String> = self
                .presenter
                .typing_frames
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            if frames.is_empty() {
                None
            } else {
                Some(AnimationConfig {
                    frames,
                    interval: Duration::from_millis(self.presenter.typing_interval_ms.max(200)),
                })
            }
        } else {
            None
        };
        PresenterConfig {
            update_interval: Duration::from_millis(self.presenter.update_interval_ms.max(100)),
            animation,
        }
    }

    pub fn history_data_dir(&self) -> PathBuf {
        self.history
            .data_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("history"))
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relaybot").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relaybot").join("data")
}
