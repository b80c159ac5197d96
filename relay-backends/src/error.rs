use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Network-level faults: resets, timeouts, 5xx. Eligible for retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// 401/403/expired-credential class. Requires a fresh credential before
    /// any retry makes sense.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed handshake, rejected acknowledgement, unparseable control
    /// frame. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend explicitly rejected the request (safety/policy block or
    /// an error payload). Retrying an identical request cannot change it.
    #[error("content rejected: {0}")]
    Content(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

const RETRYABLE_KEYWORDS: &[&str] = &[
    "ssl",
    "eof",
    "timeout",
    "timed out",
    "connection reset",
    "connection aborted",
    "connection refused",
    "connection error",
    "temporarily unavailable",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

const AUTH_KEYWORDS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid access token",
    "token expired",
];

/// 401/403-class failure text. Auth failures are never blindly retryable;
/// they need a fresh credential first.
pub fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

pub fn is_retryable_message(message: &str) -> bool {
    if is_auth_message(message) {
        return false;
    }
    let lower = message.to_lowercase();
    RETRYABLE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
