//! Bearer-credential cache with expiry and early-refresh margin.

use async_trait::async_trait;
use relay_backends::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Floor on the effective validity so a pathologically short TTL can never
/// produce an already-expired record.
const MIN_VALIDITY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    pub expires_in: Duration,
}

/// Issues a bearer token plus its TTL. Called at most once per effective
/// expiry window.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn issue(&self) -> Result<IssuedCredential>;
}

#[derive(Debug)]
struct CredentialRecord {
    token: String,
    effective_expiry: Instant,
}

pub struct TokenVault {
    source: Arc<dyn CredentialSource>,
    early_refresh_margin: Duration,
    state: Mutex<Option<CredentialRecord>>,
}

impl TokenVault {
    pub fn new(source: Arc<dyn CredentialSource>, early_refresh_margin: Duration) -> Self {
        Self {
            source,
            early_refresh_margin,
            state: Mutex::new(None),
        }
    }

    /// Cached token while valid; a fresh issue otherwise. The lock makes
    /// refreshes single-flight across concurrent callers.
    pub async fn token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.as_ref() {
            if Instant::now() < record.effective_expiry {
                return Ok(record.token.clone());
            }
        }
        self.refresh_locked(&mut state).await
    }

    /// Unconditional re-issue, used by the retry policy's auth branch.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Drop the cached record without issuing a new one.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        *state = None;
    }

    async fn refresh_locked(&self, state: &mut Option<CredentialRecord>) -> Result<String> {
        let issued = self.source.issue().await?;
        let validity = issued
            .expires_in
            .saturating_sub(self.early_refresh_margin)
            .max(MIN_VALIDITY);
        tracing::debug!(
            expires_in_secs = issued.expires_in.as_secs(),
            effective_secs = validity.as_secs(),
            "credential refreshed"
        );
        *state = Some(CredentialRecord {
            token: issued.token.clone(),
            effective_expiry: Instant::now() + validity,
        });
        Ok(issued.token)
    }
}
