//! Bounded exponential backoff with jitter and auth-aware classification.

use crate::vault::TokenVault;
use relay_backends::{BackendError, is_auth_message, is_retryable_message};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Auth,
    Permanent,
}

/// Structural classification first, keyword fallback for transport text
/// that hides an auth failure (an HTTP layer reporting "401" in prose).
pub fn classify_backend_error(error: &BackendError) -> FailureKind {
    match error {
        BackendError::Auth(_) => FailureKind::Auth,
        BackendError::Protocol(_) | BackendError::Content(_) => FailureKind::Permanent,
        BackendError::Transport(message) => {
            if is_auth_message(message) {
                FailureKind::Auth
            } else {
                FailureKind::Retryable
            }
        }
    }
}

/// Keyword-only classification for collaborators that surface plain error
/// text. Unknown failures are not retried blindly.
pub fn classify_message(message: &str) -> FailureKind {
    if is_auth_message(message) {
        FailureKind::Auth
    } else if is_retryable_message(message) {
        FailureKind::Retryable
    } else {
        FailureKind::Permanent
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// `min(max_delay, base * 2^(attempt-1)) + uniform(0, jitter)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        exponential + self.jitter.mul_f64(rand::random::<f64>())
    }

    /// Run `op` until success, a permanent failure, or the attempt ceiling.
    ///
    /// An `Auth` failure triggers exactly one forced vault refresh plus one
    /// immediate retry outside the backoff ladder; if that retry fails with
    /// another auth failure the call aborts (auth errors are never blindly
    /// retried).
    pub async fn run<T, E, F, Fut, C>(
        &self,
        vault: Option<&TokenVault>,
        classify: C,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
        E: Display,
    {
        let mut attempt = 1u32;
        let mut auth_retry_used = false;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match classify(&error) {
                FailureKind::Permanent => return Err(error),
                FailureKind::Auth => {
                    if auth_retry_used {
                        return Err(error);
                    }
                    auth_retry_used = true;
                    if let Some(vault) = vault {
                        if let Err(refresh_error) = vault.force_refresh().await {
                            tracing::warn!(%refresh_error, "forced credential refresh failed");
                        }
                        tracing::info!(%error, "auth failure, retrying once with fresh credential");
                        continue;
                    }
                    return Err(error);
                }
                FailureKind::Retryable => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            attempts = attempt,
                            %error,
                            "retry ceiling reached"
                        );
                        return Err(error);
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`run`](Self::run), for operations that never legitimately
    /// return empty: an `Ok(None)` counts as a retryable failure.
    pub async fn run_nonempty<T, E, F, Fut, C, M>(
        &self,
        vault: Option<&TokenVault>,
        classify: C,
        empty_error: M,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        C: Fn(&E) -> FailureKind,
        M: Fn() -> E,
        E: Display,
    {
        let wrapped = self
            .run(
                vault,
                |error: &EmptyOr<E>| match error {
                    EmptyOr::Empty => FailureKind::Retryable,
                    EmptyOr::Inner(inner) => classify(inner),
                },
                || {
                    let fut = op();
                    async move {
                        match fut.await {
                            Ok(Some(value)) => Ok(value),
                            Ok(None) => Err(EmptyOr::Empty),
                            Err(error) => Err(EmptyOr::Inner(error)),
                        }
                    }
                },
            )
            .await;
        match wrapped {
            Ok(value) => Ok(value),
            Err(EmptyOr::Inner(error)) => Err(error),
            Err(EmptyOr::Empty) => Err(empty_error()),
        }
    }
}

enum EmptyOr<E> {
    Empty,
    Inner(E),
}

impl<E: Display> Display for EmptyOr<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmptyOr::Empty => f.write_str("operation returned an empty result"),
            EmptyOr::Inner(error) => error.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{CredentialSource, IssuedCredential};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(800),
            Duration::from_secs(8),
            Duration::from_millis(350),
        )
    }

    #[test]
    fn classification_follows_the_taxonomy() {
        assert_eq!(
            classify_backend_error(&BackendError::Transport("connection reset".into())),
            FailureKind::Retryable
        );
        assert_eq!(
            classify_backend_error(&BackendError::Transport("401 unauthorized".into())),
            FailureKind::Auth
        );
        assert_eq!(
            classify_backend_error(&BackendError::Auth("token expired".into())),
            FailureKind::Auth
        );
        assert_eq!(
            classify_backend_error(&BackendError::Protocol("bad ack".into())),
            FailureKind::Permanent
        );
        assert_eq!(
            classify_backend_error(&BackendError::Content("policy block".into())),
            FailureKind::Permanent
        );

        assert_eq!(classify_message("gateway timeout"), FailureKind::Retryable);
        assert_eq!(classify_message("403 forbidden"), FailureKind::Auth);
        assert_eq!(classify_message("weird failure"), FailureKind::Permanent);
    }

    #[test]
    fn backoff_delay_is_exponential_capped_and_jittered() {
        let policy = policy(5);
        for attempt in 1..=6 {
            let exponential = Duration::from_millis(800)
                .saturating_mul(1 << (attempt - 1))
                .min(Duration::from_secs(8));
            for _ in 0..16 {
                let delay = policy.backoff_delay(attempt);
                assert!(delay >= exponential, "attempt {attempt}: {delay:?}");
                assert!(
                    delay <= exponential + Duration::from_millis(350),
                    "attempt {attempt}: {delay:?}"
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, BackendError> = policy(5)
            .run(None, classify_backend_error, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 5 {
                        Err(BackendError::Transport("timed out".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("succeeds on final attempt"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_attempt_exactly_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BackendError> = policy(5)
            .run(None, classify_backend_error, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Content("policy block".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::Content(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_surfaces_the_last_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BackendError> = policy(3)
            .run(None, classify_backend_error, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Transport("service unavailable".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct CountingSource {
        issued: AtomicU32,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn issue(&self) -> relay_backends::Result<IssuedCredential> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(IssuedCredential {
                token: format!("token-{n}"),
                expires_in: Duration::from_secs(7200),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_refreshes_once_and_retries_immediately() {
        let source = Arc::new(CountingSource {
            issued: AtomicU32::new(0),
        });
        let vault = TokenVault::new(source.clone(), Duration::from_secs(120));

        let calls = AtomicU32::new(0);
        let result: Result<&str, BackendError> = policy(5)
            .run(Some(&vault), classify_backend_error, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(BackendError::Auth("401 unauthorized".to_string()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("second attempt succeeds"), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.issued.load(Ordering::SeqCst), 1, "one forced refresh");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_auth_failure_aborts() {
        let source = Arc::new(CountingSource {
            issued: AtomicU32::new(0),
        });
        let vault = TokenVault::new(source.clone(), Duration::from_secs(120));

        let calls = AtomicU32::new(0);
        let result: Result<(), BackendError> = policy(5)
            .run(Some(&vault), classify_backend_error, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Auth("token expired".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(BackendError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_results_are_retried_then_reported() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, BackendError> = policy(3)
            .run_nonempty(
                None,
                classify_backend_error,
                || BackendError::Transport("empty result".to_string()),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(None) }
                },
            )
            .await;

        assert!(matches!(result, Err(BackendError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
