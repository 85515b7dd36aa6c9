//! Retry policy over upstream requests.
//!
//! The driver owns failure classification: 403 triggers one reactive token
//! refresh, 429/5xx/transport timeouts back off exponentially, any other 4xx
//! surfaces immediately with the upstream body. Streaming responses are only
//! retried here, before the first body byte is handed to the transcoder; a
//! mid-stream failure truncates instead (see `transcode`).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use kiro_core::error::{GatewayError, Result};

use crate::auth::TokenSource;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, not retries-after-first.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_secs: f64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs_f64(base_delay_secs),
        }
    }

    /// Delay slept after failed attempt `attempt` (zero-based):
    /// `base * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(2f64.powi(attempt as i32))
    }
}

/// Issue a request, re-acquiring the bearer token per attempt. `send` must
/// rebuild the full request each call — the body is a buffered JSON payload,
/// so replaying is cheap.
pub async fn request_with_retry<F, Fut>(
    policy: &RetryPolicy,
    tokens: &dyn TokenSource,
    mut send: F,
) -> Result<reqwest::Response>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut refreshed_for_auth = false;
    let mut attempt: u32 = 0;
    let mut last_error = String::from("no attempts made");

    while attempt < policy.max_retries {
        let token = tokens.access_token().await?;
        match send(token).await {
            Ok(resp) => {
                let status = resp.status().as_u16();

                if status == 403 && !refreshed_for_auth {
                    warn!(status, "upstream rejected token, forcing refresh");
                    refreshed_for_auth = true;
                    tokens.force_refresh().await?;
                    attempt += 1;
                    last_error = "upstream status 403".to_string();
                    continue;
                }

                if status == 429 || (500..=599).contains(&status) {
                    last_error = format!("upstream status {status}");
                    attempt += 1;
                    if attempt < policy.max_retries {
                        let delay = policy.backoff_delay(attempt - 1);
                        warn!(
                            status,
                            delay_ms = delay.as_millis() as u64,
                            "transient upstream failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }

                if !(200..=299).contains(&status) {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(GatewayError::Upstream { status, body });
                }

                return Ok(resp);
            }
            Err(e) if e.is_timeout() || e.is_connect() => {
                last_error = e.to_string();
                attempt += 1;
                if attempt < policy.max_retries {
                    let delay = policy.backoff_delay(attempt - 1);
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "upstream transport failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(GatewayError::Network(e.to_string())),
        }
    }

    Err(GatewayError::UpstreamUnavailable {
        attempts: policy.max_retries,
        last: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeTokens {
        refreshes: AtomicU32,
    }

    impl FakeTokens {
        fn new() -> Self {
            Self {
                refreshes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenSource for FakeTokens {
        async fn access_token(&self) -> Result<String> {
            Ok(format!("tok-{}", self.refreshes.load(Ordering::SeqCst)))
        }

        async fn force_refresh(&self) -> Result<String> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("tok-{n}"))
        }
    }

    fn response(status: u16, body: &str) -> reqwest::Response {
        reqwest::Response::from(
            http::Response::builder()
                .status(status)
                .body(body.to_string())
                .unwrap(),
        )
    }

    fn scripted(
        statuses: Vec<u16>,
    ) -> (
        Arc<Mutex<Vec<u16>>>,
        Arc<AtomicU32>,
    ) {
        (Arc::new(Mutex::new(statuses)), Arc::new(AtomicU32::new(0)))
    }

    #[test]
    fn backoff_follows_exponential_sequence() {
        let policy = RetryPolicy::new(3, 1.0);
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn forbidden_triggers_exactly_one_refresh_then_retry() {
        let tokens = FakeTokens::new();
        let (statuses, calls) = scripted(vec![403, 200]);
        let policy = RetryPolicy::new(3, 1.0);

        let result = request_with_retry(&policy, &tokens, |_token| {
            let statuses = statuses.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let status = statuses.lock().unwrap().remove(0);
                Ok(response(status, "ok"))
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_forbidden_surfaces_upstream_error() {
        let tokens = FakeTokens::new();
        let (statuses, calls) = scripted(vec![403, 403]);
        let policy = RetryPolicy::new(3, 1.0);

        let err = request_with_retry(&policy, &tokens, |_token| {
            let statuses = statuses.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let status = statuses.lock().unwrap().remove(0);
                Ok(response(status, "denied"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Upstream { status: 403, .. }));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_is_retried_with_backoff() {
        let tokens = FakeTokens::new();
        let (statuses, calls) = scripted(vec![500, 429, 200]);
        let policy = RetryPolicy::new(3, 1.0);

        let result = request_with_retry(&policy, &tokens, |_token| {
            let statuses = statuses.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let status = statuses.lock().unwrap().remove(0);
                Ok(response(status, ""))
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_unavailable() {
        let tokens = FakeTokens::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 1.0);

        let err = request_with_retry(&policy, &tokens, |_token| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(response(503, "overloaded"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::UpstreamUnavailable { attempts: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_client_error_is_not_retried() {
        let tokens = FakeTokens::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 1.0);

        let err = request_with_retry(&policy, &tokens, |_token| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(response(422, "bad payload"))
            }
        })
        .await
        .unwrap_err();

        match err {
            GatewayError::Upstream { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad payload");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
