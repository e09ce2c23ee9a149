//! Timeout, retry and cancellation around a [`ModelRouter`].
//!
//! Every model call the pipeline makes goes through [`GuardedRouter::complete`],
//! so an unresponsive provider costs at most
//! `(max_retries + 1) * timeout + max_retries * backoff` and never blocks a turn
//! indefinitely. A cancelled token aborts the pending call immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use intentflow_shared::{IntentflowError, Result, RouterPolicyConfig};

use crate::{CompletionRequest, ModelRouter};

/// Per-call time and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RouterPolicyConfig::default())
    }
}

impl From<&RouterPolicyConfig> for RetryPolicy {
    fn from(config: &RouterPolicyConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            backoff: config.backoff(),
        }
    }
}

/// A shareable router handle that enforces a [`RetryPolicy`].
#[derive(Clone)]
pub struct GuardedRouter {
    inner: Arc<dyn ModelRouter>,
    policy: RetryPolicy,
}

impl GuardedRouter {
    pub fn new(inner: Arc<dyn ModelRouter>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `request`, retrying transport failures and timeouts within the
    /// policy budget.
    ///
    /// Returns [`IntentflowError::Cancelled`] as soon as `cancel` fires.
    /// Errors that cannot clear on a retry (config, parse) are returned after
    /// the first attempt; otherwise the error is the last attempt's failure.
    #[instrument(skip_all, fields(router = self.inner.name(), tier = %request.tier))]
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let attempts = self.policy.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(IntentflowError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IntentflowError::Cancelled),
                outcome = tokio::time::timeout(self.policy.timeout, self.inner.complete(request)) => outcome,
            };

            match outcome {
                Ok(Ok(text)) => {
                    debug!(attempt, chars = text.len(), "model call succeeded");
                    return Ok(text);
                }
                Ok(Err(IntentflowError::Cancelled)) => return Err(IntentflowError::Cancelled),
                Ok(Err(e)) if !e.is_transient() => {
                    warn!(attempt, error = %e, "model call failed, not retrying");
                    return Err(e);
                }
                Ok(Err(e)) => {
                    warn!(attempt, attempts, error = %e, "model call failed");
                    last_error = Some(e);
                }
                Err(_elapsed) => {
                    warn!(
                        attempt,
                        attempts,
                        timeout_ms = self.policy.timeout.as_millis() as u64,
                        "model call timed out"
                    );
                    last_error = Some(IntentflowError::Timeout {
                        tier: request.tier,
                        after: self.policy.timeout,
                    });
                }
            }

            if attempt < attempts && !self.policy.backoff.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(IntentflowError::Cancelled),
                    _ = tokio::time::sleep(self.policy.backoff) => {}
                }
            }
        }

        Err(last_error.unwrap_or_else(|| IntentflowError::Router("no attempt was made".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use intentflow_shared::ModelTier;

    use super::*;

    /// Fails the first `failures` calls, then answers "ok".
    struct FlakyRouter {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelRouter for FlakyRouter {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(IntentflowError::Router("503 upstream".into()))
            } else {
                Ok("ok".into())
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    /// Never answers within any reasonable timeout.
    struct StalledRouter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelRouter for StalledRouter {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".into())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    /// Always fails with a configuration error.
    struct UnboundRouter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelRouter for UnboundRouter {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(IntentflowError::config(format!(
                "no model bound to the {} tier",
                request.tier
            )))
        }

        fn name(&self) -> &str {
            "unbound"
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(ModelTier::Fast, "sys", "user")
    }

    #[tokio::test]
    async fn retries_until_success() {
        let inner = Arc::new(FlakyRouter {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let router = GuardedRouter::new(inner.clone(), policy(2));

        let text = router
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let inner = Arc::new(FlakyRouter {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let router = GuardedRouter::new(inner.clone(), policy(1));

        let err = router
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IntentflowError::Router(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn config_error_is_not_retried() {
        let inner = Arc::new(UnboundRouter {
            calls: AtomicU32::new(0),
        });
        let router = GuardedRouter::new(
            inner.clone(),
            RetryPolicy {
                timeout: Duration::from_millis(50),
                max_retries: 2,
                backoff: Duration::from_secs(5),
            },
        );

        let started = std::time::Instant::now();
        let err = router
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IntentflowError::Config { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stalled_call_times_out() {
        let inner = Arc::new(StalledRouter {
            calls: AtomicU32::new(0),
        });
        let router = GuardedRouter::new(inner.clone(), policy(1));

        let err = router
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IntentflowError::Timeout {
                tier: ModelTier::Fast,
                ..
            }
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_call() {
        let inner = Arc::new(StalledRouter {
            calls: AtomicU32::new(0),
        });
        let router = GuardedRouter::new(
            inner,
            RetryPolicy {
                timeout: Duration::from_secs(10),
                max_retries: 0,
                backoff: Duration::ZERO,
            },
        );
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = router.complete(&request(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_call() {
        let inner = Arc::new(FlakyRouter {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let router = GuardedRouter::new(inner.clone(), policy(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(router.complete(&request(), &cancel).await.unwrap_err().is_cancelled());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn policy_from_config() {
        let policy = RetryPolicy::from(&RouterPolicyConfig {
            timeout_ms: 1500,
            max_retries: 3,
            retry_backoff_ms: 10,
        });
        assert_eq!(policy.timeout, Duration::from_millis(1500));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff, Duration::from_millis(10));
    }
}
