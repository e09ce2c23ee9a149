//! Stub routers shared by the unit tests in this crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use intentflow_router::{CompletionRequest, GuardedRouter, ModelRouter, RetryPolicy};
use intentflow_shared::{IntentflowError, ModelTier, Result};

type Responder = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

/// Answers every request through a closure, optionally after a delay, and
/// records what it was asked.
pub(crate) struct StubRouter {
    respond: Box<Responder>,
    delay: Option<Duration>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl StubRouter {
    pub(crate) fn with(
        respond: impl Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::with(move |_| Ok(text.clone()))
    }

    pub(crate) fn failing() -> Self {
        Self::with(|_| Err(IntentflowError::Router("503 upstream".into())))
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn tiers(&self) -> Vec<ModelTier> {
        self.calls.lock().unwrap().iter().map(|r| r.tier).collect()
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelRouter for StubRouter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(request)
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Short timeout, no retries: keeps degraded-path tests fast.
pub(crate) fn guarded(router: &Arc<StubRouter>) -> GuardedRouter {
    GuardedRouter::new(
        router.clone(),
        RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 0,
            backoff: Duration::ZERO,
        },
    )
}
