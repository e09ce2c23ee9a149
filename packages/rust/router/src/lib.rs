//! Model-routing capability consumed by the intent pipeline.
//!
//! This crate provides:
//! - [`ModelRouter`]: the narrow `complete(tier, prompts, limits) -> text` contract
//! - [`GuardedRouter`]: timeout, retry and cancellation around any router
//! - [`OpenRouterClient`]: an OpenAI-compatible chat-completions adapter
//!
//! The pipeline never knows which vendor or model services a tier.

pub mod guarded;
pub mod openrouter;

use async_trait::async_trait;
use intentflow_shared::{IntentflowError, ModelTier, Result};

pub use guarded::{GuardedRouter, RetryPolicy};
pub use openrouter::OpenRouterClient;

/// A single completion request routed to a model tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub tier: ModelTier,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(
        tier: ModelTier,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            tier,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            max_tokens: 1_000,
            temperature: 0.2,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// The same request sent to another tier.
    pub fn on_tier(&self, tier: ModelTier) -> Self {
        Self {
            tier,
            ..self.clone()
        }
    }
}

/// Something that can turn a prompt into text on a given tier.
#[async_trait]
pub trait ModelRouter: Send + Sync {
    /// Run one completion. Implementations should not retry; [`GuardedRouter`] does.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Human-readable router name for tracing.
    fn name(&self) -> &str;
}

/// Router used when no model is reachable; every call fails.
///
/// The pipeline degrades to its local classifiers when wired to this.
pub struct UnavailableRouter;

#[async_trait]
impl ModelRouter for UnavailableRouter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        Err(IntentflowError::Router(format!(
            "no model available for the {} tier",
            request.tier
        )))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}
