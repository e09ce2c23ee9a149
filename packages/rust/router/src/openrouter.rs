//! OpenAI-compatible chat-completions adapter (OpenRouter by default).
//!
//! Maps each [`ModelTier`] to the model id bound in `[tiers]` and posts a
//! two-message (system + user) conversation to `{base_url}/chat/completions`.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use intentflow_shared::{
    AppConfig, IntentflowError, ModelTier, OpenRouterConfig, Result, TierBindings,
};

use crate::{CompletionRequest, ModelRouter};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP router for any OpenAI-compatible endpoint.
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    tiers: TierBindings,
}

impl OpenRouterClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        tiers: TierBindings,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("intentflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IntentflowError::Router(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            tiers,
        })
    }

    /// Build a client from the app config, reading the API key from the
    /// environment variable named in `[openrouter].api_key_env`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let OpenRouterConfig {
            api_key_env,
            base_url,
        } = &config.openrouter;
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                IntentflowError::config(format!("{api_key_env} is not set"))
            })?;
        Self::new(base_url.clone(), api_key, config.tiers.clone())
    }

    fn model_for(&self, tier: ModelTier) -> Result<&str> {
        self.tiers
            .model_for(tier)
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| IntentflowError::config(format!("no model bound to the {tier} tier")))
    }
}

#[async_trait]
impl ModelRouter for OpenRouterClient {
    #[instrument(skip_all, fields(tier = %request.tier))]
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let model = self.model_for(request.tier)?;
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let start = Instant::now();
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| IntentflowError::Router(format!("request to {model} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let snippet: String = detail.chars().take(200).collect();
            return Err(IntentflowError::Router(format!(
                "{model} returned {status}: {snippet}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| IntentflowError::parse(format!("invalid completion body: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| IntentflowError::parse("completion had no content"))?;

        debug!(
            model,
            latency_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "completion received"
        );
        Ok(text)
    }

    fn name(&self) -> &str {
        "openrouter"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
