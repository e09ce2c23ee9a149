//! Application configuration for IntentFlow.
//!
//! User config lives at `~/.intentflow/intentflow.toml`.
//! CLI flags override config file values, which override defaults.
//! Threshold ordering is checked at load time so a bad file is rejected at
//! startup rather than on the first request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IntentflowError, Result};
use crate::types::ModelTier;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "intentflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".intentflow";

// ---------------------------------------------------------------------------
// Config structs (matching intentflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Model id bound to each tier.
    #[serde(default)]
    pub tiers: TierBindings,

    /// Which pipeline stages run.
    #[serde(default)]
    pub stages: StageToggles,

    /// Confidence bands used to interpret scores.
    #[serde(default)]
    pub confidence: ConfidenceBands,

    /// When to escalate away from the fast tier.
    #[serde(default)]
    pub escalation: EscalationThresholds,

    /// Timeout and retry budget for model calls.
    #[serde(default)]
    pub router: RouterPolicyConfig,
}

impl AppConfig {
    /// Reject inverted or out-of-range thresholds.
    pub fn validate(&self) -> Result<()> {
        self.confidence.validate()?;
        self.escalation.validate()?;
        self.router.validate()
    }
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[tiers]` section. A tier with no model id is unbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBindings {
    /// Model id for cheap, low-latency calls (reference resolution, first-pass analysis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<String>,
    /// Model id used when confidence is too low for the fast tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart: Option<String>,
    /// Model id for complex or conditional requests and failed-call retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Default for TierBindings {
    fn default() -> Self {
        Self {
            fast: Some("anthropic/claude-3.5-haiku".into()),
            smart: Some("anthropic/claude-sonnet-4".into()),
            reasoning: Some("openai/o3-mini".into()),
        }
    }
}

impl TierBindings {
    /// All tiers unbound.
    pub fn unbound() -> Self {
        Self {
            fast: None,
            smart: None,
            reasoning: None,
        }
    }

    /// Model id bound to `tier`, if any.
    pub fn model_for(&self, tier: ModelTier) -> Option<&str> {
        match tier {
            ModelTier::Fast => self.fast.as_deref(),
            ModelTier::Smart => self.smart.as_deref(),
            ModelTier::Reasoning => self.reasoning.as_deref(),
        }
    }

    pub fn is_bound(&self, tier: ModelTier) -> bool {
        self.model_for(tier).is_some_and(|m| !m.trim().is_empty())
    }

    /// The bound tier closest to `desired`, preferring stronger tiers over
    /// weaker ones. `None` when nothing is bound.
    pub fn nearest_bound(&self, desired: ModelTier) -> Option<ModelTier> {
        if self.is_bound(desired) {
            return Some(desired);
        }
        let stronger = ModelTier::ALL.into_iter().filter(|t| *t > desired);
        let weaker = ModelTier::ALL.into_iter().rev().filter(|t| *t < desired);
        stronger.chain(weaker).find(|t| self.is_bound(*t))
    }
}

/// `[stages]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToggles {
    /// Run local pattern triage before anything else.
    #[serde(default = "default_true")]
    pub triage: bool,
    /// Resolve references, match entities and detect follow-ups.
    #[serde(default = "default_true")]
    pub context_resolution: bool,
    /// Apply validation rules to the final intent.
    #[serde(default = "default_true")]
    pub validation: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            triage: true,
            context_resolution: true,
            validation: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[confidence]` section. Must satisfy `0 <= low < medium < high <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBands {
    /// Confidence assigned when triage finds no match or a check fails.
    #[serde(default = "default_low")]
    pub low: f32,
    /// Middle band boundary.
    #[serde(default = "default_medium")]
    pub medium: f32,
    /// A triage match at or above this skips the model.
    #[serde(default = "default_high")]
    pub high: f32,
}

impl Default for ConfidenceBands {
    fn default() -> Self {
        Self {
            low: default_low(),
            medium: default_medium(),
            high: default_high(),
        }
    }
}

impl ConfidenceBands {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("low", self.low), ("medium", self.medium), ("high", self.high)] {
            check_unit_interval("confidence", name, value)?;
        }
        if !(self.low < self.medium && self.medium < self.high) {
            return Err(IntentflowError::config(format!(
                "confidence bands must be ascending (low < medium < high), got {} / {} / {}",
                self.low, self.medium, self.high
            )));
        }
        Ok(())
    }
}

fn default_low() -> f32 {
    0.4
}
fn default_medium() -> f32 {
    0.7
}
fn default_high() -> f32 {
    0.9
}

/// `[escalation]` section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EscalationThresholds {
    /// Escalate any turn whose confidence is below this.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Escalate reasoning-heavy turns whose confidence is below this.
    #[serde(default = "default_reasoning_threshold")]
    pub reasoning_threshold: f32,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            reasoning_threshold: default_reasoning_threshold(),
        }
    }
}

impl EscalationThresholds {
    pub fn validate(&self) -> Result<()> {
        check_unit_interval("escalation", "confidence_threshold", self.confidence_threshold)?;
        check_unit_interval("escalation", "reasoning_threshold", self.reasoning_threshold)?;
        // A lower reasoning threshold would never fire: the plain rule already covers it.
        if self.reasoning_threshold < self.confidence_threshold {
            return Err(IntentflowError::config(format!(
                "escalation.reasoning_threshold ({}) must not be below confidence_threshold ({})",
                self.reasoning_threshold, self.confidence_threshold
            )));
        }
        Ok(())
    }
}

fn default_confidence_threshold() -> f32 {
    0.6
}
fn default_reasoning_threshold() -> f32 {
    0.8
}

/// `[router]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterPolicyConfig {
    /// Per-attempt timeout for a model call.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for RouterPolicyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl RouterPolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(IntentflowError::config("router.timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_timeout_ms() -> u64 {
    20_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}

fn check_unit_interval(section: &str, name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(IntentflowError::config(format!(
            "{section}.{name} must be within [0, 1], got {value}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.intentflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| IntentflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.intentflow/intentflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IntentflowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        IntentflowError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IntentflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IntentflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IntentflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(IntentflowError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("confidence_threshold"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.escalation.confidence_threshold, 0.6);
        assert_eq!(parsed.router.max_retries, 2);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[tiers]
fast = "meta-llama/llama-3.1-8b-instruct"

[stages]
validation = false
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.tiers.fast.as_deref(), Some("meta-llama/llama-3.1-8b-instruct"));
        assert!(config.tiers.smart.is_none());
        assert!(config.stages.triage);
        assert!(!config.stages.validation);
        assert_eq!(config.confidence.high, 0.9);
    }

    #[test]
    fn inverted_bands_are_rejected() {
        let mut config = AppConfig::default();
        config.confidence.medium = 0.95;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = AppConfig::default();
        config.escalation.confidence_threshold = 1.2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.escalation.reasoning_threshold = 0.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_from_rejects_invalid_file() {
        let dir = std::env::temp_dir().join(format!("intentflow-cfg-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("intentflow.toml");
        std::fs::write(&path, "[confidence]\nlow = 0.8\nmedium = 0.5\nhigh = 0.9\n").unwrap();

        let result = load_config_from(&path);
        assert!(matches!(result, Err(IntentflowError::Config { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn nearest_bound_prefers_stronger_tiers() {
        let mut tiers = TierBindings::unbound();
        assert_eq!(tiers.nearest_bound(ModelTier::Smart), None);

        tiers.fast = Some("small".into());
        tiers.reasoning = Some("big".into());
        assert_eq!(tiers.nearest_bound(ModelTier::Smart), Some(ModelTier::Reasoning));
        assert_eq!(tiers.nearest_bound(ModelTier::Fast), Some(ModelTier::Fast));

        tiers.reasoning = None;
        assert_eq!(tiers.nearest_bound(ModelTier::Reasoning), Some(ModelTier::Fast));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "IF_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
