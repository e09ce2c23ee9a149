//! Shared types, error model, and configuration for IntentFlow.
//!
//! This crate is the foundation depended on by all other IntentFlow crates.
//! It provides:
//! - [`IntentflowError`]: the unified error type
//! - Domain types ([`ConversationMessage`], [`ConversationState`], [`WorkspaceEntity`],
//!   [`PipelineContext`], [`IntentResult`], [`ModelTier`])
//! - Configuration ([`AppConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ConfidenceBands, EscalationThresholds, OpenRouterConfig, RouterPolicyConfig,
    StageToggles, TierBindings, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_api_key,
};
pub use error::{IntentflowError, Result};
pub use types::{
    ActiveSection, Confidence, ConversationMessage, ConversationState, DocumentView, IntentKind,
    IntentResult, MAX_HISTORY, ModelTier, PipelineContext, Role, ScoredEntity, SessionId,
    WorkspaceEntity,
};
