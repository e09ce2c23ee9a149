//! Error types for IntentFlow.
//!
//! Library crates use [`IntentflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::ModelTier;

/// Top-level error type for all IntentFlow operations.
#[derive(Debug, thiserror::Error)]
pub enum IntentflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Model-routing transport or provider error.
    #[error("router error: {0}")]
    Router(String),

    /// A model-routing call exceeded its time budget.
    #[error("{tier} tier call timed out after {}ms", after.as_millis())]
    Timeout { tier: ModelTier, after: Duration },

    /// The caller abandoned the run; any partial result must be discarded.
    #[error("run cancelled")]
    Cancelled,

    /// Structured output could not be extracted from model text.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error (bad input file, invalid value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IntentflowError>;

impl IntentflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether repeating the same call could succeed. Only transport
    /// failures and timeouts qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Router(_) | Self::Timeout { .. })
    }
}
