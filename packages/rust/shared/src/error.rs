//! Error types for knowcrawl.
//!
//! Library crates use [`KnowCrawlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all knowcrawl operations.
#[derive(Debug, thiserror::Error)]
pub enum KnowCrawlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A prompt template references a slot the render context cannot fill.
    #[error("missing slot `{slot}` in prompt step `{step}`")]
    MissingSlot { step: String, slot: String },

    /// External capability failure (LLM invocation or content retrieval).
    ///
    /// Covers auth, HTTP status, network and malformed-response cases alike.
    #[error("service error: {0}")]
    Service(String),

    /// Input parsing error (entity lists, JSON documents).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KnowCrawlError>;

impl KnowCrawlError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a missing-slot error for `slot` in `step`.
    pub fn missing_slot(step: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::MissingSlot {
            step: step.into(),
            slot: slot.into(),
        }
    }

    /// Create a service error from any displayable message.
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = KnowCrawlError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = KnowCrawlError::missing_slot("relate", "describe");
        assert_eq!(
            err.to_string(),
            "missing slot `describe` in prompt step `relate`"
        );

        let err = KnowCrawlError::service("HTTP 429 Too Many Requests");
        assert!(err.to_string().starts_with("service error:"));
    }
}
