//! Model-level error types.

use thiserror::Error;

/// Errors raised while parsing or validating domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported provider URL: {0}")]
    UnsupportedProvider(String),

    #[error("Invalid {provider} id: {id}")]
    InvalidId { provider: &'static str, id: String },

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl ModelError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
