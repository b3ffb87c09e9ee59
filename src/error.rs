//! Error types for Spotter

use thiserror::Error;

/// Result type alias for Spotter operations
pub type Result<T> = std::result::Result<T, SpotterError>;

/// Main error type for Spotter
///
/// Domain-expected rejections (input validation, safety gates) are not
/// errors; they travel as [`crate::types::ToolResult::Rejected`] values.
/// This enum covers infrastructure and invariant failures.
#[derive(Error, Debug)]
pub enum SpotterError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Provider error (retryable: {retryable}): {message}")]
    Provider { message: String, retryable: bool },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Variant disabled: {0}")]
    VariantDisabled(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "openai")]
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpotterError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SpotterError::Provider { retryable, .. } => *retryable,
            SpotterError::Timeout(_) => true,
            #[cfg(feature = "openai")]
            SpotterError::Http(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SpotterError::Timeout("embedder".into()).is_retryable());
        assert!(SpotterError::Provider {
            message: "429".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!SpotterError::Provider {
            message: "empty input".into(),
            retryable: false
        }
        .is_retryable());
        assert!(!SpotterError::Integrity("dup terminal".into()).is_retryable());
    }
}
