//! Error types for the broker

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, DextError>;

/// Main error type for the broker
#[derive(Error, Debug)]
pub enum DextError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Vector shape mismatch: expected dimension {expected}, got {actual}")]
    Shape { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DextError {
    /// Get error code for the MCP protocol
    pub fn code(&self) -> i64 {
        match self {
            DextError::Validation(_) => -32602,
            DextError::NotFound(_) => -32001,
            DextError::Conflict(_) => -32005,
            DextError::ConfigMissing(_) => -32002,
            DextError::Upstream(_) | DextError::Http(_) => -32010,
            DextError::Shape { .. } => -32011,
            _ => -32000,
        }
    }

    /// Short machine-readable kind, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            DextError::Validation(_) => "validation",
            DextError::NotFound(_) => "not_found",
            DextError::Conflict(_) => "conflict",
            DextError::ConfigMissing(_) => "config_missing",
            DextError::Upstream(_) | DextError::Http(_) => "upstream",
            DextError::Shape { .. } => "shape",
            _ => "internal",
        }
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, DextError::Upstream(_) | DextError::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(DextError::Validation("x".into()).kind(), "validation");
        assert_eq!(DextError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(DextError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            DextError::Shape {
                expected: 1024,
                actual: 3
            }
            .kind(),
            "shape"
        );
        assert_eq!(DextError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn test_upstream_is_retryable() {
        assert!(DextError::Upstream("timeout".into()).is_retryable());
        assert!(!DextError::Validation("bad".into()).is_retryable());
    }
}
