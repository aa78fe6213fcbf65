/// Error type for cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// A layer operation failed (network error, timeout, closed client).
    #[error("[{tier}] cache error for key '{key}': {message}")]
    Operation {
        tier: String,
        key: String,
        message: String,
    },
    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The key is empty or otherwise unusable.
    #[error("Invalid cache key: '{0}'")]
    InvalidKey(String),
    /// A wildcard pattern could not be compiled.
    #[error("Invalid key pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    /// A destructive operation was requested without the expected confirmation token.
    #[error("Confirmation token rejected")]
    Confirmation,
    /// Configuration could not be applied.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        tier: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Operation {
            tier: tier.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new pattern error.
    pub fn invalid_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::InvalidPattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }
}
