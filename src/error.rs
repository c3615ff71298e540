//! Error types for the cycleid system

use thiserror::Error;

/// Main error type for cycleid operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor shape does not match what a network or loader was built for
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        /// Where the mismatch was detected
        context: String,
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// Data pipeline error
    #[error("Data error: {0}")]
    Data(String),

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for cycleid operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Shape {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a data pipeline error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error stems from a configuration problem (fatal at startup)
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Shape { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message() {
        let err = Error::shape("discriminator_X", "[N, 1, 32, 32]", "[N, 3, 32, 32]");
        let msg = err.to_string();
        assert!(msg.contains("discriminator_X"));
        assert!(msg.contains("[N, 3, 32, 32]"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_io_error_is_not_configuration() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(!err.is_configuration());
    }
}
