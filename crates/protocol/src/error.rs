//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A field carried a value outside its allowed set.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_invalid_value_display() {
        let err = ProtocolError::InvalidValue("unknown session status: paused".to_string());
        assert_eq!(err.to_string(), "invalid value: unknown session status: paused");
    }

    #[test]
    fn test_from_json_syntax_error() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
