//! Error types for strata-vault wire handling.

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The fixed-size header could not be parsed. Framing cannot be trusted afterwards.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Fewer bytes were available than the header declared.
    #[error("truncated body: expected {expected} bytes, got {actual}")]
    TruncatedBody {
        /// Bytes declared by the header.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// A component failed its schema or field constraints.
    #[error("schema violation in {component}: {reason}")]
    SchemaViolation {
        /// Which component failed ("header", "auth", "file", ...).
        component: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A header could not fit in the fixed header size.
    #[error("header overflow: {0} bytes exceeds the fixed header size")]
    HeaderOverflow(usize),

    /// JSON serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodecError {
    /// Shorthand for a schema violation.
    pub fn schema(component: &'static str, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            component,
            reason: reason.into(),
        }
    }

    /// Whether this error leaves the byte stream desynchronized.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedHeader(_) | Self::HeaderOverflow(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CodecError::TruncatedBody {
            expected: 10,
            actual: 4,
        };
        assert_eq!(err.to_string(), "truncated body: expected 10 bytes, got 4");

        let err = CodecError::schema("file", "subject_file is empty");
        assert!(err.to_string().contains("file"));
        assert!(err.to_string().contains("subject_file is empty"));
    }

    #[test]
    fn only_header_errors_are_fatal() {
        assert!(CodecError::MalformedHeader("x".into()).is_fatal());
        assert!(!CodecError::schema("auth", "bad").is_fatal());
        assert!(!CodecError::TruncatedBody {
            expected: 1,
            actual: 0
        }
        .is_fatal());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CodecError>();
    }
}
