//! Serialized session record handed to clients.

use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Length of an access token in hex characters.
pub const TOKEN_HEX_LEN: usize = 512;

/// Length of a refresh digest in hex characters.
pub const REFRESH_DIGEST_HEX_LEN: usize = 128;

/// Session credentials returned by `AUTH` and `SREF`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionToken {
    /// Opaque access token (512 hex chars)
    pub token: String,
    /// Single-use refresh digest (128 hex chars)
    pub refresh_digest: String,
    /// Session lifespan in seconds
    pub lifespan: u64,
    /// Unix timestamp (seconds) after which the token is rejected
    pub valid_until: u64,
    /// Refresh iteration, 0 right after `AUTH`
    pub iteration: u64,
}

impl SessionToken {
    /// Check the fixed-length fields.
    pub fn validate(&self) -> Result<(), CodecError> {
        if !is_hex_of_len(&self.token, TOKEN_HEX_LEN) {
            return Err(CodecError::schema(
                "token",
                format!("token must be {TOKEN_HEX_LEN} hex characters"),
            ));
        }
        if !is_hex_of_len(&self.refresh_digest, REFRESH_DIGEST_HEX_LEN) {
            return Err(CodecError::schema(
                "token",
                format!("refresh_digest must be {REFRESH_DIGEST_HEX_LEN} hex characters"),
            ));
        }
        Ok(())
    }
}

pub(crate) fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionToken {
        SessionToken {
            token: "ab".repeat(TOKEN_HEX_LEN / 2),
            refresh_digest: "0f".repeat(REFRESH_DIGEST_HEX_LEN / 2),
            lifespan: 86_400,
            valid_until: 1_700_086_400,
            iteration: 0,
        }
    }

    #[test]
    fn token_record_serializes_expected_fields() {
        let json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 5);
        for key in ["token", "refresh_digest", "lifespan", "valid_until", "iteration"] {
            assert!(obj.contains_key(key), "{key}");
        }
        assert_eq!(obj["token"].as_str().unwrap().len(), 512);
        assert_eq!(obj["refresh_digest"].as_str().unwrap().len(), 128);
    }

    #[test]
    fn validate_checks_lengths() {
        assert!(sample().validate().is_ok());

        let mut short = sample();
        short.token.pop();
        assert!(short.validate().is_err());

        let mut not_hex = sample();
        not_hex.refresh_digest = "zz".repeat(64);
        assert!(not_hex.validate().is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["extra"] = serde_json::json!(1);
        assert!(serde_json::from_value::<SessionToken>(json).is_err());
    }
}
