//! Fixed-size frame headers.
//!
//! Headers are JSON objects padded with ASCII spaces to exactly
//! [`HEADER_SIZE`] bytes, so a reader always knows how much to read first.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CodecError, Operation, ResponseCode};

/// Size in bytes of every request and response header.
pub const HEADER_SIZE: usize = 256;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest auth component a request may carry.
pub const MAX_AUTH_SIZE: u32 = 2048;

/// Header preceding every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestHeader {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Category flag
    pub category: u8,
    /// Subcategory flag within the category
    pub subcategory: u8,
    /// Length of the auth component in bytes
    pub auth_size: u32,
    /// Length of the body component in bytes
    pub body_size: u32,
    /// Unix timestamp (seconds) - informational only, not trusted
    pub sender_timestamp: u64,
    /// Client intends to close after this request
    #[serde(default)]
    pub finish: bool,
    /// Session iteration the client believes it holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
}

impl RequestHeader {
    /// Create a header for an operation with empty components.
    pub fn new(operation: Operation) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            category: operation.category() as u8,
            subcategory: operation.subcategory(),
            auth_size: 0,
            body_size: 0,
            sender_timestamp: unix_now(),
            finish: false,
            iteration: None,
        }
    }

    /// Encode into a fixed-size padded buffer.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], CodecError> {
        encode_padded(self)
    }

    /// Decode from a fixed-size buffer and check header-level constraints.
    ///
    /// `body_size` is bounded by the server's own limit, not here.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, CodecError> {
        let header: Self = decode_padded(bytes)?;
        if header.version != PROTOCOL_VERSION {
            return Err(CodecError::MalformedHeader(format!(
                "unsupported protocol version {}",
                header.version
            )));
        }
        if header.auth_size > MAX_AUTH_SIZE {
            return Err(CodecError::MalformedHeader(format!(
                "auth component too large: {} > {}",
                header.auth_size, MAX_AUTH_SIZE
            )));
        }
        Ok(header)
    }

    /// Resolve the verb named by the flags.
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_flags(self.category, self.subcategory)
    }

    /// Total bytes that follow this header.
    pub fn payload_len(&self) -> usize {
        self.auth_size as usize + self.body_size as usize
    }
}

/// Header preceding every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseHeader {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Response code, e.g. `"1:read"`
    pub code: String,
    /// Human-readable description, truncated to fit the header
    pub description: String,
    /// Length of the body in bytes
    pub body_size: u32,
    /// The server closed the connection after this response
    #[serde(default)]
    pub ended_connection: bool,
    /// Current session iteration, echoed after session operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
}

impl ResponseHeader {
    /// Create a response header with no body.
    pub fn new(code: ResponseCode, description: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            code: code.as_str().to_string(),
            description: description.into(),
            body_size: 0,
            ended_connection: false,
            iteration: None,
        }
    }

    /// Encode into a fixed-size buffer, truncating the description if needed.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], CodecError> {
        let mut header = self.clone();
        loop {
            match encode_padded(&header) {
                Err(CodecError::HeaderOverflow(len)) if !header.description.is_empty() => {
                    let excess = len - HEADER_SIZE;
                    let keep = header.description.chars().count().saturating_sub(excess.max(1));
                    header.description = header.description.chars().take(keep).collect();
                }
                other => return other,
            }
        }
    }

    /// Decode from a fixed-size buffer.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, CodecError> {
        decode_padded(bytes)
    }

    /// Parse the response code.
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::parse(&self.code)
    }
}

fn encode_padded<T: Serialize>(value: &T) -> Result<[u8; HEADER_SIZE], CodecError> {
    let json = serde_json::to_vec(value)?;
    if json.len() > HEADER_SIZE {
        return Err(CodecError::HeaderOverflow(json.len()));
    }
    let mut buf = [b' '; HEADER_SIZE];
    buf[..json.len()].copy_from_slice(&json);
    Ok(buf)
}

fn decode_padded<T: DeserializeOwned>(bytes: &[u8; HEADER_SIZE]) -> Result<T, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CodecError::MalformedHeader(format!("header is not UTF-8: {e}")))?;
    serde_json::from_str(text.trim_end_matches(' '))
        .map_err(|e| CodecError::MalformedHeader(e.to_string()))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_is_fixed_size() {
        let header = RequestHeader::new(Operation::Heartbeat);
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(*bytes.last().unwrap(), b' ');
        assert_eq!(RequestHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn request_header_with_maximum_fields_fits() {
        let header = RequestHeader {
            version: PROTOCOL_VERSION,
            category: u8::MAX,
            subcategory: u8::MAX,
            auth_size: MAX_AUTH_SIZE,
            body_size: u32::MAX,
            sender_timestamp: u64::MAX,
            finish: true,
            iteration: Some(u64::MAX),
        };
        let bytes = header.encode().unwrap();
        assert_eq!(RequestHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn unknown_header_fields_are_rejected() {
        let mut buf = [b' '; HEADER_SIZE];
        let json = br#"{"version":1,"category":1,"subcategory":1,"auth_size":0,"body_size":0,"sender_timestamp":0,"smuggled":true}"#;
        buf[..json.len()].copy_from_slice(json);
        assert!(matches!(
            RequestHeader::decode(&buf),
            Err(CodecError::MalformedHeader(_))
        ));
    }

    #[test]
    fn garbage_header_is_malformed() {
        let buf = [0xffu8; HEADER_SIZE];
        assert!(matches!(
            RequestHeader::decode(&buf),
            Err(CodecError::MalformedHeader(_))
        ));

        let buf = [b' '; HEADER_SIZE];
        assert!(RequestHeader::decode(&buf).is_err());
    }

    #[test]
    fn wrong_version_is_malformed() {
        let mut header = RequestHeader::new(Operation::Heartbeat);
        header.version = 2;
        let bytes = header.encode().unwrap();
        assert!(RequestHeader::decode(&bytes).is_err());
    }

    #[test]
    fn oversized_auth_is_malformed() {
        let mut header = RequestHeader::new(Operation::Auth);
        header.auth_size = MAX_AUTH_SIZE + 1;
        let bytes = header.encode().unwrap();
        assert!(RequestHeader::decode(&bytes).is_err());
    }

    #[test]
    fn long_description_is_truncated_to_fit() {
        let header = ResponseHeader::new(ResponseCode::Internal, "x".repeat(1000));
        let bytes = header.encode().unwrap();
        let decoded = ResponseHeader::decode(&bytes).unwrap();
        assert!(decoded.description.len() < 256);
        assert!(decoded.description.chars().all(|c| c == 'x'));
        assert_eq!(decoded.code, "3:?");
    }

    #[test]
    fn escaped_description_is_truncated_to_fit() {
        let header = ResponseHeader::new(ResponseCode::Internal, "\"\n".repeat(200));
        let bytes = header.encode().unwrap();
        assert!(ResponseHeader::decode(&bytes).is_ok());
    }

    #[test]
    fn header_operation_resolves() {
        let header = RequestHeader::new(Operation::Grant);
        assert_eq!(header.operation(), Some(Operation::Grant));
    }
}
