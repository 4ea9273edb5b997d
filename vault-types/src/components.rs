//! Closed-schema request components.
//!
//! Every component rejects unknown fields at parse time and checks its own
//! field constraints in `validate`. Decoding a frame runs both.

use serde::{Deserialize, Serialize};

use crate::token::is_hex_of_len;
use crate::{Category, CodecError, Role, REFRESH_DIGEST_HEX_LEN, TOKEN_HEX_LEN};

/// Shortest allowed username.
pub const MIN_IDENTITY_LEN: usize = 3;
/// Longest allowed username.
pub const MAX_IDENTITY_LEN: usize = 32;
/// Shortest allowed password.
pub const MIN_PASSWORD_LEN: usize = 8;
/// Longest allowed password.
pub const MAX_PASSWORD_LEN: usize = 1024;
/// Longest allowed filename.
pub const MAX_FILENAME_LEN: usize = 128;
/// Longest grant duration in seconds (31 days).
pub const MAX_EFFECT_DURATION: u64 = 2_678_400;

const FINGERPRINT_HEX_LEN: usize = 64;
const SIGNATURE_HEX_LEN: usize = 128;

/// Whether `identity` is an acceptable username.
pub fn is_valid_identity(identity: &str) -> bool {
    (MIN_IDENTITY_LEN..=MAX_IDENTITY_LEN).contains(&identity.len())
        && identity
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Whether `name` is an acceptable filename: a single path component.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_FILENAME_LEN
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control)
}

/// Credentials and session material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthComponent {
    /// Username the request acts as
    pub identity: String,
    /// Password, for `UNEW`, `AUTH`, `UDEL`, `CHPW`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Replacement password, for `CHPW`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_password: Option<String>,
    /// Access token from the current session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Refresh digest, for `SREF`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_digest: Option<String>,
}

impl AuthComponent {
    /// Credentials for a password-based operation.
    pub fn with_password(identity: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            password: Some(password.into()),
            new_password: None,
            token: None,
            refresh_digest: None,
        }
    }

    /// Credentials for a session-based operation.
    pub fn with_token(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            password: None,
            new_password: None,
            token: Some(token.into()),
            refresh_digest: None,
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<(), CodecError> {
        if !is_valid_identity(&self.identity) {
            return Err(CodecError::schema("auth", "invalid identity"));
        }
        for password in [&self.password, &self.new_password].into_iter().flatten() {
            if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&password.chars().count()) {
                return Err(CodecError::schema(
                    "auth",
                    format!(
                        "password must be {MIN_PASSWORD_LEN}..={MAX_PASSWORD_LEN} characters"
                    ),
                ));
            }
        }
        if let Some(token) = &self.token {
            if !is_hex_of_len(token, TOKEN_HEX_LEN) {
                return Err(CodecError::schema("auth", "malformed token"));
            }
        }
        if let Some(digest) = &self.refresh_digest {
            if !is_hex_of_len(digest, REFRESH_DIGEST_HEX_LEN) {
                return Err(CodecError::schema("auth", "malformed refresh digest"));
            }
        }
        Ok(())
    }
}

/// Body of a file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileComponent {
    /// Target filename
    pub subject_file: String,
    /// Owner of the file, defaults to the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_file_owner: Option<String>,
    /// Byte offset for reads and patches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<u64>,
    /// Bytes to read in this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    /// Hex-encoded data to write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data: Option<String>,
    /// Keep the file buffer held after this request
    #[serde(default)]
    pub keepalive: bool,
    /// Release the file buffer after this request
    #[serde(default)]
    pub end_operation: bool,
}

impl FileComponent {
    /// A body naming only the file.
    pub fn named(subject_file: impl Into<String>) -> Self {
        Self {
            subject_file: subject_file.into(),
            subject_file_owner: None,
            cursor_position: None,
            chunk_size: None,
            write_data: None,
            keepalive: false,
            end_operation: false,
        }
    }

    /// Set the payload, hex-encoding it.
    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.write_data = Some(hex::encode(data));
        self
    }

    /// Set the file owner.
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.subject_file_owner = Some(owner.into());
        self
    }

    /// Decoded payload, empty when absent.
    pub fn data(&self) -> Result<Vec<u8>, CodecError> {
        match &self.write_data {
            Some(encoded) => hex::decode(encoded)
                .map_err(|e| CodecError::schema("file", format!("write_data: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<(), CodecError> {
        if !is_valid_filename(&self.subject_file) {
            return Err(CodecError::schema("file", "invalid subject_file"));
        }
        if let Some(owner) = &self.subject_file_owner {
            if !is_valid_identity(owner) {
                return Err(CodecError::schema("file", "invalid subject_file_owner"));
            }
        }
        if self.chunk_size == Some(0) {
            return Err(CodecError::schema("file", "chunk_size must be positive"));
        }
        if self.keepalive && self.end_operation {
            return Err(CodecError::schema(
                "file",
                "keepalive and end_operation are exclusive",
            ));
        }
        self.data().map(|_| ())
    }
}

/// Body of a permission operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionComponent {
    /// Target filename
    pub subject_file: String,
    /// Owner of the file, defaults to the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_file_owner: Option<String>,
    /// Grantee, revokee or new owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_user: Option<String>,
    /// Role to grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Grant lifetime in seconds, 0 for no expiry
    #[serde(default)]
    pub effect_duration: u64,
}

impl PermissionComponent {
    /// A body naming only the file.
    pub fn named(subject_file: impl Into<String>) -> Self {
        Self {
            subject_file: subject_file.into(),
            subject_file_owner: None,
            subject_user: None,
            role: None,
            effect_duration: 0,
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<(), CodecError> {
        if !is_valid_filename(&self.subject_file) {
            return Err(CodecError::schema("permission", "invalid subject_file"));
        }
        for name in [&self.subject_file_owner, &self.subject_user]
            .into_iter()
            .flatten()
        {
            if !is_valid_identity(name) {
                return Err(CodecError::schema("permission", "invalid username"));
            }
        }
        if self.role == Some(Role::Owner) {
            return Err(CodecError::schema(
                "permission",
                "owner cannot be granted, use TRANSFER",
            ));
        }
        if self.effect_duration > MAX_EFFECT_DURATION {
            return Err(CodecError::schema(
                "permission",
                format!("effect_duration exceeds {MAX_EFFECT_DURATION}"),
            ));
        }
        Ok(())
    }
}

/// What a `QUERY` asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryTarget {
    /// File metadata
    File,
    /// Grants on a file
    Permissions,
    /// The requester's own account
    User,
    /// Storage usage and limits
    Storage,
    /// Signed server certificate rollovers. Answered without a session so
    /// a client whose pin no longer matches can still fetch them.
    Rollover,
}

/// Body of an info operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfoComponent {
    /// Query target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_resource: Option<QueryTarget>,
    /// File for file/permission queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_file: Option<String>,
    /// Owner for file/permission queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_file_owner: Option<String>,
    /// Include extended detail
    #[serde(default)]
    pub verbose: bool,
    /// Rotation proof: fingerprint of the previously pinned certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_fingerprint: Option<String>,
    /// Rotation proof: hex ed25519 signature over the new fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl InfoComponent {
    /// A query body.
    pub fn query(target: QueryTarget) -> Self {
        Self {
            subject_resource: Some(target),
            ..Self::default()
        }
    }

    /// Check field constraints.
    pub fn validate(&self) -> Result<(), CodecError> {
        if let Some(file) = &self.subject_file {
            if !is_valid_filename(file) {
                return Err(CodecError::schema("info", "invalid subject_file"));
            }
        }
        if let Some(owner) = &self.subject_file_owner {
            if !is_valid_identity(owner) {
                return Err(CodecError::schema("info", "invalid subject_file_owner"));
            }
        }
        if let Some(fp) = &self.previous_fingerprint {
            if !is_hex_of_len(fp, FINGERPRINT_HEX_LEN) {
                return Err(CodecError::schema("info", "malformed previous_fingerprint"));
            }
        }
        if let Some(sig) = &self.signature {
            if !is_hex_of_len(sig, SIGNATURE_HEX_LEN) {
                return Err(CodecError::schema("info", "malformed signature"));
            }
        }
        Ok(())
    }
}

/// The category-specific body of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    Empty,
    /// File operation body
    File(FileComponent),
    /// Permission operation body
    Permission(PermissionComponent),
    /// Info operation body
    Info(InfoComponent),
}

impl RequestBody {
    /// Serialize the inner component. `Empty` encodes to zero bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            RequestBody::Empty => Vec::new(),
            RequestBody::File(c) => serde_json::to_vec(c)?,
            RequestBody::Permission(c) => serde_json::to_vec(c)?,
            RequestBody::Info(c) => serde_json::to_vec(c)?,
        })
    }

    /// Parse and validate a body for the given category.
    ///
    /// An unknown category yields `Empty`; the dispatcher reports it.
    pub fn decode(category: u8, bytes: &[u8]) -> Result<Self, CodecError> {
        let Ok(category) = Category::try_from(category) else {
            return Ok(RequestBody::Empty);
        };
        match category {
            Category::Auth if bytes.is_empty() => Ok(RequestBody::Empty),
            Category::Auth => Err(CodecError::schema("body", "auth requests carry no body")),
            Category::Info if bytes.is_empty() => Ok(RequestBody::Empty),
            Category::Info => {
                let c: InfoComponent = parse("info", bytes)?;
                c.validate()?;
                Ok(RequestBody::Info(c))
            }
            Category::File => {
                let c: FileComponent = parse("file", bytes)?;
                c.validate()?;
                Ok(RequestBody::File(c))
            }
            Category::Permission => {
                let c: PermissionComponent = parse("permission", bytes)?;
                c.validate()?;
                Ok(RequestBody::Permission(c))
            }
        }
    }
}

pub(crate) fn parse<T: serde::de::DeserializeOwned>(
    component: &'static str,
    bytes: &[u8],
) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::schema(component, e.to_string()))
}
