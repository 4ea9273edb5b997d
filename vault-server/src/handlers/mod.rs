//! Request handlers, one module per category.
//!
//! Handlers return `Result<Response, HandlerError>`. The dispatcher turns
//! every error into a response through [`HandlerError::into_response`], the
//! single place where failures become wire codes.

pub mod auth;
pub mod file;
pub mod info;
pub mod permission;

use crate::activity::{ActivityEntry, LogAuthor, LogCategory};
use crate::auth::{resolve, AuthError, FileAccess};
use crate::cache::{CacheError, FileKey};
use crate::files::FileStoreError;
use crate::pool::{PoolError, Priority};
use crate::server::VaultServer;
use crate::trust::TrustError;
use vault_types::{
    AuthComponent, CodeClass, CodecError, FileComponent, InfoComponent, Permission,
    PermissionComponent, Request, RequestBody, Response, ResponseCode,
};

/// Everything a handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Frame or component failed to decode or validate.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No verb is mapped to the header's flags.
    #[error("unknown operation {category}/{subcategory}")]
    UnknownOperation {
        /// Category flag.
        category: u8,
        /// Subcategory flag.
        subcategory: u8,
    },

    /// The verb needs a session and none was presented.
    #[error("no session")]
    NoSession,

    /// The requester lacks a permission.
    #[error("insufficient permission: {0}")]
    Forbidden(String),

    /// The file does not exist, or the requester has no standing on it.
    #[error("file not found")]
    NotFound,

    /// The request conflicts with current state.
    #[error("{0}")]
    Conflict(String),

    /// The file is already in the requested state.
    #[error("{0}")]
    FileConflict(String),

    /// The resource already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The peer's certificate is not trusted.
    #[error("untrusted peer: {0}")]
    Untrusted(String),

    /// Credential, session or account failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Lease or database failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Quota, limit or contention failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// File contents failure.
    #[error(transparent)]
    Files(#[from] FileStoreError),

    /// Pin store or rotation proof failure.
    #[error(transparent)]
    Trust(#[from] TrustError),
}

/// Result type alias for handlers.
pub type HandlerResult<T = Response> = std::result::Result<T, HandlerError>;

fn pool_code(e: &PoolError) -> ResponseCode {
    match e {
        PoolError::PoolExhausted(_) => ResponseCode::PoolExhausted,
        PoolError::Timeout(_) => ResponseCode::Timeout,
        PoolError::LeaseExpired { .. } => ResponseCode::LeaseExpired,
        PoolError::Database(_) => ResponseCode::Database,
    }
}

impl HandlerError {
    /// The wire code for this failure.
    pub fn code(&self) -> ResponseCode {
        match self {
            HandlerError::Codec(e) => match e {
                CodecError::MalformedHeader(_) | CodecError::HeaderOverflow(_) => {
                    ResponseCode::MalformedHeader
                }
                CodecError::TruncatedBody { .. } => ResponseCode::TruncatedBody,
                CodecError::SchemaViolation { .. } => ResponseCode::SchemaViolation,
                CodecError::Serialization(_) => ResponseCode::Internal,
            },
            HandlerError::UnknownOperation { .. } => ResponseCode::UnknownOperation,
            HandlerError::NoSession => ResponseCode::NoSession,
            HandlerError::Forbidden(_) => ResponseCode::InsufficientPermission,
            HandlerError::NotFound => ResponseCode::FileNotFound,
            HandlerError::Conflict(_) => ResponseCode::OperationalConflict,
            HandlerError::FileConflict(_) => ResponseCode::FileConflict,
            HandlerError::AlreadyExists(_) => ResponseCode::AlreadyExists,
            HandlerError::Untrusted(_) => ResponseCode::TrustMismatch,
            HandlerError::Auth(e) => match e {
                AuthError::InvalidCredentials => ResponseCode::InvalidCredentials,
                AuthError::UserNotFound => ResponseCode::UserNotFound,
                AuthError::UserExists => ResponseCode::AlreadyExists,
                AuthError::Banned => ResponseCode::Banned,
                AuthError::TokenExpired => ResponseCode::TokenExpired,
                AuthError::TokenUnknown => ResponseCode::TokenUnknown,
                AuthError::ReplayDetected { .. } => ResponseCode::ReplayDetected,
                AuthError::RefreshInvalid => ResponseCode::RefreshInvalid,
                AuthError::RefreshReplay { .. } => ResponseCode::RefreshReplay,
                AuthError::RefreshTooEarly => ResponseCode::RefreshTooEarly,
                AuthError::PasswordUnchanged => ResponseCode::PasswordUnchanged,
                AuthError::Hashing(_) => ResponseCode::Internal,
                AuthError::Pool(e) => pool_code(e),
            },
            HandlerError::Pool(e) => pool_code(e),
            HandlerError::Cache(e) => match e {
                CacheError::QuotaExceeded { .. } => ResponseCode::QuotaExceeded,
                CacheError::FileLimitExceeded { .. } => ResponseCode::FileLimitExceeded,
                CacheError::FileBusy => ResponseCode::FileBusy,
                CacheError::Pool(e) => pool_code(e),
            },
            HandlerError::Files(e) => match e {
                FileStoreError::NotFound => ResponseCode::FileNotFound,
                FileStoreError::AlreadyExists => ResponseCode::AlreadyExists,
                FileStoreError::OutOfRange { .. } => ResponseCode::OperationalConflict,
                FileStoreError::Io(_) => ResponseCode::Disk,
            },
            HandlerError::Trust(e) => match e {
                TrustError::Io(_) | TrustError::Corrupt(_) | TrustError::Tls(_) => {
                    ResponseCode::Internal
                }
                _ => ResponseCode::TrustMismatch,
            },
        }
    }

    /// Encode as a response. Server faults get a generic description; the
    /// detail goes to the log instead.
    pub fn into_response(self) -> Response {
        let code = self.code();
        let description = match code.class() {
            CodeClass::ServerFault => "internal server error".to_string(),
            _ => self.to_string(),
        };
        Response::new(code, description)
    }
}

/// The auth component, which every auth verb and every session verb needs.
pub(crate) fn credentials(request: &Request) -> HandlerResult<&AuthComponent> {
    request
        .auth
        .as_ref()
        .ok_or_else(|| CodecError::schema("auth", "auth component required").into())
}

/// A field the verb requires but the schema leaves optional.
pub(crate) fn required<'a, T>(
    value: &'a Option<T>,
    component: &'static str,
    field: &'static str,
) -> HandlerResult<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| CodecError::schema(component, format!("{field} required")).into())
}

pub(crate) fn file_body(request: &Request) -> HandlerResult<&FileComponent> {
    match &request.body {
        RequestBody::File(c) => Ok(c),
        _ => Err(CodecError::schema("file", "file component required").into()),
    }
}

pub(crate) fn permission_body(request: &Request) -> HandlerResult<&PermissionComponent> {
    match &request.body {
        RequestBody::Permission(c) => Ok(c),
        _ => Err(CodecError::schema("permission", "permission component required").into()),
    }
}

/// Serialize a response body.
pub(crate) fn to_body<T: serde::Serialize>(value: &T) -> HandlerResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| CodecError::from(e).into())
}

pub(crate) fn info_body(request: &Request) -> Option<&InfoComponent> {
    match &request.body {
        RequestBody::Info(c) => Some(c),
        _ => None,
    }
}

/// Resolve the requester's standing on a file.
///
/// Tombstoned files, missing files and private files the requester holds
/// no role on all read as [`HandlerError::NotFound`].
pub(crate) async fn open_file(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
) -> HandlerResult<FileAccess> {
    if server.tombstones().is_deleted(key) {
        return Err(HandlerError::NotFound);
    }
    let mut lease = server.pool().lease(Priority::Normal).await?;
    let access = resolve(&mut lease, requester, &key.owner, &key.filename).await?;
    lease.rollback().await?;
    match access {
        Some(access) if access.role.is_some() || access.file.public => Ok(access),
        _ => Err(HandlerError::NotFound),
    }
}

/// Fail with [`HandlerError::Forbidden`] unless `access` carries `permission`.
pub(crate) fn require(
    server: &VaultServer,
    access: &FileAccess,
    permission: Permission,
    requester: &str,
    key: &FileKey,
) -> HandlerResult<()> {
    if access.permits(permission) {
        return Ok(());
    }
    let details = format!("{requester} lacks {permission:?} on {key}");
    server.activity().log(
        ActivityEntry::new(1, LogAuthor::Dispatcher, LogCategory::Permission, details.as_str())
            .user(requester),
    );
    Err(HandlerError::Forbidden(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;

    #[test]
    fn client_faults_describe_themselves() {
        let response = HandlerError::Cache(CacheError::QuotaExceeded {
            needed: 5,
            available: 4,
        })
        .into_response();
        assert_eq!(response.code(), Some(ResponseCode::QuotaExceeded));
        assert!(response.header.description.contains("quota"));
    }

    #[test]
    fn server_faults_hide_detail() {
        let response = HandlerError::Pool(PoolError::Database(sqlx::Error::PoolClosed))
            .into_response();
        assert_eq!(response.code(), Some(ResponseCode::Database));
        assert_eq!(response.header.description, "internal server error");
    }

    #[test]
    fn auth_errors_map_one_to_one() {
        let cases = [
            (AuthError::InvalidCredentials, ResponseCode::InvalidCredentials),
            (AuthError::UserNotFound, ResponseCode::UserNotFound),
            (AuthError::UserExists, ResponseCode::AlreadyExists),
            (AuthError::Banned, ResponseCode::Banned),
            (AuthError::TokenExpired, ResponseCode::TokenExpired),
            (AuthError::TokenUnknown, ResponseCode::TokenUnknown),
            (
                AuthError::ReplayDetected {
                    username: "alice".into(),
                },
                ResponseCode::ReplayDetected,
            ),
            (AuthError::RefreshInvalid, ResponseCode::RefreshInvalid),
            (
                AuthError::RefreshReplay {
                    username: "alice".into(),
                },
                ResponseCode::RefreshReplay,
            ),
            (AuthError::RefreshTooEarly, ResponseCode::RefreshTooEarly),
            (AuthError::PasswordUnchanged, ResponseCode::PasswordUnchanged),
        ];
        for (error, code) in cases {
            assert_eq!(HandlerError::Auth(error).code(), code);
        }
    }

    #[test]
    fn codec_errors_keep_their_class() {
        assert_eq!(
            HandlerError::from(CodecError::schema("file", "bad")).code(),
            ResponseCode::SchemaViolation
        );
        assert_eq!(
            HandlerError::from(CodecError::TruncatedBody {
                expected: 4,
                actual: 1
            })
            .code(),
            ResponseCode::TruncatedBody
        );
        assert_eq!(
            HandlerError::from(CodecError::MalformedHeader("x".into())).code(),
            ResponseCode::MalformedHeader
        );
    }

    #[test]
    fn file_store_errors() {
        assert_eq!(
            HandlerError::from(FileStoreError::OutOfRange { offset: 9, len: 3 }).code(),
            ResponseCode::OperationalConflict
        );
        assert_eq!(
            HandlerError::from(FileStoreError::Io(std::io::Error::other("disk"))).code(),
            ResponseCode::Disk
        );
    }
}
