//! # strata-vault-types
//!
//! Wire format types for the strata-vault file storage protocol.
//!
//! Every frame on the wire is a fixed 256-byte JSON header, space padded,
//! followed by the JSON components the header announces:
//!
//! ```text
//! request:  [header 256B][auth component: auth_size B][body component: body_size B]
//! response: [header 256B][body: body_size B]
//! ```
//!
//! This crate provides:
//! - [`RequestHeader`], [`ResponseHeader`] - fixed-size frame headers
//! - [`Request`], [`Response`] - full frames with encode/decode
//! - [`AuthComponent`], [`FileComponent`], [`PermissionComponent`], [`InfoComponent`] - closed-schema bodies
//! - [`Operation`], [`Category`] - the (category, subcategory) verb table
//! - [`ResponseCode`] - every response code the server can emit
//! - [`Role`], [`Permission`] - the fixed role to permission mapping
//! - [`SessionToken`] - the serialized session record
//! - [`CodecError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod codes;
mod components;
mod error;
pub mod flags;
mod frame;
mod header;
mod roles;
mod token;

pub use codes::{CodeClass, ResponseCode};
pub use components::{
    is_valid_filename, is_valid_identity, AuthComponent, FileComponent, InfoComponent,
    PermissionComponent, QueryTarget, RequestBody, MAX_EFFECT_DURATION, MAX_FILENAME_LEN,
    MAX_IDENTITY_LEN, MAX_PASSWORD_LEN, MIN_IDENTITY_LEN, MIN_PASSWORD_LEN,
};
pub use error::CodecError;
pub use flags::{Category, Operation};
pub use frame::{Request, Response};
pub use header::{RequestHeader, ResponseHeader, HEADER_SIZE, MAX_AUTH_SIZE, PROTOCOL_VERSION};
pub use roles::{Permission, Role};
pub use token::{SessionToken, REFRESH_DIGEST_HEX_LEN, TOKEN_HEX_LEN};
