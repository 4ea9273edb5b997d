//! Category and subcategory flags, and the verb table built from them.

use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Top-level request category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Category {
    /// Heartbeats, queries, disconnects and trust rotation
    Info = 1,
    /// Account and session management
    Auth = 2,
    /// File operations
    File = 4,
    /// Permission management
    Permission = 8,
}

impl TryFrom<u8> for Category {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Category::Info),
            2 => Ok(Category::Auth),
            4 => Ok(Category::File),
            8 => Ok(Category::Permission),
            _ => Err(CodecError::schema(
                "header",
                format!("unknown category {value}"),
            )),
        }
    }
}

/// Subcategory flags for [`Category::Info`].
pub mod info {
    /// Liveness check
    pub const HEARTBEAT: u8 = 1;
    /// Metadata query
    pub const QUERY: u8 = 2;
    /// Graceful disconnect
    pub const BYE: u8 = 4;
    /// Trust rotation proof
    pub const ROTATE: u8 = 8;
}

/// Subcategory flags for [`Category::Auth`].
pub mod auth {
    /// Register a new user
    pub const UNEW: u8 = 1;
    /// Log in
    pub const AUTH: u8 = 2;
    /// Refresh the session
    pub const SREF: u8 = 4;
    /// Change password
    pub const CHPW: u8 = 8;
    /// Delete the user
    pub const UDEL: u8 = 16;
    /// Log out
    pub const STERM: u8 = 32;
}

/// Subcategory flags for [`Category::File`].
pub mod file {
    /// Create an empty file
    pub const CREATE: u8 = 1;
    /// Read a file, possibly in chunks
    pub const READ: u8 = 2;
    /// Overwrite file contents
    pub const REPLACE: u8 = 3;
    /// Write at a cursor position
    pub const PATCH: u8 = 4;
    /// Append to the end of a file
    pub const APPEND: u8 = 5;
    /// Delete a file
    pub const DELETE: u8 = 6;
    /// Create a file with initial contents
    pub const UPLOAD: u8 = 7;
    /// Chunked patch that keeps the amend buffer claimed
    pub const PATCHFROM: u8 = 8;
    /// Chunked replace that keeps the amend buffer claimed
    pub const REPLACEFROM: u8 = 9;
}

/// Subcategory flags for [`Category::Permission`].
pub mod permission {
    /// Grant a role on a file
    pub const GRANT: u8 = 1;
    /// Revoke a grant
    pub const REVOKE: u8 = 2;
    /// Make a file private, dropping all grants
    pub const HIDE: u8 = 4;
    /// Make a file readable by every authenticated user
    pub const PUBLICISE: u8 = 8;
    /// Transfer ownership
    pub const TRANSFER: u8 = 16;
}

/// A fully resolved protocol verb.
///
/// Each verb maps 1:1 to a (category, subcategory) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `HEARTBEAT`
    Heartbeat,
    /// `QUERY`
    Query,
    /// `BYE`
    Bye,
    /// Trust rotation proof
    Rotate,
    /// `UNEW`
    UserNew,
    /// `AUTH`
    Auth,
    /// `SREF`
    SessionRefresh,
    /// Change password
    ChangePassword,
    /// `UDEL`
    UserDelete,
    /// `STERM`
    SessionTerminate,
    /// `CREATE`
    Create,
    /// `READ`
    Read,
    /// `REPLACE`
    Replace,
    /// `PATCH`
    Patch,
    /// `APPEND`
    Append,
    /// `DELETE`
    Delete,
    /// `UPLOAD`
    Upload,
    /// `PATCHFROM`
    PatchFrom,
    /// `REPLACEFROM`
    ReplaceFrom,
    /// `GRANT`
    Grant,
    /// `REVOKE`
    Revoke,
    /// `HIDE`
    Hide,
    /// `PUBLICISE`
    Publicise,
    /// `TRANSFER`
    Transfer,
}

impl Operation {
    /// Every verb, in table order.
    pub const ALL: [Operation; 24] = [
        Operation::Heartbeat,
        Operation::Query,
        Operation::Bye,
        Operation::Rotate,
        Operation::UserNew,
        Operation::Auth,
        Operation::SessionRefresh,
        Operation::ChangePassword,
        Operation::UserDelete,
        Operation::SessionTerminate,
        Operation::Create,
        Operation::Read,
        Operation::Replace,
        Operation::Patch,
        Operation::Append,
        Operation::Delete,
        Operation::Upload,
        Operation::PatchFrom,
        Operation::ReplaceFrom,
        Operation::Grant,
        Operation::Revoke,
        Operation::Hide,
        Operation::Publicise,
        Operation::Transfer,
    ];

    /// Resolve a (category, subcategory) pair.
    pub fn from_flags(category: u8, subcategory: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.category() as u8 == category && op.subcategory() == subcategory)
    }

    /// The category this verb belongs to.
    pub const fn category(self) -> Category {
        match self {
            Operation::Heartbeat | Operation::Query | Operation::Bye | Operation::Rotate => {
                Category::Info
            }
            Operation::UserNew
            | Operation::Auth
            | Operation::SessionRefresh
            | Operation::ChangePassword
            | Operation::UserDelete
            | Operation::SessionTerminate => Category::Auth,
            Operation::Create
            | Operation::Read
            | Operation::Replace
            | Operation::Patch
            | Operation::Append
            | Operation::Delete
            | Operation::Upload
            | Operation::PatchFrom
            | Operation::ReplaceFrom => Category::File,
            Operation::Grant
            | Operation::Revoke
            | Operation::Hide
            | Operation::Publicise
            | Operation::Transfer => Category::Permission,
        }
    }

    /// The subcategory flag for this verb.
    pub const fn subcategory(self) -> u8 {
        match self {
            Operation::Heartbeat => info::HEARTBEAT,
            Operation::Query => info::QUERY,
            Operation::Bye => info::BYE,
            Operation::Rotate => info::ROTATE,
            Operation::UserNew => auth::UNEW,
            Operation::Auth => auth::AUTH,
            Operation::SessionRefresh => auth::SREF,
            Operation::ChangePassword => auth::CHPW,
            Operation::UserDelete => auth::UDEL,
            Operation::SessionTerminate => auth::STERM,
            Operation::Create => file::CREATE,
            Operation::Read => file::READ,
            Operation::Replace => file::REPLACE,
            Operation::Patch => file::PATCH,
            Operation::Append => file::APPEND,
            Operation::Delete => file::DELETE,
            Operation::Upload => file::UPLOAD,
            Operation::PatchFrom => file::PATCHFROM,
            Operation::ReplaceFrom => file::REPLACEFROM,
            Operation::Grant => permission::GRANT,
            Operation::Revoke => permission::REVOKE,
            Operation::Hide => permission::HIDE,
            Operation::Publicise => permission::PUBLICISE,
            Operation::Transfer => permission::TRANSFER,
        }
    }

    /// The shell-level verb name.
    pub const fn verb(self) -> &'static str {
        match self {
            Operation::Heartbeat => "HEARTBEAT",
            Operation::Query => "QUERY",
            Operation::Bye => "BYE",
            Operation::Rotate => "ROTATE",
            Operation::UserNew => "UNEW",
            Operation::Auth => "AUTH",
            Operation::SessionRefresh => "SREF",
            Operation::ChangePassword => "CHPW",
            Operation::UserDelete => "UDEL",
            Operation::SessionTerminate => "STERM",
            Operation::Create => "CREATE",
            Operation::Read => "READ",
            Operation::Replace => "REPLACE",
            Operation::Patch => "PATCH",
            Operation::Append => "APPEND",
            Operation::Delete => "DELETE",
            Operation::Upload => "UPLOAD",
            Operation::PatchFrom => "PATCHFROM",
            Operation::ReplaceFrom => "REPLACEFROM",
            Operation::Grant => "GRANT",
            Operation::Revoke => "REVOKE",
            Operation::Hide => "HIDE",
            Operation::Publicise => "PUBLICISE",
            Operation::Transfer => "TRANSFER",
        }
    }

    /// Whether the verb needs a live session token in the auth component.
    pub const fn requires_session(self) -> bool {
        !matches!(
            self,
            Operation::Heartbeat
                | Operation::Bye
                | Operation::Rotate
                | Operation::UserNew
                | Operation::Auth
                | Operation::UserDelete
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn category_roundtrip() {
        for cat in [
            Category::Info,
            Category::Auth,
            Category::File,
            Category::Permission,
        ] {
            assert_eq!(Category::try_from(cat as u8).unwrap(), cat);
        }
        assert!(Category::try_from(3).is_err());
        assert!(Category::try_from(0).is_err());
    }

    #[test]
    fn verb_table_is_one_to_one() {
        let pairs: HashSet<(u8, u8)> = Operation::ALL
            .iter()
            .map(|op| (op.category() as u8, op.subcategory()))
            .collect();
        assert_eq!(pairs.len(), Operation::ALL.len());

        let verbs: HashSet<&str> = Operation::ALL.iter().map(|op| op.verb()).collect();
        assert_eq!(verbs.len(), Operation::ALL.len());
    }

    #[test]
    fn from_flags_resolves_every_verb() {
        for op in Operation::ALL {
            assert_eq!(
                Operation::from_flags(op.category() as u8, op.subcategory()),
                Some(op)
            );
        }
    }

    #[test]
    fn unknown_pairs_do_not_resolve() {
        assert_eq!(Operation::from_flags(1, 16), None);
        assert_eq!(Operation::from_flags(2, 64), None);
        assert_eq!(Operation::from_flags(4, 10), None);
        assert_eq!(Operation::from_flags(16, 1), None);
    }

    #[test]
    fn session_free_verbs() {
        assert!(!Operation::Auth.requires_session());
        assert!(!Operation::UserNew.requires_session());
        assert!(!Operation::Heartbeat.requires_session());
        assert!(Operation::SessionRefresh.requires_session());
        assert!(Operation::Grant.requires_session());
        assert!(Operation::Query.requires_session());
    }
}
