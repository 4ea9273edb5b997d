//! File access resolution.

use crate::pool::{Lease, PoolResult};
use crate::storage::files::FileRecord;
use crate::storage::{files, grants};
use vault_types::{Permission, Role};

/// Whether a role (or a file's public flag) grants a permission.
///
/// Public files grant read to any authenticated user, nothing more.
pub fn permits(role: Option<Role>, public: bool, permission: Permission) -> bool {
    role.is_some_and(|r| r.allows(permission)) || (public && permission == Permission::Read)
}

/// A requester's standing on one file.
#[derive(Debug, Clone)]
pub struct FileAccess {
    /// The file row.
    pub file: FileRecord,
    /// Owner role for the owner, otherwise the live granted role.
    pub role: Option<Role>,
}

impl FileAccess {
    /// Whether the requester holds a permission on the file.
    pub fn permits(&self, permission: Permission) -> bool {
        permits(self.role, self.file.public, permission)
    }

    /// Whether the requester owns the file.
    pub fn is_owner(&self) -> bool {
        self.role == Some(Role::Owner)
    }
}

/// Resolve the requester's access to `owner/filename`. `None` if the file
/// does not exist.
pub async fn resolve(
    lease: &mut Lease,
    requester: &str,
    owner: &str,
    filename: &str,
) -> PoolResult<Option<FileAccess>> {
    let Some(file) = files::get(lease, owner, filename).await? else {
        return Ok(None);
    };
    let role = if requester == owner {
        Some(Role::Owner)
    } else {
        grants::get_active(lease, owner, filename, requester)
            .await?
            .and_then(|g| g.role())
    };
    Ok(Some(FileAccess { file, role }))
}
