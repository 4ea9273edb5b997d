//! Roles and the atomic permissions they bundle.

use serde::{Deserialize, Serialize};

/// An atomic permission on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read contents
    Read,
    /// Modify contents
    Write,
    /// Delete the file
    Delete,
    /// Grant or revoke reader/editor roles
    ManageRw,
    /// Grant or revoke manager roles, change visibility, transfer
    ManageSuper,
}

impl Permission {
    /// Every permission.
    pub const ALL: [Permission; 5] = [
        Permission::Read,
        Permission::Write,
        Permission::Delete,
        Permission::ManageRw,
        Permission::ManageSuper,
    ];
}

/// A named bundle of permissions held on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Implicit role of the file owner
    Owner,
    /// May write and manage readers/editors
    Manager,
    /// May read and write
    Editor,
    /// May read
    Reader,
}

impl Role {
    /// Every role.
    pub const ALL: [Role; 4] = [Role::Owner, Role::Manager, Role::Editor, Role::Reader];

    /// The fixed permission set of this role.
    pub const fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Owner => &Permission::ALL,
            Role::Manager => &[Permission::Read, Permission::Write, Permission::ManageRw],
            Role::Editor => &[Permission::Read, Permission::Write],
            Role::Reader => &[Permission::Read],
        }
    }

    /// Whether this role includes `permission`.
    pub fn allows(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    /// Permission required of a granter to grant or revoke this role.
    pub const fn managed_by(self) -> Permission {
        match self {
            Role::Owner | Role::Manager => Permission::ManageSuper,
            Role::Editor | Role::Reader => Permission::ManageRw,
        }
    }

    /// Stored name of this role.
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Manager => "manager",
            Role::Editor => "editor",
            Role::Reader => "reader",
        }
    }

    /// Parse a stored role name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == name)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
