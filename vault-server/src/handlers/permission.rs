//! Permission verbs: grants, visibility and ownership transfer.
//!
//! A granter needs the permission that manages the role in question: only
//! the owner handles managers, managers handle editors and readers. A grant
//! the owner made can only be changed by the owner.

use super::{open_file, permission_body, require, required, HandlerError, HandlerResult};
use crate::activity::{ActivityEntry, LogAuthor, LogCategory};
use crate::auth::{AuthError, FileAccess};
use crate::cache::FileKey;
use crate::pool::Priority;
use crate::server::VaultServer;
use crate::storage::{files, grants, unix_now, users};
use vault_types::{Operation, Permission, PermissionComponent, Request, Response, ResponseCode};

/// Route a permission-category request.
pub(crate) async fn handle(
    server: &VaultServer,
    requester: &str,
    operation: Operation,
    request: &Request,
) -> HandlerResult {
    let body = permission_body(request)?;
    let owner = body.subject_file_owner.as_deref().unwrap_or(requester);
    let key = FileKey::new(owner, &body.subject_file);
    let access = open_file(server, requester, &key).await?;

    let response = match operation {
        Operation::Grant => grant(server, requester, &key, &access, body).await?,
        Operation::Revoke => revoke(server, requester, &key, &access, body).await?,
        Operation::Hide => set_visibility(server, requester, &key, &access, false).await?,
        Operation::Publicise => set_visibility(server, requester, &key, &access, true).await?,
        Operation::Transfer => transfer(server, requester, &key, &access, body).await?,
        other => {
            return Err(HandlerError::UnknownOperation {
                category: other.category() as u8,
                subcategory: other.subcategory(),
            })
        }
    };
    Ok(response)
}

fn audit(server: &VaultServer, requester: &str, details: String) {
    tracing::debug!("{}", details);
    server.activity().log(
        ActivityEntry::new(2, LogAuthor::Dispatcher, LogCategory::Permission, details)
            .user(requester),
    );
}

async fn grant(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
    access: &FileAccess,
    body: &PermissionComponent,
) -> HandlerResult {
    let grantee = required(&body.subject_user, "permission", "subject_user")?.as_str();
    let role = *required(&body.role, "permission", "role")?;
    if grantee == key.owner || grantee == requester {
        return Err(HandlerError::Conflict(format!(
            "{grantee} cannot be granted a role on {key}"
        )));
    }
    require(server, access, role.managed_by(), requester, key)?;

    let mut lease = server.pool().lease(Priority::Normal).await?;
    if !users::exists(&mut lease, grantee).await? {
        return Err(AuthError::UserNotFound.into());
    }
    let existing = grants::get_active(&mut lease, &key.owner, &key.filename, grantee).await?;
    if let Some(existing) = &existing {
        check_existing(access, key, existing)?;
        if existing.role() == Some(role) && existing.expires_at.is_none() && body.effect_duration == 0 {
            return Err(HandlerError::Conflict(format!(
                "{grantee} already holds {role} on {key}"
            )));
        }
    }

    let expires_at = (body.effect_duration > 0).then(|| unix_now() + body.effect_duration as i64);
    grants::upsert(
        &mut lease,
        &key.owner,
        &key.filename,
        grantee,
        role,
        requester,
        expires_at,
    )
    .await?;
    lease.commit().await?;

    audit(server, requester, format!("granted {role} on {key} to {grantee}"));
    Ok(Response::new(ResponseCode::Granted, "role granted").with_body(serde_json::json!({
        "grantee": grantee,
        "role": role,
        "expires_at": expires_at,
    })))
}

async fn revoke(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
    access: &FileAccess,
    body: &PermissionComponent,
) -> HandlerResult {
    let grantee = required(&body.subject_user, "permission", "subject_user")?.as_str();

    let mut lease = server.pool().lease(Priority::Normal).await?;
    let existing = grants::get_active(&mut lease, &key.owner, &key.filename, grantee)
        .await?
        .ok_or_else(|| HandlerError::Conflict(format!("{grantee} holds no role on {key}")))?;

    // Anyone may give up their own role.
    if grantee != requester {
        let managed_by = existing
            .role()
            .map_or(Permission::ManageSuper, |r| r.managed_by());
        require(server, access, managed_by, requester, key)?;
        check_existing(access, key, &existing)?;
    }

    grants::delete(&mut lease, &key.owner, &key.filename, grantee).await?;
    lease.commit().await?;

    audit(server, requester, format!("revoked {} on {key} from {grantee}", existing.role));
    Ok(Response::new(ResponseCode::Revoked, "role revoked"))
}

/// Owner-made grants are the owner's to change.
fn check_existing(access: &FileAccess, key: &FileKey, existing: &grants::GrantRecord) -> HandlerResult<()> {
    if existing.granted_by == key.owner && !access.is_owner() {
        return Err(HandlerError::Forbidden(format!(
            "the grant to {} on {key} was made by its owner",
            existing.grantee
        )));
    }
    Ok(())
}

async fn set_visibility(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
    access: &FileAccess,
    public: bool,
) -> HandlerResult {
    require(server, access, Permission::ManageSuper, requester, key)?;
    if access.file.public == public {
        let state = if public { "public" } else { "private" };
        return Err(HandlerError::FileConflict(format!("{key} is already {state}")));
    }

    let mut lease = server.pool().lease(Priority::Normal).await?;
    if !files::set_public(&mut lease, &key.owner, &key.filename, public).await? {
        return Err(HandlerError::NotFound);
    }
    let revoked = if public {
        0
    } else {
        grants::delete_for_file(&mut lease, &key.owner, &key.filename).await?
    };
    lease.commit().await?;

    if public {
        audit(server, requester, format!("publicised {key}"));
        Ok(Response::new(ResponseCode::Publicised, "file is public"))
    } else {
        audit(server, requester, format!("hid {key}, {revoked} grants revoked"));
        Ok(Response::new(ResponseCode::Hidden, "file is private")
            .with_body(serde_json::json!({ "revoked": revoked })))
    }
}

async fn transfer(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
    access: &FileAccess,
    body: &PermissionComponent,
) -> HandlerResult {
    let recipient = required(&body.subject_user, "permission", "subject_user")?.as_str();
    require(server, access, Permission::ManageSuper, requester, key)?;
    if recipient == key.owner {
        return Err(HandlerError::Conflict(format!("{key} already belongs to {recipient}")));
    }

    let mut lease = server.pool().lease(Priority::Normal).await?;
    if !users::exists(&mut lease, recipient).await? {
        return Err(AuthError::UserNotFound.into());
    }
    if files::get(&mut lease, recipient, &key.filename).await?.is_some() {
        return Err(HandlerError::Conflict(format!(
            "{recipient} already owns a file named {}",
            key.filename
        )));
    }
    lease.rollback().await?;

    let guard = server.amend_buffers().acquire(key, requester).await?;
    server
        .storage()
        .transfer_file(&key.owner, recipient, &key.filename)
        .await?;

    let moved: HandlerResult<()> = async {
        let mut lease = server.pool().lease(Priority::Normal).await?;
        grants::delete(&mut lease, &key.owner, &key.filename, recipient).await?;
        if !files::transfer(&mut lease, &key.owner, &key.filename, recipient).await? {
            return Err(HandlerError::NotFound);
        }
        server.files().transfer(&key.owner, &key.filename, recipient).await?;
        if let Err(e) = lease.commit().await {
            let _ = server.files().transfer(recipient, &key.filename, &key.owner).await;
            return Err(e.into());
        }
        Ok(())
    }
    .await;
    if let Err(e) = moved {
        if let Err(undo) = server
            .storage()
            .transfer_file(recipient, &key.owner, &key.filename)
            .await
        {
            tracing::warn!("Could not restore usage after failed transfer of {}: {}", key, undo);
        }
        return Err(e);
    }

    drop(guard);
    server.tombstones().mark(key.clone());
    server.amend_buffers().remove(key);
    server.read_buffers().invalidate_file(key);
    server.tombstones().clear(&FileKey::new(recipient, &key.filename));

    audit(server, requester, format!("transferred {key} to {recipient}"));
    Ok(Response::new(ResponseCode::Transferred, "ownership transferred").with_body(
        serde_json::json!({ "owner": recipient, "filename": key.filename }),
    ))
}
