//! File verbs: create, read, the amend family and delete.
//!
//! Size changes are reserved in the storage cache before any byte hits the
//! disk and rolled back if the write fails, so a refused or failed write
//! never moves a user's usage. Amends run under the file's amend slot.

use super::{file_body, open_file, require, HandlerError, HandlerResult};
use crate::cache::FileKey;
use crate::files::FileStoreError;
use crate::pool::Priority;
use crate::server::VaultServer;
use crate::storage::{files, grants};
use vault_types::{CodecError, FileComponent, Operation, Permission, Request, Response, ResponseCode};

/// Route a file-category request.
pub(crate) async fn handle(
    server: &VaultServer,
    requester: &str,
    operation: Operation,
    request: &Request,
) -> HandlerResult {
    let body = file_body(request)?;
    let owner = body.subject_file_owner.as_deref().unwrap_or(requester);
    let key = FileKey::new(owner, &body.subject_file);

    match operation {
        Operation::Create => create(server, requester, &key, body, false).await,
        Operation::Upload => create(server, requester, &key, body, true).await,
        Operation::Read => read(server, requester, &key, body).await,
        Operation::Replace
        | Operation::Patch
        | Operation::Append
        | Operation::PatchFrom
        | Operation::ReplaceFrom => amend(server, requester, operation, &key, body).await,
        Operation::Delete => delete(server, requester, &key).await,
        other => Err(HandlerError::UnknownOperation {
            category: other.category() as u8,
            subcategory: other.subcategory(),
        }),
    }
}

async fn create(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
    body: &FileComponent,
    with_data: bool,
) -> HandlerResult {
    if key.owner != requester {
        return Err(HandlerError::Forbidden(format!(
            "{requester} cannot create files owned by {}",
            key.owner
        )));
    }
    if !with_data && body.write_data.is_some() {
        return Err(CodecError::schema("file", "CREATE carries no write_data, use UPLOAD").into());
    }
    let data = body.data()?;

    let mut lease = server.pool().lease(Priority::Normal).await?;
    let exists = files::get(&mut lease, &key.owner, &key.filename).await?.is_some();
    lease.rollback().await?;
    if exists {
        return Err(HandlerError::AlreadyExists(key.filename.clone()));
    }

    let size = data.len() as u64;
    let reservation = server.storage().reserve(&key.owner, &key.filename, size).await?;
    let written: HandlerResult<()> = async {
        let mut lease = server.pool().lease(Priority::Normal).await?;
        if !files::insert(&mut lease, &key.owner, &key.filename, size).await? {
            return Err(HandlerError::AlreadyExists(key.filename.clone()));
        }
        match server.files().create(&key.owner, &key.filename, &data).await {
            Ok(()) => {}
            // Contents left behind by a delete whose disk removal failed.
            Err(FileStoreError::AlreadyExists) => {
                tracing::warn!("Overwriting orphaned contents of {}", key);
                server.files().replace(&key.owner, &key.filename, &data).await?;
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = lease.commit().await {
            if let Err(cleanup) = server.files().delete(&key.owner, &key.filename).await {
                tracing::error!("Create of {} rolled back but its contents remain on disk: {}", key, cleanup);
            }
            return Err(e.into());
        }
        Ok(())
    }
    .await;
    if let Err(e) = written {
        server.storage().rollback(reservation);
        return Err(e);
    }

    server.tombstones().clear(key);
    tracing::debug!("Created {} ({} bytes)", key, size);
    Ok(Response::new(ResponseCode::FileCreated, "file created")
        .with_body(serde_json::json!({ "size": size })))
}

async fn read(
    server: &VaultServer,
    requester: &str,
    key: &FileKey,
    body: &FileComponent,
) -> HandlerResult {
    let access = open_file(server, requester, key).await?;
    require(server, &access, Permission::Read, requester, key)?;

    let cursor = body
        .cursor_position
        .unwrap_or_else(|| server.read_buffers().cursor(key, requester));
    let max_chunk = server.config().storage.max_read_chunk;
    let chunk = body.chunk_size.map_or(max_chunk, |c| c.min(max_chunk));

    let data = server
        .files()
        .read_at(&key.owner, &key.filename, cursor, u64::from(chunk))
        .await?;
    let size = server.files().len(&key.owner, &key.filename).await?;
    let next = cursor + data.len() as u64;

    let body_json = serde_json::json!({
        "data": hex::encode(&data),
        "cursor_position": next,
        "size": size,
    });
    if next < size && !body.end_operation {
        server.read_buffers().advance(key, requester, next);
        Ok(Response::new(ResponseCode::PartialRead, "more data remains").with_body(body_json))
    } else {
        server.read_buffers().finish(key, requester);
        Ok(Response::new(ResponseCode::FileRead, "read complete").with_body(body_json))
    }
}

async fn amend(
    server: &VaultServer,
    requester: &str,
    operation: Operation,
    key: &FileKey,
    body: &FileComponent,
) -> HandlerResult {
    let data = body.data()?;
    let access = open_file(server, requester, key).await?;
    require(server, &access, Permission::Write, requester, key)?;

    let mut guard = server.amend_buffers().acquire(key, requester).await?;
    // Deleted while we waited for the slot.
    if server.tombstones().is_deleted(key) {
        return Err(HandlerError::NotFound);
    }

    let current = server.files().len(&key.owner, &key.filename).await?;
    let claimed = guard.claim().map(|c| c.cursor);
    let (offset, truncate) = match operation {
        Operation::Replace => (0, true),
        Operation::Append => (current, false),
        Operation::Patch => (body.cursor_position.unwrap_or(0), false),
        Operation::PatchFrom => (body.cursor_position.or(claimed).unwrap_or(0), false),
        _ => (body.cursor_position.or(claimed).unwrap_or(0), true),
    };
    if offset > current {
        return Err(FileStoreError::OutOfRange {
            offset,
            len: current,
        }
        .into());
    }
    let end = offset + data.len() as u64;
    let new_size = if truncate { end } else { end.max(current) };

    let reservation = server
        .storage()
        .reserve(&key.owner, &key.filename, new_size)
        .await?;
    let written = match operation {
        Operation::Replace => server
            .files()
            .replace(&key.owner, &key.filename, &data)
            .await
            .map(|()| new_size),
        Operation::Append => server.files().append(&key.owner, &key.filename, &data).await,
        _ => {
            server
                .files()
                .write_at(&key.owner, &key.filename, offset, &data, truncate)
                .await
        }
    };
    let size = match written {
        Ok(size) => size,
        Err(e) => {
            server.storage().rollback(reservation);
            return Err(e.into());
        }
    };

    // The bytes are on disk; the row follows them even if this fails.
    let mut lease = server.pool().lease(Priority::Normal).await?;
    files::set_size(&mut lease, &key.owner, &key.filename, size).await?;
    lease.commit().await?;

    let keepalive = body.keepalive && matches!(operation, Operation::PatchFrom | Operation::ReplaceFrom);
    if keepalive {
        guard.set_claim(requester, end);
    } else {
        guard.release_claim();
    }

    tracing::debug!("{} on {} by {}: {} bytes at {}", operation.verb(), key, requester, data.len(), offset);
    Ok(Response::new(ResponseCode::FileAmended, "file amended").with_body(serde_json::json!({
        "size": size,
        "cursor_position": end,
        "keepalive_accepted": keepalive,
    })))
}

async fn delete(server: &VaultServer, requester: &str, key: &FileKey) -> HandlerResult {
    let access = open_file(server, requester, key).await?;
    require(server, &access, Permission::Delete, requester, key)?;

    let guard = server.amend_buffers().acquire(key, requester).await?;
    let mut lease = server.pool().lease(Priority::Normal).await?;
    let revoked: Vec<String> = grants::list_for_file(&mut lease, &key.owner, &key.filename)
        .await?
        .into_iter()
        .map(|g| g.grantee)
        .collect();
    if !files::delete(&mut lease, &key.owner, &key.filename).await? {
        return Err(HandlerError::NotFound);
    }
    lease.commit().await?;

    // The row is gone, so every in-memory trace of the file goes with it
    // whatever happens on disk.
    server.tombstones().mark(key.clone());
    drop(guard);
    server.amend_buffers().remove(key);
    server.read_buffers().invalidate_file(key);
    if let Err(e) = server.storage().remove_file(&key.owner, &key.filename).await {
        tracing::error!("Deleted {} but could not update usage: {}", key, e);
    }
    match server.files().delete(&key.owner, &key.filename).await {
        Ok(()) | Err(FileStoreError::NotFound) => {}
        Err(e) => tracing::error!("Deleted {} but its contents remain on disk: {}", key, e),
    }

    tracing::debug!("Deleted {} ({} grants revoked)", key, revoked.len());
    Ok(Response::new(ResponseCode::FileDeleted, "file deleted").with_body(serde_json::json!({
        "revoked": revoked,
        "deleted_at": crate::storage::unix_now(),
    })))
}
