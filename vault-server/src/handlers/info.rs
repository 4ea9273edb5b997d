//! Info verbs: liveness, goodbye, queries and trust rotation.

use super::{info_body, open_file, require, required, to_body, HandlerError, HandlerResult};
use crate::activity::{ActivityEntry, LogAuthor, LogCategory};
use crate::cache::FileKey;
use crate::connection::ConnectionContext;
use crate::pool::Priority;
use crate::server::VaultServer;
use crate::storage::{bans, files, grants, users};
use crate::trust::{fingerprint, load_rollover, rollover_data};
use serde_json::{json, Value};
use vault_types::{
    CodecError, InfoComponent, Permission, QueryTarget, Request, Response, ResponseCode,
};

/// `HEARTBEAT`
pub(crate) fn heartbeat() -> Response {
    Response::new(ResponseCode::Heartbeat, "alive")
}

/// `BYE`: acknowledge and close.
pub(crate) fn bye() -> Response {
    Response::new(ResponseCode::Bye, "goodbye").ending_connection()
}

fn component(request: &Request) -> HandlerResult<&InfoComponent> {
    info_body(request).ok_or_else(|| CodecError::schema("info", "info component required").into())
}

/// `QUERY`: answer about a file, its grants, the requester or their usage.
pub(crate) async fn query(server: &VaultServer, requester: &str, request: &Request) -> HandlerResult {
    let body = component(request)?;
    let answer = match required(&body.subject_resource, "info", "subject_resource")? {
        QueryTarget::File => query_file(server, requester, body).await?,
        QueryTarget::Permissions => query_permissions(server, requester, body).await?,
        QueryTarget::User => query_user(server, requester, body.verbose).await?,
        QueryTarget::Storage => to_body(&server.storage().usage(requester).await?)?,
        QueryTarget::Rollover => return rollover(server).await,
    };
    Ok(Response::new(ResponseCode::Answer, "query answered").with_body(answer))
}

/// Whether `request` is a rollover query, which needs no session.
pub(crate) fn is_rollover_query(request: &Request) -> bool {
    info_body(request).and_then(|body| body.subject_resource) == Some(QueryTarget::Rollover)
}

/// `QUERY` for rollover records, keyed by the fingerprint each replaced.
pub(crate) async fn rollover(server: &VaultServer) -> HandlerResult {
    let tls = &server.config().tls;
    let records = if tls.enabled {
        load_rollover(&tls.rollover_store).await?
    } else {
        Vec::new()
    };
    Ok(Response::new(ResponseCode::Answer, "query answered")
        .with_body(json!({ "rollover_data": rollover_data(&records) })))
}

fn subject(requester: &str, body: &InfoComponent) -> HandlerResult<FileKey> {
    let filename = required(&body.subject_file, "info", "subject_file")?;
    let owner = body.subject_file_owner.as_deref().unwrap_or(requester);
    Ok(FileKey::new(owner, filename))
}

async fn query_file(server: &VaultServer, requester: &str, body: &InfoComponent) -> HandlerResult<Value> {
    let key = subject(requester, body)?;
    let access = open_file(server, requester, &key).await?;
    require(server, &access, Permission::Read, requester, &key)?;
    Ok(json!({
        "owner": access.file.owner,
        "filename": access.file.filename,
        "size": access.file.size,
        "public": access.file.public,
        "created_at": access.file.created_at,
        "role": access.role,
    }))
}

async fn query_permissions(
    server: &VaultServer,
    requester: &str,
    body: &InfoComponent,
) -> HandlerResult<Value> {
    let key = subject(requester, body)?;
    let access = open_file(server, requester, &key).await?;
    require(server, &access, Permission::ManageRw, requester, &key)?;

    let mut lease = server.pool().lease(Priority::Normal).await?;
    let rows = grants::list_for_file(&mut lease, &key.owner, &key.filename).await?;
    lease.rollback().await?;
    let grants: Vec<Value> = rows
        .into_iter()
        .map(|g| {
            json!({
                "grantee": g.grantee,
                "role": g.role,
                "granted_by": g.granted_by,
                "granted_at": g.granted_at,
                "expires_at": g.expires_at,
            })
        })
        .collect();
    Ok(json!({ "owner": key.owner, "filename": key.filename, "grants": grants }))
}

async fn query_user(server: &VaultServer, requester: &str, verbose: bool) -> HandlerResult<Value> {
    let mut lease = server.pool().lease(Priority::Normal).await?;
    let user = users::get(&mut lease, requester)
        .await?
        .ok_or(HandlerError::Auth(crate::auth::AuthError::UserNotFound))?;
    let ban = bans::active(&mut lease, requester).await?;
    let detail = if verbose {
        let owned: Vec<String> = files::list_by_owner(&mut lease, requester)
            .await?
            .into_iter()
            .map(|f| f.filename)
            .collect();
        let held: Vec<Value> = grants::list_for_grantee(&mut lease, requester)
            .await?
            .into_iter()
            .map(|g| json!({ "owner": g.file_owner, "filename": g.filename, "role": g.role }))
            .collect();
        Some(json!({ "files": owned, "grants": held }))
    } else {
        None
    };
    lease.rollback().await?;

    let banned = ban.is_some();
    let mut answer = json!({
        "username": user.username,
        "created_at": user.created_at,
        "banned": banned,
        "ban_reason": ban.map(|b| b.reason),
        "session_iteration": server.auth().sessions().iteration(requester),
    });
    if let (Some(detail), Some(map)) = (detail, answer.as_object_mut()) {
        map.insert("detail".into(), detail);
    }
    Ok(answer)
}

/// `ROTATE`: accept a new certificate for this peer on a valid proof from
/// a previously pinned key.
pub(crate) async fn rotate(
    server: &VaultServer,
    context: &mut ConnectionContext,
    request: &Request,
) -> HandlerResult {
    let trust = server
        .trust()
        .ok_or_else(|| HandlerError::Conflict("trust rotation needs a TLS listener".into()))?;
    let certificate = context
        .peer_certificate
        .clone()
        .ok_or_else(|| HandlerError::Conflict("no peer certificate presented".into()))?;
    let body = component(request)?;
    let previous = required(&body.previous_fingerprint, "info", "previous_fingerprint")?;
    let signature = required(&body.signature, "info", "signature")?;

    let peer = context.peer.ip();
    let status = match trust
        .rotate(&peer.to_string(), &certificate, previous, signature)
        .await
    {
        Ok(status) => status,
        Err(e) => {
            server.activity().log(
                ActivityEntry::new(4, LogAuthor::Trust, LogCategory::Security, format!("rotation refused: {e}"))
                    .host(peer),
            );
            return Err(e.into());
        }
    };
    context.trust = Some(status);

    let new_fingerprint = fingerprint(&certificate);
    tracing::info!("Trust for {} rotated to {}", peer, new_fingerprint);
    server.activity().log(
        ActivityEntry::new(3, LogAuthor::Trust, LogCategory::Security, "certificate rotated").host(peer),
    );
    Ok(Response::new(ResponseCode::Rotated, "trust rotated").with_body(json!({
        "status": status.as_str(),
        "fingerprint": new_fingerprint,
    })))
}
