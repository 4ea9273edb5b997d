//! Account and session verbs.

use super::{credentials, required, to_body, HandlerResult};
use crate::auth::SessionContext;
use crate::cache::FileKey;
use crate::connection::ConnectionContext;
use crate::server::VaultServer;
use vault_types::{Response, ResponseCode};

/// `UNEW`: create an account.
pub(crate) async fn user_new(server: &VaultServer, request: &vault_types::Request) -> HandlerResult {
    let auth = credentials(request)?;
    let password = required(&auth.password, "auth", "password")?;
    server.auth().register(&auth.identity, password).await?;
    tracing::info!("Account created: {}", auth.identity);
    Ok(Response::new(ResponseCode::UserCreated, "user created"))
}

/// `AUTH`: check the password and start a session at iteration 0.
pub(crate) async fn authenticate(
    server: &VaultServer,
    context: &mut ConnectionContext,
    request: &vault_types::Request,
) -> HandlerResult {
    let auth = credentials(request)?;
    let password = required(&auth.password, "auth", "password")?;
    let token = server.auth().authenticate(&auth.identity, password).await?;
    context.user = Some(auth.identity.clone());
    Ok(Response::new(ResponseCode::Authenticated, "authenticated")
        .with_body(to_body(&token)?)
        .with_iteration(token.iteration))
}

/// `SREF`: rotate token and refresh digest.
pub(crate) fn refresh(
    server: &VaultServer,
    session: &SessionContext,
    request: &vault_types::Request,
) -> HandlerResult {
    let auth = credentials(request)?;
    let token = required(&auth.token, "auth", "token")?;
    let digest = required(&auth.refresh_digest, "auth", "refresh_digest")?;
    let token = server.auth().refresh(&session.username, token, digest)?;
    Ok(Response::new(ResponseCode::Refreshed, "session refreshed")
        .with_body(to_body(&token)?)
        .with_iteration(token.iteration))
}

/// `CHPW`: replace the password. The session stays live.
pub(crate) async fn change_password(
    server: &VaultServer,
    session: &SessionContext,
    request: &vault_types::Request,
) -> HandlerResult {
    let auth = credentials(request)?;
    let current = required(&auth.password, "auth", "password")?;
    let new = required(&auth.new_password, "auth", "new_password")?;
    server
        .auth()
        .change_password(&session.username, current, new)
        .await?;
    Ok(Response::new(ResponseCode::PasswordChanged, "password changed"))
}

/// `UDEL`: delete the account, its files and every cached trace of them.
pub(crate) async fn user_delete(
    server: &VaultServer,
    context: &mut ConnectionContext,
    request: &vault_types::Request,
) -> HandlerResult {
    let auth = credentials(request)?;
    let password = required(&auth.password, "auth", "password")?;
    let username = auth.identity.as_str();
    let owned = server.auth().delete_user(username, password).await?;

    server.storage().remove_user(username);
    for filename in &owned {
        let key = FileKey::new(username, filename);
        server.amend_buffers().remove(&key);
        server.read_buffers().invalidate_file(&key);
        server.tombstones().mark(key);
    }
    if let Err(e) = server.files().remove_owner(username).await {
        tracing::error!("Account {} deleted but its files remain on disk: {}", username, e);
        return Err(e.into());
    }

    if context.user.as_deref() == Some(username) {
        context.user = None;
    }
    tracing::info!("Account deleted: {} ({} files)", username, owned.len());
    Ok(Response::new(ResponseCode::UserDeleted, "user deleted")
        .with_body(serde_json::json!({ "files_removed": owned.len() })))
}

/// `STERM`: end the session.
pub(crate) fn terminate(
    server: &VaultServer,
    context: &mut ConnectionContext,
    session: &SessionContext,
) -> Response {
    server.auth().terminate(&session.username);
    context.user = None;
    Response::new(ResponseCode::SessionTerminated, "session terminated")
}
