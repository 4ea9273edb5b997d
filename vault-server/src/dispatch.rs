//! Request dispatch.
//!
//! Resolves the verb, checks the session for verbs that need one, routes to
//! the category handler and turns every failure into a response. Nothing a
//! handler returns can escape as a panic or a dropped connection.

use crate::auth::SessionContext;
use crate::connection::ConnectionContext;
use crate::handlers::{self, HandlerError, HandlerResult};
use crate::server::VaultServer;
use std::sync::atomic::Ordering;
use std::time::Instant;
use vault_types::{CodeClass, Operation, Request, Response};

/// Handle one decoded request.
pub async fn dispatch(
    server: &VaultServer,
    context: &mut ConnectionContext,
    request: Request,
) -> Response {
    server
        .metrics()
        .requests_total
        .fetch_add(1, Ordering::Relaxed);

    let Some(operation) = request.operation() else {
        tracing::debug!(
            "Unknown operation {}/{} from {}",
            request.header.category,
            request.header.subcategory,
            context.peer
        );
        return HandlerError::UnknownOperation {
            category: request.header.category,
            subcategory: request.header.subcategory,
        }
        .into_response();
    };

    let started = Instant::now();
    match route(server, context, operation, &request).await {
        Ok(response) => {
            tracing::debug!(
                "{} from {} -> {} in {:?}",
                operation.verb(),
                context.peer,
                response.header.code,
                started.elapsed()
            );
            response
        }
        Err(e) => {
            let code = e.code();
            match code.class() {
                CodeClass::ServerFault => {
                    tracing::error!("{} from {} failed: {}", operation.verb(), context.peer, e)
                }
                _ => tracing::debug!("{} from {} refused: {} ({})", operation.verb(), context.peer, code, e),
            }
            e.into_response()
        }
    }
}

async fn route(
    server: &VaultServer,
    context: &mut ConnectionContext,
    operation: Operation,
    request: &Request,
) -> HandlerResult {
    let rollover_query = operation == Operation::Query && handlers::info::is_rollover_query(request);
    let session = if operation.requires_session() && !rollover_query {
        Some(session(server, context, request).await?)
    } else {
        None
    };

    let response = match (operation, &session) {
        (Operation::Heartbeat, _) => handlers::info::heartbeat(),
        (Operation::Bye, _) => handlers::info::bye(),
        (Operation::Rotate, _) => handlers::info::rotate(server, context, request).await?,
        (Operation::UserNew, _) => handlers::auth::user_new(server, request).await?,
        (Operation::Auth, _) => handlers::auth::authenticate(server, context, request).await?,
        (Operation::UserDelete, _) => handlers::auth::user_delete(server, context, request).await?,
        (Operation::Query, _) if rollover_query => handlers::info::rollover(server).await?,
        (Operation::Query, Some(session)) => {
            handlers::info::query(server, &session.username, request).await?
        }
        (Operation::SessionRefresh, Some(session)) => {
            handlers::auth::refresh(server, session, request)?
        }
        (Operation::ChangePassword, Some(session)) => {
            handlers::auth::change_password(server, session, request).await?
        }
        (Operation::SessionTerminate, Some(session)) => {
            handlers::auth::terminate(server, context, session)
        }
        (
            Operation::Create
            | Operation::Upload
            | Operation::Read
            | Operation::Replace
            | Operation::Patch
            | Operation::Append
            | Operation::PatchFrom
            | Operation::ReplaceFrom
            | Operation::Delete,
            Some(session),
        ) => handlers::file::handle(server, &session.username, operation, request).await?,
        (
            Operation::Grant
            | Operation::Revoke
            | Operation::Hide
            | Operation::Publicise
            | Operation::Transfer,
            Some(session),
        ) => handlers::permission::handle(server, &session.username, operation, request).await?,
        (_, None) => return Err(HandlerError::NoSession),
    };

    // Echo the live iteration unless the handler set a newer one.
    Ok(match session {
        Some(session) if response.header.iteration.is_none() => {
            response.with_iteration(session.iteration)
        }
        _ => response,
    })
}

/// Validate the presented token and bind the user to the connection.
async fn session(
    server: &VaultServer,
    context: &mut ConnectionContext,
    request: &Request,
) -> HandlerResult<SessionContext> {
    let auth = request.auth.as_ref().ok_or(HandlerError::NoSession)?;
    let token = auth.token.as_deref().ok_or(HandlerError::NoSession)?;
    let session = server.auth().validate(&auth.identity, token).await?;
    context.user = Some(session.username.clone());
    Ok(session)
}
