//! Per-connection request loop.
//!
//! Each connection gets a task that reads one frame at a time, dispatches
//! it and writes the response before reading the next, so requests on a
//! connection are handled strictly in order.
//!
//! ```text
//! ACTIVE (receive → decode → dispatch → encode → send) ──▶ TIMED_OUT
//!                                                      ──▶ CLIENT_CLOSED
//!                                                      ──▶ SHUTTING_DOWN
//!                                                      ──▶ FATAL
//! ```
//!
//! Decode errors inside an intact frame get an error response and the loop
//! continues. A malformed header, a truncated payload or a refused peer
//! ends the connection after the error response is sent.

use crate::dispatch::dispatch;
use crate::handlers::HandlerError;
use crate::limits::RequestKey;
use crate::server::VaultServer;
use crate::trust::TrustStatus;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vault_types::{CodecError, Operation, Request, RequestHeader, Response, ResponseCode, HEADER_SIZE};

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Serving requests.
    Active,
    /// No request arrived within the idle window.
    TimedOut,
    /// The client closed the stream, sent `BYE`, or set `finish`.
    ClientClosed,
    /// Server shutdown reached this connection between requests.
    ShuttingDown,
    /// The byte stream can no longer be trusted.
    Fatal,
}

/// What the dispatcher knows about the peer.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Remote address.
    pub peer: SocketAddr,
    /// DER certificate the peer presented over TLS.
    pub peer_certificate: Option<Vec<u8>>,
    /// Trust decision for that certificate.
    pub trust: Option<TrustStatus>,
    /// Username of the last authenticated request.
    pub user: Option<String>,
}

impl ConnectionContext {
    /// Context for a plain connection from `peer`.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            peer_certificate: None,
            trust: None,
            user: None,
        }
    }
}

/// One client connection.
pub struct Connection<S> {
    server: Arc<VaultServer>,
    stream: S,
    context: ConnectionContext,
    state: ConnectionState,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an accepted stream.
    pub fn new(server: Arc<VaultServer>, stream: S, context: ConnectionContext) -> Self {
        Self {
            server,
            stream,
            context,
            state: ConnectionState::Active,
        }
    }

    /// Serve requests until the connection ends. Returns why it ended.
    pub async fn run(mut self) -> ConnectionState {
        let peer = self.context.peer;
        tracing::debug!("New connection from {}", peer);
        let cancel = self.server.coordinator().connection_token();
        let idle = self.server.config().server.idle_timeout();

        while self.state == ConnectionState::Active {
            let mut header = [0u8; HEADER_SIZE];
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                read = tokio::time::timeout(idle, self.stream.read_exact(&mut header)) => Some(read),
            };
            match read {
                None => {
                    self.state = ConnectionState::ShuttingDown;
                    break;
                }
                Some(Err(_)) => {
                    self.state = ConnectionState::TimedOut;
                    break;
                }
                Some(Ok(Err(e))) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        tracing::debug!("Read from {} failed: {}", peer, e);
                    }
                    self.state = ConnectionState::ClientClosed;
                    break;
                }
                Some(Ok(Ok(_))) => {}
            }
            self.server
                .metrics()
                .bytes_received
                .fetch_add(HEADER_SIZE as u64, Ordering::Relaxed);

            let response = self.handle_frame(&header, idle).await;
            if let Err(e) = self.send(response).await {
                tracing::debug!("Write to {} failed: {}", peer, e);
                self.state = ConnectionState::Fatal;
            }
        }

        let _ = self.stream.shutdown().await;
        tracing::debug!(
            "Connection from {} closed ({:?}, user={:?})",
            peer,
            self.state,
            self.context.user
        );
        self.state
    }

    async fn handle_frame(&mut self, header: &[u8; HEADER_SIZE], idle: Duration) -> Response {
        let header = match RequestHeader::decode(header) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!("Malformed header from {}: {}", self.context.peer, e);
                self.state = ConnectionState::Fatal;
                return HandlerError::from(e).into_response().ending_connection();
            }
        };

        let max_body = self.server.config().server.max_body_size;
        if header.body_size > max_body {
            // Skip the payload so the next header lines up.
            let expected = header.payload_len() as u64;
            let skipped = tokio::time::timeout(
                idle,
                tokio::io::copy(&mut (&mut self.stream).take(expected), &mut tokio::io::sink()),
            )
            .await;
            return match skipped {
                Ok(Ok(n)) if n == expected => HandlerError::from(CodecError::schema(
                    "header",
                    format!("body_size {} exceeds {}", header.body_size, max_body),
                ))
                .into_response(),
                Ok(Ok(n)) => self.truncated(expected as usize, n as usize),
                _ => self.truncated(expected as usize, 0),
            };
        }

        let mut payload = vec![0u8; header.payload_len()];
        let filled = match tokio::time::timeout(idle, self.fill(&mut payload)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!("Payload read from {} failed: {}", self.context.peer, e);
                0
            }
            Err(_) => 0,
        };
        if filled < payload.len() {
            return self.truncated(payload.len(), filled);
        }
        self.server
            .metrics()
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let finish = header.finish;
        let (auth, body) = payload.split_at(header.auth_size as usize);
        let response = match Request::from_parts(header, auth, body) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => HandlerError::from(e).into_response(),
        };

        if finish {
            self.state = ConnectionState::ClientClosed;
            return response.ending_connection();
        }
        if response.header.ended_connection && self.state == ConnectionState::Active {
            self.state = ConnectionState::ClientClosed;
        }
        response
    }

    async fn handle_request(&mut self, request: Request) -> Response {
        let rotating = request.operation() == Some(Operation::Rotate);
        if self.context.trust == Some(TrustStatus::Mismatch) && !rotating {
            tracing::warn!("Refusing {}: certificate matches no pin", self.context.peer);
            self.server
                .metrics()
                .trust_refusals
                .fetch_add(1, Ordering::Relaxed);
            self.state = ConnectionState::Fatal;
            return HandlerError::Untrusted("certificate matches no pin, send ROTATE first".into())
                .into_response()
                .ending_connection();
        }

        // Only an identity proven earlier on this connection owns a bucket.
        let key = match self.context.user.as_deref() {
            Some(user) => RequestKey::User(user),
            None => RequestKey::Anonymous(self.context.peer.ip()),
        };
        if let Err(e) = self.server.rate_limits().check_request(key) {
            tracing::warn!("Request rate limited for {}: {}", self.context.peer, e);
            self.server
                .metrics()
                .rate_limit_hits
                .fetch_add(1, Ordering::Relaxed);
            return Response::new(ResponseCode::RateLimited, e.to_string());
        }

        dispatch(&self.server, &mut self.context, request).await
    }

    fn truncated(&mut self, expected: usize, actual: usize) -> Response {
        self.state = ConnectionState::Fatal;
        HandlerError::from(CodecError::TruncatedBody { expected, actual })
            .into_response()
            .ending_connection()
    }

    /// Read until `buf` is full or the stream ends.
    async fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn send(&mut self, response: Response) -> std::io::Result<()> {
        if response.code().is_some_and(ResponseCode::is_fault) {
            self.server
                .metrics()
                .errors_total
                .fetch_add(1, Ordering::Relaxed);
        }
        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode response: {}", e);
                Response::new(ResponseCode::Internal, "response encoding failed")
                    .ending_connection()
                    .encode()
                    .map_err(std::io::Error::other)?
            }
        };
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.server
            .metrics()
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
