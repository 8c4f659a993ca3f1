//! Token service: one JSON request in, one raw token out, then close.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::token::TokenAuthority;
use crate::config::AuthSection;
use crate::error::AuthError;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AuthRequest {
    Auth { username: String },
}

/// Per-request limits.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl From<&AuthSection> for RequestLimits {
    fn from(config: &AuthSection) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_bytes: config.max_request_bytes,
        }
    }
}

/// Handle to the running accept loop.
pub struct AuthServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl AuthServer {
    /// Bind the listener and start accepting. Failing to bind is fatal to
    /// the caller.
    pub async fn start(
        bind_addr: &str,
        authority: Arc<TokenAuthority>,
        config: &AuthSection,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("auth listener started on {}", local_addr);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            authority,
            RequestLimits::from(config),
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            handle: Mutex::new(Some(handle)),
            grace: config.shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, wait up to the grace period, then abort. Calling this
    /// again is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut handle) = handle else {
            return;
        };
        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(_) => info!("auth listener stopped"),
            Err(_) => {
                warn!(grace = ?self.grace, "auth listener did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    authority: Arc<TokenAuthority>,
    limits: RequestLimits,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("auth listener shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let authority = authority.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_auth_connection(stream, &authority, limits).await {
                                warn!(peer = %addr, error = %e, "auth request failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept auth connection");
                    }
                }
            }
        }
    }
}

/// Serve a single exchange on `stream`. Nothing is written back unless the
/// request parsed.
pub async fn handle_auth_connection<S>(
    mut stream: S,
    authority: &TokenAuthority,
    limits: RequestLimits,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = tokio::time::timeout(limits.timeout, read_request(&mut stream, limits.max_bytes))
        .await
        .map_err(|_| AuthError::Timeout)??;

    let AuthRequest::Auth { username } = request;
    let token = authority.issue_or_get(&username);
    stream.write_all(token.as_bytes()).await?;
    stream.shutdown().await?;
    debug!(identity = %username, "served auth token");
    Ok(())
}

/// Read until the buffer holds a complete request object.
async fn read_request<S>(stream: &mut S, max_bytes: usize) -> Result<AuthRequest, AuthError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(AuthError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > max_bytes {
            return Err(AuthError::TooLarge(max_bytes));
        }
        match serde_json::from_slice::<AuthRequest>(&buf) {
            Ok(request) => return Ok(request),
            Err(e) if e.is_eof() => continue,
            Err(e) => return Err(AuthError::Malformed(e.to_string())),
        }
    }
}
