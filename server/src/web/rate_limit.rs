use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::engine::rate_limiter::RateLimiter;

/// Per-IP limiter for chat upgrades.
pub struct ApiRateLimiters {
    /// Burst of 5, refill 1 per 12 seconds (~5/minute).
    pub ws: RateLimiter,
}

impl Default for ApiRateLimiters {
    fn default() -> Self {
        Self {
            ws: RateLimiter::new(5, 12.0),
        }
    }
}

/// Client IP for rate limiting. Proxy headers are only trusted when the
/// direct peer is loopback, so remote clients can't spoof their way past
/// the limit.
pub(crate) fn client_ip(req: &Request<Body>) -> String {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip());
    let from_loopback = peer_ip.is_some_and(|ip| ip.is_loopback());

    if from_loopback {
        if let Some(forwarded) = req.headers().get("x-forwarded-for")
            && let Ok(val) = forwarded.to_str()
            && let Some(first) = val.split(',').next()
        {
            return first.trim().to_string();
        }

        if let Some(real_ip) = req.headers().get("x-real-ip")
            && let Ok(val) = real_ip.to_str()
        {
            return val.trim().to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Reject chat upgrades from peers opening connections too quickly.
pub async fn ws_rate_limit(req: Request<Body>, next: Next) -> Response {
    if let Some(limiters) = req.extensions().get::<Arc<ApiRateLimiters>>() {
        let ip = client_ip(&req);
        if !limiters.ws.check(&ip) {
            warn!(%ip, "chat connection rate limit hit");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections. Please try again later.",
            )
                .into_response();
        }
    }
    next.run(req).await
}
