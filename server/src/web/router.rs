use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use super::app_state::AppState;
use super::chat_socket;
use super::rate_limit::{ApiRateLimiters, ws_rate_limit};

/// Build the axum router: the `/chat` WebSocket endpoint behind a per-IP
/// connection limit.
pub fn build_router(state: Arc<AppState>) -> Router {
    build_router_with_limits(state, Arc::new(ApiRateLimiters::default()))
}

pub fn build_router_with_limits(state: Arc<AppState>, rate_limiters: Arc<ApiRateLimiters>) -> Router {
    Router::new()
        .route("/chat", axum::routing::get(chat_socket::ws_upgrade))
        .layer(axum::middleware::from_fn(ws_rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(axum::Extension(rate_limiters))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chat_hub::tests::Harness;
    use crate::engine::rate_limiter::RateLimiter;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn plain_get(peer: &str) -> Request<Body> {
        let mut req = Request::builder().uri("/chat").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        req
    }

    #[tokio::test]
    async fn test_upgrade_limit_per_peer() {
        let h = Harness::new();
        let state = Arc::new(AppState { hub: h.hub.clone() });
        let limiters = Arc::new(ApiRateLimiters {
            ws: RateLimiter::new(2, 60.0),
        });
        let app = build_router_with_limits(state, limiters);

        for _ in 0..2 {
            let res = app.clone().oneshot(plain_get("198.51.100.4:4000")).await.unwrap();
            // Not a real upgrade, but it got past the limiter
            assert_ne!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        let res = app.clone().oneshot(plain_get("198.51.100.4:4000")).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        let res = app.oneshot(plain_get("198.51.100.5:4000")).await.unwrap();
        assert_ne!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let h = Harness::new();
        let app = build_router(Arc::new(AppState { hub: h.hub.clone() }));
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
