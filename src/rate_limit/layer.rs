//! HTTP admission middleware.
//!
//! Resolves the client key, asks the limiter for a verdict, and turns a
//! denial into a 429 with a Retry-After hint before any routing work
//! happens. Operational endpoints are exempt so probes and scrapes never
//! consume a client's budget.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::RateLimiter;
use crate::error::GatewayError;
use crate::identity;
use crate::metrics::GatewayMetrics;

/// Paths that bypass admission control.
const EXEMPT_PATHS: [&str; 5] = ["/health", "/metrics", "/docs", "/redoc", "/openapi.json"];

/// Static assets bypass by prefix.
const EXEMPT_PREFIX: &str = "/static";

/// Whether a request path is exempt from rate limiting.
pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path) || path.starts_with(EXEMPT_PREFIX)
}

/// State handed to the middleware via `from_fn_with_state`.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Admission check applied ahead of the router.
pub async fn enforce(State(state): State<RateLimitState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if is_exempt(path) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = identity::client_key(request.headers(), peer);

    if !state.limiter.admit(&client).await {
        let retry_after_secs = state.limiter.retry_after(&client).await;
        warn!(
            client = %client,
            path = %path,
            retry_after_secs,
            "Rate limit exceeded"
        );
        state.metrics.record_rate_limit_denial();
        return GatewayError::RateLimited { retry_after_secs }.into_response();
    }

    next.run(request).await
}
