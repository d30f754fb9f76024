//! Request correlation for the HTTP surface.
//!
//! Wraps `tower_http::trace::TraceLayer` with a span maker that attaches a
//! request id to every request span. Proxies that already assign one send
//! it as `x-request-id`; requests without the header get a fresh UUID, so
//! log lines from one request's lifecycle can always be tied together.

use axum::http::{HeaderMap, Request};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;
use tracing::Span;

/// Header consulted for an existing correlation id.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// The request tracing layer used by the gateway router.
pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, CorrelationMakeSpan> {
    TraceLayer::new_for_http().make_span_with(CorrelationMakeSpan)
}

/// Span creator that carries a `request_id` field on every request span.
#[derive(Clone, Debug)]
pub struct CorrelationMakeSpan;

impl<B> tower_http::trace::MakeSpan<B> for CorrelationMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = correlation_id(request.headers());
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// The incoming `x-request-id`, or a fresh UUID when absent or unreadable.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
