//! HTTP surface of the gateway.
//!
//! # Endpoints
//!
//! - `POST /chat` - one-shot completion
//! - `POST /chat/stream` - SSE completion stream
//! - `GET /health` - liveness probe
//! - `GET /metrics` - Prometheus metrics
//!
//! Admission control runs as middleware ahead of the router, so a denied
//! client never reaches a handler. Handlers translate pipeline outcomes
//! into the `{detail, error_type}` error envelope; the streaming handler
//! commits a 200 up front and reports later failures as terminal `error`
//! events inside the stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::TokenUsage;
use crate::error::{GatewayError, GatewayResult};
use crate::identity::ClientId;
use crate::metrics::GatewayMetrics;
use crate::pipeline::ChatPipeline;
use crate::rate_limit::layer::{self, RateLimitState};
use crate::rate_limit::RateLimiter;
use crate::trace;

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on (default: 8000)
    pub port: u16,
    /// Bind address (default: 0.0.0.0)
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl ServerConfig {
    /// Create a config with a custom port and the default bind address.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Get the full bind address string.
    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Shared state for the request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Request orchestration.
    pub pipeline: ChatPipeline,
    /// Gateway metrics.
    pub metrics: Arc<GatewayMetrics>,
}

/// Chat request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// The user message to complete. Must not be empty.
    pub message: String,
}

/// Successful non-streaming response body.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// The full generated text.
    pub content: String,
    /// Final token accounting for the exchange.
    pub token_usage: TokenUsage,
}

/// The gateway HTTP server.
pub struct GatewayServer {
    config: ServerConfig,
    state: AppState,
    rate_limit: RateLimitState,
}

impl GatewayServer {
    pub fn new(
        config: ServerConfig,
        pipeline: ChatPipeline,
        limiter: Arc<RateLimiter>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            rate_limit: RateLimitState {
                limiter,
                metrics: Arc::clone(&metrics),
            },
            state: AppState { pipeline, metrics },
        }
    }

    /// Create the Axum router for the gateway.
    ///
    /// Layers apply outside-in: CORS, then request tracing, then admission
    /// control, then the route handlers.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/chat", post(chat_handler))
            .route("/chat/stream", post(chat_stream_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(axum::middleware::from_fn_with_state(
                self.rate_limit.clone(),
                layer::enforce,
            ))
            .layer(trace::trace_layer())
            .layer(tower_http::cors::CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Run the server until the shutdown token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let bind_addr = self.config.bind_string();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| GatewayError::Internal {
                reason: format!("failed to bind {bind_addr}: {e}"),
            })?;

        info!(addr = %bind_addr, "Gateway listening");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Gateway shutting down");
        })
        .await
        .map_err(|e| GatewayError::Internal {
            reason: format!("server error: {e}"),
        })
    }
}

/// Unwrap the request body, mapping any shape failure to a 422.
fn validate_body(payload: Result<Json<ChatRequest>, JsonRejection>) -> Result<String, GatewayError> {
    let Json(request) = payload.map_err(|rejection| GatewayError::Validation {
        detail: rejection.body_text(),
    })?;

    if request.message.is_empty() {
        return Err(GatewayError::Validation {
            detail: "Message must not be empty".to_string(),
        });
    }

    Ok(request.message)
}

/// Non-streaming completion handler.
async fn chat_handler(
    State(state): State<AppState>,
    ClientId(client): ClientId,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let response = match validate_body(payload) {
        Ok(message) => match state.pipeline.chat(&client, &message).await {
            Ok(completion) => Json(ChatResponse {
                content: completion.text,
                token_usage: completion.usage,
            })
            .into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    };

    state
        .metrics
        .record_request("/chat", response.status().as_u16());
    response
}

/// Streaming completion handler.
///
/// Shape failures are still plain JSON errors; once the body validates,
/// the response commits a 200 and every later outcome, including a
/// guardrail rejection, arrives as an event inside the stream.
async fn chat_stream_handler(
    State(state): State<AppState>,
    ClientId(client): ClientId,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let message = match validate_body(payload) {
        Ok(message) => message,
        Err(e) => {
            let response = e.into_response();
            state
                .metrics
                .record_request("/chat/stream", response.status().as_u16());
            return response;
        }
    };

    state
        .metrics
        .record_request("/chat/stream", StatusCode::OK.as_u16());

    let events = state.pipeline.stream(client, message).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.payload().to_string()),
        )
    });

    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Disables proxy buffering so chunks reach the client as they are
    // produced.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Health check handler (liveness probe).
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Metrics handler (Prometheus text format).
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use async_trait::async_trait;

    use crate::backend::{BoxChunkStream, ChatBackend, Completion, StreamChunk};
    use crate::config::{GuardrailConfig, RateLimitConfig};
    use crate::error::GatewayResult;
    use crate::guardrail::GuardrailPolicy;
    use crate::rate_limit::MemoryStore;
    use crate::sink::{LogSink, RequestRecord, ViolationRecord};

    struct ScriptedBackend {
        completion: GatewayResult<Completion>,
        stream_items: Vec<GatewayResult<StreamChunk>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, _prompt: &str) -> GatewayResult<Completion> {
            self.completion.clone()
        }

        async fn stream(&self, _prompt: &str) -> GatewayResult<BoxChunkStream> {
            Ok(Box::pin(futures::stream::iter(self.stream_items.clone())))
        }
    }

    struct NullSink;

    impl LogSink for NullSink {
        fn submit_request(&self, _record: RequestRecord) {}
        fn submit_violation(&self, _record: ViolationRecord) {}
    }

    fn scenario_backend() -> ScriptedBackend {
        ScriptedBackend {
            completion: Ok(Completion {
                text: "Hello world".to_string(),
                usage: TokenUsage {
                    input_tokens: 5,
                    output_tokens: 2,
                },
            }),
            stream_items: vec![
                Ok(StreamChunk {
                    text: "Hello ".to_string(),
                    usage: None,
                }),
                Ok(StreamChunk {
                    text: "world".to_string(),
                    usage: None,
                }),
                Ok(StreamChunk {
                    text: String::new(),
                    usage: Some(TokenUsage {
                        input_tokens: 5,
                        output_tokens: 2,
                    }),
                }),
            ],
        }
    }

    fn test_app(backend: ScriptedBackend, max_requests: u32) -> Router {
        let metrics = Arc::new(GatewayMetrics::new());
        let policy = Arc::new(GuardrailPolicy::new(&GuardrailConfig {
            max_input_length: 100,
            blocked_keywords: vec!["secret_key".to_string()],
        }));
        let pipeline = ChatPipeline::new(
            policy,
            Arc::new(backend),
            Arc::new(NullSink),
            Arc::clone(&metrics),
        );
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitConfig {
                max_requests,
                window_seconds: 60,
                redis_url: None,
            },
        ));
        GatewayServer::new(ServerConfig::default(), pipeline, limiter, metrics).router()
    }

    fn chat_request(path: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("promptgate_"));
    }

    #[tokio::test]
    async fn test_chat_returns_completion() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat", r#"{"message": "hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["content"], "Hello world");
        assert_eq!(json["token_usage"]["input_tokens"], 5);
        assert_eq!(json["token_usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn test_chat_guardrail_rejection_is_400() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat", r#"{"message": "my secret_key"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error_type"], "blocked_content");
        assert_eq!(json["detail"], "Message contains prohibited content");
    }

    #[tokio::test]
    async fn test_chat_empty_message_is_422() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat", r#"{"message": ""}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn test_chat_malformed_body_is_422() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat", "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn test_chat_upstream_failure_is_504() {
        let app = test_app(
            ScriptedBackend {
                completion: Err(GatewayError::UpstreamTimeout { timeout_secs: 120 }),
                stream_items: vec![],
            },
            10,
        );
        let response = app
            .oneshot(chat_request("/chat", r#"{"message": "hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = body_json(response).await;
        assert_eq!(json["error_type"], "upstream_timeout");
    }

    #[tokio::test]
    async fn test_stream_emits_exact_frames() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat/stream", r#"{"message": "hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(
            body,
            "event: chunk\ndata: {\"text\":\"Hello \"}\n\n\
             event: chunk\ndata: {\"text\":\"world\"}\n\n\
             event: done\ndata: {\"token_usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n\n"
        );
    }

    #[tokio::test]
    async fn test_stream_response_headers() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat/stream", r#"{"message": "hi"}"#))
            .await
            .unwrap();

        let headers = response.headers();
        assert!(
            headers
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(headers.get(header::CONNECTION).unwrap(), "keep-alive");
        assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
    }

    #[tokio::test]
    async fn test_stream_guardrail_rejection_stays_sse() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat/stream", r#"{"message": "my secret_key"}"#))
            .await
            .unwrap();

        // The stream commits a 200; the rejection is the only event.
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(
            body,
            "event: error\ndata: {\"detail\":\"Message contains prohibited content\",\
             \"error_type\":\"blocked_content\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_stream_midway_failure_emits_error_event() {
        let app = test_app(
            ScriptedBackend {
                completion: Ok(Completion {
                    text: String::new(),
                    usage: TokenUsage::default(),
                }),
                stream_items: vec![
                    Ok(StreamChunk {
                        text: "partial".to_string(),
                        usage: None,
                    }),
                    Err(GatewayError::Upstream {
                        status: Some(500),
                        message: "boom".to_string(),
                    }),
                ],
            },
            10,
        );
        let response = app
            .oneshot(chat_request("/chat/stream", r#"{"message": "hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.starts_with("event: chunk\ndata: {\"text\":\"partial\"}\n\n"));
        assert!(body.contains("event: error\n"));
        assert!(body.contains("\"error_type\":\"streaming_error\""));
        assert!(!body.contains("boom"));
    }

    #[tokio::test]
    async fn test_stream_empty_message_is_json_422() {
        let app = test_app(scenario_backend(), 10);
        let response = app
            .oneshot(chat_request("/chat/stream", r#"{"message": ""}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn test_rate_limited_chat_gets_429() {
        let app = test_app(scenario_backend(), 1);

        let ok = app
            .clone()
            .oneshot(chat_request("/chat", r#"{"message": "hi"}"#))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let denied = app
            .oneshot(chat_request("/chat", r#"{"message": "hi"}"#))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(denied.headers().contains_key(header::RETRY_AFTER));

        let json = body_json(denied).await;
        assert_eq!(json["error_type"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_health_is_exempt_from_rate_limiting() {
        // Zero budget denies every chat request but never the probe.
        let app = test_app(scenario_backend(), 0);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/health")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let denied = app
            .oneshot(chat_request("/chat", r#"{"message": "hi"}"#))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.bind_string(), "0.0.0.0:8000");

        let config = ServerConfig::with_port(9100);
        assert_eq!(config.bind_string(), "0.0.0.0:9100");
    }
}
