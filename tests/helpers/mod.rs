//! Mock OpenAI-compatible upstream and gateway fixtures for integration
//! testing.
//!
//! The mock server speaks just enough of the chat-completions wire format
//! to exercise the full request path: JSON completions, SSE streams with
//! configurable raw bodies, and error statuses. Every request body and
//! authorization header is captured for assertions.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use promptgate::backend::OpenAiBackend;
use promptgate::config::{GuardrailConfig, RateLimitConfig, SinkConfig, UpstreamConfig};
use promptgate::guardrail::GuardrailPolicy;
use promptgate::metrics::GatewayMetrics;
use promptgate::pipeline::ChatPipeline;
use promptgate::rate_limit::{MemoryStore, RateLimiter};
use promptgate::server::{GatewayServer, ServerConfig};
use promptgate::sink::JsonlSink;

/// Mock OpenAI-compatible upstream server.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    status: StatusCode,
    completion: Value,
    stream_body: String,
    abort_mid_stream: bool,
}

impl MockUpstream {
    /// A mock that completes with "Hello world" and 5/2 token usage, and
    /// streams the equivalent two-chunk sequence.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            completion: completion_body("Hello world", 5, 2),
            stream_body: two_chunk_stream_body(),
            abort_mid_stream: false,
        }
    }

    /// Respond to every request with the given status and no usable body.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Replace the non-streaming response body.
    pub fn with_completion(mut self, text: &str, input_tokens: u64, output_tokens: u64) -> Self {
        self.completion = completion_body(text, input_tokens, output_tokens);
        self
    }

    /// Replace the raw SSE body served for streaming requests.
    pub fn with_stream_body(mut self, body: impl Into<String>) -> Self {
        self.stream_body = body.into();
        self
    }

    /// Serve the stream body, then abort the connection mid-response.
    pub fn with_aborted_stream(mut self, prefix: impl Into<String>) -> Self {
        self.stream_body = prefix.into();
        self.abort_mid_stream = true;
        self
    }

    /// Start the mock server and return its address and handle.
    pub async fn start(self) -> (SocketAddr, MockServerHandle) {
        let state = Arc::new(MockState {
            status: self.status,
            completion: self.completion,
            stream_body: self.stream_body,
            abort_mid_stream: self.abort_mid_stream,
            request_count: RwLock::new(0),
            last_request: RwLock::new(None),
            last_authorization: RwLock::new(None),
        });

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_completion))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            addr,
            MockServerHandle {
                state,
                _handle: handle,
            },
        )
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the running mock server.
pub struct MockServerHandle {
    state: Arc<MockState>,
    _handle: JoinHandle<()>,
}

impl MockServerHandle {
    /// Number of completion requests received.
    pub async fn request_count(&self) -> u32 {
        *self.state.request_count.read().await
    }

    /// Body of the last completion request received.
    pub async fn last_request(&self) -> Option<Value> {
        self.state.last_request.read().await.clone()
    }

    /// Authorization header of the last request, if any.
    pub async fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.read().await.clone()
    }
}

#[derive(Debug)]
struct MockState {
    status: StatusCode,
    completion: Value,
    stream_body: String,
    abort_mid_stream: bool,
    request_count: RwLock<u32>,
    last_request: RwLock<Option<Value>>,
    last_authorization: RwLock<Option<String>>,
}

async fn handle_completion(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    *state.request_count.write().await += 1;
    *state.last_request.write().await = Some(request.clone());
    *state.last_authorization.write().await = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if state.status != StatusCode::OK {
        return (state.status, "upstream failure").into_response();
    }

    if request["stream"].as_bool().unwrap_or(false) {
        if state.abort_mid_stream {
            // The error must not be ready in the same poll as the body
            // bytes: hyper would abort the connection with the first chunk
            // still buffered and nothing on the wire.
            let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(
                state.stream_body.clone(),
            ))])
            .chain(futures::stream::once(async {
                tokio::time::sleep(Duration::from_millis(25)).await;
                Err(std::io::Error::other("connection reset"))
            }));
            return axum::response::Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(axum::body::Body::from_stream(chunks))
                .unwrap();
        }
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            state.stream_body.clone(),
        )
            .into_response();
    }

    Json(state.completion.clone()).into_response()
}

/// Non-streaming completion body in the chat-completions shape.
pub fn completion_body(text: &str, input_tokens: u64, output_tokens: u64) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": input_tokens, "completion_tokens": output_tokens},
    })
}

/// Raw SSE body: "Hello " and "world" chunks, a usage-only frame, then the
/// end sentinel.
pub fn two_chunk_stream_body() -> String {
    concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    )
    .to_string()
}

/// A fully wired gateway router backed by a running mock upstream.
pub struct TestGateway {
    pub router: Router,
    pub upstream: MockServerHandle,
    pub log_file: NamedTempFile,
}

/// Wire a gateway to the given mock with an in-process rate limit store
/// and a real JSON-lines sink writing to a temp file.
pub async fn spawn_gateway(
    mock: MockUpstream,
    max_requests: u32,
    api_key: Option<&str>,
) -> TestGateway {
    let (addr, upstream) = mock.start().await;

    let log_file = NamedTempFile::new().unwrap();
    let metrics = Arc::new(GatewayMetrics::new());
    let (sink, _worker) = JsonlSink::spawn(
        &SinkConfig {
            path: log_file.path().to_path_buf(),
            channel_capacity: 64,
        },
        Arc::clone(&metrics),
    );

    let upstream_config = UpstreamConfig {
        api_key: api_key.map(str::to_string),
        ..UpstreamConfig::with_base_url(format!("http://{addr}"))
    };
    let backend = OpenAiBackend::new(upstream_config).unwrap();

    let policy = GuardrailPolicy::new(&GuardrailConfig::default());
    let pipeline = ChatPipeline::new(
        Arc::new(policy),
        Arc::new(backend),
        Arc::new(sink),
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

    let router = GatewayServer::new(ServerConfig::default(), pipeline, limiter, metrics).router();

    TestGateway {
        router,
        upstream,
        log_file,
    }
}

/// Poll the sink file until it holds at least `count` records.
///
/// Records are written by a background worker, so the file lags the
/// response by a scheduling hop.
pub async fn wait_for_records(path: &Path, count: usize) -> Vec<Value> {
    for _ in 0..100 {
        if let Ok(content) = std::fs::read_to_string(path) {
            let records: Vec<Value> = content
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect();
            if records.len() >= count {
                return records;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {count} record(s) in {}", path.display());
}
