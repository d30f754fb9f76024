//! Request orchestration: guardrail, upstream call, record submission.
//!
//! The pipeline owns the order of operations for both response modes.
//! Admission has already happened by the time a request reaches it; here
//! the message is validated, forwarded, and its outcome persisted without
//! ever blocking the response on storage.
//!
//! Streaming runs as a producer task feeding a bounded channel. The
//! consumer side is the HTTP response; when the client disconnects the
//! channel closes, the producer stops at its next send, and nothing is
//! recorded for the abandoned exchange.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::backend::{ChatBackend, Completion, TokenUsage};
use crate::error::{GatewayError, GatewayResult};
use crate::guardrail::{GuardrailPolicy, Verdict};
use crate::metrics::GatewayMetrics;
use crate::sink::{LogSink, RecordStatus, RequestRecord, ViolationRecord};

/// Producer-to-response buffering for one stream.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One server-sent event on the streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A piece of generated text.
    Chunk { text: String },
    /// Successful end of stream, carrying final token accounting.
    Done { token_usage: TokenUsage },
    /// Terminal failure; nothing follows it.
    Error { detail: String, error_type: String },
}

impl ChatEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// SSE data payload.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Chunk { text } => json!({ "text": text }),
            Self::Done { token_usage } => json!({ "token_usage": token_usage }),
            Self::Error { detail, error_type } => {
                json!({ "detail": detail, "error_type": error_type })
            }
        }
    }
}

/// Orchestrates validation, the upstream exchange, and record submission.
#[derive(Clone)]
pub struct ChatPipeline {
    policy: Arc<GuardrailPolicy>,
    backend: Arc<dyn ChatBackend>,
    sink: Arc<dyn LogSink>,
    metrics: Arc<GatewayMetrics>,
}

impl ChatPipeline {
    pub fn new(
        policy: Arc<GuardrailPolicy>,
        backend: Arc<dyn ChatBackend>,
        sink: Arc<dyn LogSink>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            policy,
            backend,
            sink,
            metrics,
        }
    }

    /// Run one non-streaming exchange.
    ///
    /// A guardrail rejection or upstream failure is returned to the caller
    /// after its record is submitted; the caller only maps it to a
    /// response.
    pub async fn chat(&self, client: &str, message: &str) -> GatewayResult<Completion> {
        let started = Instant::now();

        if let Verdict::Rejected(rejection) = self.policy.validate(message) {
            warn!(client = %client, kind = %rejection.kind, "Guardrail rejected request");
            self.metrics.record_guardrail_block(rejection.kind.as_str());
            self.sink
                .submit_violation(ViolationRecord::new(client, message, &rejection));
            return Err(rejection.into());
        }

        match self.backend.complete(message).await {
            Ok(completion) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .record_request_duration("/chat", started.elapsed().as_secs_f64());
                self.sink.submit_request(RequestRecord::new(
                    client,
                    message,
                    &completion.text,
                    latency_ms,
                    completion.usage,
                    RecordStatus::Success,
                    None,
                ));
                info!(client = %client, latency_ms, "Chat request processed");
                Ok(completion)
            }
            Err(e) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                error!(client = %client, error = %e, "Chat request failed");
                self.metrics.record_upstream_failure(e.error_type_name());
                self.sink.submit_request(RequestRecord::new(
                    client,
                    message,
                    "",
                    latency_ms,
                    TokenUsage::default(),
                    RecordStatus::Error,
                    Some(e.error_type_name().to_string()),
                ));
                Err(e)
            }
        }
    }

    /// Run one streaming exchange, returning its event stream.
    ///
    /// The stream always terminates with exactly one `done` or `error`
    /// event unless the client goes away first.
    pub fn stream(&self, client: String, message: String) -> ReceiverStream<ChatEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run_stream(client, message, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run_stream(self, client: String, message: String, tx: mpsc::Sender<ChatEvent>) {
        let started = Instant::now();

        if let Verdict::Rejected(rejection) = self.policy.validate(&message) {
            warn!(client = %client, kind = %rejection.kind, "Guardrail rejected streaming request");
            self.metrics.record_guardrail_block(rejection.kind.as_str());
            self.sink
                .submit_violation(ViolationRecord::new(&client, &message, &rejection));
            let _ = tx
                .send(ChatEvent::Error {
                    detail: rejection.detail,
                    error_type: rejection.kind.as_str().to_string(),
                })
                .await;
            return;
        }

        let mut chunks = match self.backend.stream(&message).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail_stream(&client, &message, String::new(), TokenUsage::default(), started, e, &tx)
                    .await;
                return;
            }
        };

        let mut full_response = String::new();
        let mut final_usage = TokenUsage::default();

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    // Usage can ride on any chunk; the last one wins.
                    if let Some(usage) = chunk.usage {
                        final_usage = usage;
                    }
                    if chunk.text.is_empty() {
                        continue;
                    }
                    full_response.push_str(&chunk.text);
                    self.metrics.record_stream_chunk();
                    if tx.send(ChatEvent::Chunk { text: chunk.text }).await.is_err() {
                        debug!(client = %client, "Stream client disconnected");
                        return;
                    }
                }
                Err(e) => {
                    self.fail_stream(&client, &message, full_response, final_usage, started, e, &tx)
                        .await;
                    return;
                }
            }
        }

        if tx
            .send(ChatEvent::Done {
                token_usage: final_usage,
            })
            .await
            .is_err()
        {
            debug!(client = %client, "Stream client disconnected before done event");
            return;
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_request_duration("/chat/stream", started.elapsed().as_secs_f64());
        self.sink.submit_request(RequestRecord::new(
            &client,
            &message,
            &full_response,
            latency_ms,
            final_usage,
            RecordStatus::Success,
            None,
        ));
        info!(client = %client, latency_ms, "Streaming request completed");
    }

    /// Terminate a failed stream: one error event, then the failure record.
    ///
    /// The record is written even when the client is already gone, because
    /// the upstream failure itself happened.
    #[allow(clippy::too_many_arguments)]
    async fn fail_stream(
        &self,
        client: &str,
        message: &str,
        partial_response: String,
        usage: TokenUsage,
        started: Instant,
        error: GatewayError,
        tx: &mpsc::Sender<ChatEvent>,
    ) {
        error!(client = %client, error = %error, "Streaming request failed");
        self.metrics.record_upstream_failure(error.error_type_name());

        let _ = tx
            .send(ChatEvent::Error {
                detail: error.detail(),
                error_type: "streaming_error".to_string(),
            })
            .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_request_duration("/chat/stream", started.elapsed().as_secs_f64());
        self.sink.submit_request(RequestRecord::new(
            client,
            message,
            &partial_response,
            latency_ms,
            usage,
            RecordStatus::Error,
            Some(error.error_type_name().to_string()),
        ));
    }
}
