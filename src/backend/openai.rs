//! OpenAI-compatible chat completions client with connection pooling.
//!
//! The client keeps persistent connections to the upstream and classifies
//! transport failures into gateway errors: timeouts, connection failures,
//! and everything else. Streaming responses arrive as `data:` lines in
//! text/event-stream framing, terminated by a `[DONE]` sentinel; the final
//! accounting frame carries token usage when `include_usage` is requested.
//!
//! No automatic retry. A chat completion is not idempotent and a retry
//! would double-bill tokens.

use std::collections::VecDeque;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{BoxChunkStream, ChatBackend, Completion, StreamChunk, TokenUsage};
use crate::config::UpstreamConfig;
use crate::error::{GatewayError, GatewayResult};

/// Sampling temperature forwarded with every request.
const GENERATION_TEMPERATURE: f32 = 0.7;

/// Upper bound on generated tokens per response.
const MAX_OUTPUT_TOKENS: u32 = 2048;

/// Pooled HTTP client over one upstream base URL.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    config: UpstreamConfig,
}

impl OpenAiBackend {
    /// Build the client from configuration.
    pub fn new(config: UpstreamConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal {
                reason: format!("failed to build upstream client: {e}"),
            })?;

        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_body<'a>(&'a self, prompt: &'a str, streaming: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.config.model,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
            }],
            temperature: GENERATION_TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
            stream: streaming.then_some(true),
            stream_options: streaming.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(&self, prompt: &str, streaming: bool) -> GatewayResult<reqwest::Response> {
        let mut request = self
            .client
            .post(self.chat_url())
            .json(&self.request_body(prompt, streaming));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_error(e, self.config.timeout.as_secs()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Upstream returned error status");
            return Err(GatewayError::Upstream {
                status: Some(status.as_u16()),
                message: format!("upstream returned HTTP {status}"),
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(&self, prompt: &str) -> GatewayResult<Completion> {
        debug!(model = %self.config.model, "Sending completion request");

        let response = self.send(prompt, false).await?;
        let body: CompletionResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse upstream response");
            GatewayError::Upstream {
                status: None,
                message: format!("failed to parse upstream response: {e}"),
            }
        })?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .unwrap_or_default();
        let usage = body.usage.map(TokenUsage::from).unwrap_or_default();

        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Received completion response"
        );
        Ok(Completion { text, usage })
    }

    async fn stream(&self, prompt: &str) -> GatewayResult<BoxChunkStream> {
        debug!(model = %self.config.model, "Sending streaming completion request");

        let response = self.send(prompt, true).await?;
        let timeout_secs = self.config.timeout.as_secs();

        let state = StreamState {
            inner: response.bytes_stream(),
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
            terminated: false,
        };

        let chunks = futures::stream::unfold(state, move |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.terminated {
                    return None;
                }
                match state.inner.next().await {
                    Some(Ok(bytes)) => {
                        for line in state.decoder.push(&bytes) {
                            match parse_stream_line(&line) {
                                Some(StreamLine::Done) => {
                                    state.terminated = true;
                                    break;
                                }
                                Some(StreamLine::Chunk(chunk)) => state.pending.push_back(chunk),
                                None => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.terminated = true;
                        return Some((Err(classify_error(e, timeout_secs)), state));
                    }
                    // Upstream closed without a [DONE]; treat as complete.
                    None => {
                        state.terminated = true;
                        return None;
                    }
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}

struct StreamState<S> {
    inner: S,
    decoder: LineDecoder,
    pending: VecDeque<StreamChunk>,
    terminated: bool,
}

/// Classify a reqwest error into the gateway taxonomy.
fn classify_error(error: reqwest::Error, timeout_secs: u64) -> GatewayError {
    if error.is_timeout() {
        warn!(timeout_secs, "Upstream request timed out");
        GatewayError::UpstreamTimeout { timeout_secs }
    } else if error.is_connect() {
        warn!(error = %error, "Failed to connect to upstream");
        GatewayError::UpstreamConnectionFailed {
            reason: error.to_string(),
        }
    } else {
        error!(error = %error, "Upstream request failed");
        GatewayError::Upstream {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

/// Reassembles network chunks into complete lines.
///
/// Bytes stay buffered until their line's newline arrives, so a multi-byte
/// character split across reads is never decoded in halves.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }
}

enum StreamLine {
    Chunk(StreamChunk),
    Done,
}

/// Decode one SSE line from the upstream.
///
/// Non-data lines and malformed payloads are skipped rather than failing
/// the whole stream.
fn parse_stream_line(line: &str) -> Option<StreamLine> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamLine::Done);
    }

    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Skipping malformed stream line");
            return None;
        }
    };

    let text = event
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();
    Some(StreamLine::Chunk(StreamChunk {
        text,
        usage: event.usage.map(TokenUsage::from),
    }))
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}
