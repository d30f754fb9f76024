//! Fire-and-forget persistence for request and violation records.
//!
//! Handlers never wait on storage. [`LogSink::submit_request`] and
//! [`LogSink::submit_violation`] enqueue onto a bounded channel and return;
//! a background worker appends records as JSON lines. A full queue drops
//! the record and bumps a counter rather than applying backpressure to the
//! request path, and write failures are logged and swallowed for the same
//! reason.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::TokenUsage;
use crate::config::SinkConfig;
use crate::guardrail::Rejection;
use crate::metrics::GatewayMetrics;

/// Prompts are truncated to this many characters before persisting.
const PROMPT_LIMIT: usize = 5000;

/// Responses are truncated to this many characters before persisting.
const RESPONSE_LIMIT: usize = 10_000;

/// Terminal status of a persisted exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Error,
}

/// One completed (or failed) exchange with the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: String,
    pub client: String,
    pub prompt: String,
    pub response: String,
    pub latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RequestRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &str,
        prompt: &str,
        response: &str,
        latency_ms: f64,
        usage: TokenUsage,
        status: RecordStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            client: client.to_string(),
            prompt: truncate_chars(prompt, PROMPT_LIMIT),
            response: truncate_chars(response, RESPONSE_LIMIT),
            latency_ms,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            status,
            error_message,
        }
    }
}

/// A request stopped by the guardrail before reaching the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub timestamp: String,
    pub client: String,
    pub prompt: String,
    pub violation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_keyword: Option<String>,
}

impl ViolationRecord {
    pub fn new(client: &str, prompt: &str, rejection: &Rejection) -> Self {
        Self {
            timestamp: now_rfc3339(),
            client: client.to_string(),
            prompt: truncate_chars(prompt, PROMPT_LIMIT),
            violation_type: rejection.kind.as_str().to_string(),
            matched_keyword: rejection.matched_keyword.clone(),
        }
    }
}

/// Destination for records produced by the request path.
pub trait LogSink: Send + Sync {
    /// Enqueue a request record without waiting.
    fn submit_request(&self, record: RequestRecord);

    /// Enqueue a violation record without waiting.
    fn submit_violation(&self, record: ViolationRecord);
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum SinkRecord {
    Request(RequestRecord),
    Violation(ViolationRecord),
}

/// Appends records to a JSON-lines file from a background task.
pub struct JsonlSink {
    tx: mpsc::Sender<SinkRecord>,
    metrics: Arc<GatewayMetrics>,
}

impl JsonlSink {
    /// Start the sink and its worker task.
    pub fn spawn(config: &SinkConfig, metrics: Arc<GatewayMetrics>) -> (Self, SinkWorker) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        info!(
            path = %config.path.display(),
            capacity = config.channel_capacity,
            "Record sink started"
        );
        let handle = tokio::spawn(run_worker(config.path.clone(), rx));
        (Self { tx, metrics }, SinkWorker { handle })
    }

    fn submit(&self, record: SinkRecord) {
        if self.tx.try_send(record).is_err() {
            self.metrics.record_sink_drop();
            warn!("Record sink queue full, dropping record");
        }
    }
}

impl LogSink for JsonlSink {
    fn submit_request(&self, record: RequestRecord) {
        self.submit(SinkRecord::Request(record));
    }

    fn submit_violation(&self, record: ViolationRecord) {
        self.submit(SinkRecord::Violation(record));
    }
}

/// Handle for draining the sink at shutdown.
///
/// The worker exits once every sink clone is dropped and the queue is
/// empty; awaiting `drain` after dropping the sink flushes what remains.
pub struct SinkWorker {
    handle: JoinHandle<()>,
}

impl SinkWorker {
    pub async fn drain(self) {
        let _ = self.handle.await;
    }
}

async fn run_worker(path: PathBuf, mut rx: mpsc::Receiver<SinkRecord>) {
    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = append_line(&path, &line).await {
                    error!(error = %e, path = %path.display(), "Failed to persist record");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize record"),
        }
    }
    debug!("Record sink drained");
}

// Open per write so external rotation of the file takes effect without a
// restart.
async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
