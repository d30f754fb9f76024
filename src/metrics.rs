//! Prometheus metrics for the gateway.
//!
//! All metric names use the "promptgate_" prefix per Prometheus naming
//! conventions. The registry is owned by [`GatewayMetrics`] rather than the
//! process-wide default so tests can build isolated instances.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Request duration buckets in seconds, sized for LLM latencies.
const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Counters and histograms covering the admission path and the upstream.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    /// Completed HTTP requests by route and status code.
    pub http_requests_total: IntCounterVec,
    /// End-to-end request latency by route.
    pub request_duration_seconds: HistogramVec,
    /// Requests denied by the rate limiter.
    pub rate_limit_denials_total: IntCounter,
    /// Requests rejected by the guardrail, by violation kind.
    pub guardrail_blocks_total: IntCounterVec,
    /// Upstream call failures by error type.
    pub upstream_failures_total: IntCounterVec,
    /// Stream chunk events delivered to clients.
    pub stream_chunks_total: IntCounter,
    /// Records dropped because the persistence queue was full.
    pub sink_records_dropped_total: IntCounter,
}

impl GatewayMetrics {
    /// Create and register all metrics against a fresh registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "promptgate_http_requests_total",
                "Completed HTTP requests by route and status code",
            ),
            &["route", "status"],
        )
        .expect("BUG: http_requests_total descriptor is valid");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "promptgate_request_duration_seconds",
                "End-to-end request latency in seconds",
            )
            .buckets(REQUEST_DURATION_BUCKETS.to_vec()),
            &["route"],
        )
        .expect("BUG: request_duration_seconds descriptor is valid");

        let rate_limit_denials_total = IntCounter::new(
            "promptgate_rate_limit_denials_total",
            "Requests denied by the rate limiter",
        )
        .expect("BUG: rate_limit_denials_total descriptor is valid");

        let guardrail_blocks_total = IntCounterVec::new(
            Opts::new(
                "promptgate_guardrail_blocks_total",
                "Requests rejected by the guardrail, by violation kind",
            ),
            &["kind"],
        )
        .expect("BUG: guardrail_blocks_total descriptor is valid");

        let upstream_failures_total = IntCounterVec::new(
            Opts::new(
                "promptgate_upstream_failures_total",
                "Upstream call failures by error type",
            ),
            &["error_type"],
        )
        .expect("BUG: upstream_failures_total descriptor is valid");

        let stream_chunks_total = IntCounter::new(
            "promptgate_stream_chunks_total",
            "Stream chunk events delivered to clients",
        )
        .expect("BUG: stream_chunks_total descriptor is valid");

        let sink_records_dropped_total = IntCounter::new(
            "promptgate_sink_records_dropped_total",
            "Records dropped because the persistence queue was full",
        )
        .expect("BUG: sink_records_dropped_total descriptor is valid");

        for collector in [
            Box::new(http_requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(rate_limit_denials_total.clone()),
            Box::new(guardrail_blocks_total.clone()),
            Box::new(upstream_failures_total.clone()),
            Box::new(stream_chunks_total.clone()),
            Box::new(sink_records_dropped_total.clone()),
        ] {
            registry
                .register(collector)
                .expect("BUG: metric names are unique within the registry");
        }

        Self {
            registry,
            http_requests_total,
            request_duration_seconds,
            rate_limit_denials_total,
            guardrail_blocks_total,
            upstream_failures_total,
            stream_chunks_total,
            sink_records_dropped_total,
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, route: &str, status: u16) {
        self.http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Record end-to-end request duration.
    pub fn record_request_duration(&self, route: &str, seconds: f64) {
        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(seconds);
    }

    /// Record a rate limit denial.
    pub fn record_rate_limit_denial(&self) {
        self.rate_limit_denials_total.inc();
    }

    /// Record a guardrail rejection.
    pub fn record_guardrail_block(&self, kind: &str) {
        self.guardrail_blocks_total.with_label_values(&[kind]).inc();
    }

    /// Record an upstream failure.
    pub fn record_upstream_failure(&self, error_type: &str) {
        self.upstream_failures_total
            .with_label_values(&[error_type])
            .inc();
    }

    /// Record one chunk event delivered to a streaming client.
    pub fn record_stream_chunk(&self) {
        self.stream_chunks_total.inc();
    }

    /// Record a dropped persistence record.
    pub fn record_sink_drop(&self) {
        self.sink_records_dropped_total.inc();
    }

    /// Render all registered metrics in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let metrics = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
