//! Centralized configuration for the promptgate gateway.
//!
//! Every section has defaults and can be overridden through `PROMPTGATE_*`
//! environment variables. Invalid values are logged and replaced by the
//! default rather than aborting startup; only the upstream base URL is
//! required.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

/// Parse an environment variable, falling back to the default with a
/// warning when the value does not parse.
fn parse_env_warn<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %raw,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Top-level gateway configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Sliding-window admission control.
    pub rate_limit: RateLimitConfig,
    /// Content policy.
    pub guardrail: GuardrailConfig,
    /// Generation backend client.
    pub upstream: UpstreamConfig,
    /// Request/violation persistence sink.
    pub sink: SinkConfig,
}

impl GatewayConfig {
    /// Load the full configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `PROMPTGATE_UPSTREAM_URL` is not set.
    pub fn from_env() -> GatewayResult<Self> {
        Ok(Self {
            rate_limit: RateLimitConfig::from_env(),
            guardrail: GuardrailConfig::from_env(),
            upstream: UpstreamConfig::from_env()?,
            sink: SinkConfig::from_env(),
        })
    }
}

/// Configuration for the sliding-window rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum admissions per client within one window.
    /// Zero denies every request.
    pub max_requests: u32,

    /// Window width in seconds.
    pub window_seconds: u64,

    /// Connection string for the shared Redis store. Present selects the
    /// distributed store; absent selects the in-process store.
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_seconds: 60,
            redis_url: None,
        }
    }
}

impl RateLimitConfig {
    /// Load configuration from environment variables.
    ///
    /// - `PROMPTGATE_RATE_LIMIT_MAX_REQUESTS` (default: 10)
    /// - `PROMPTGATE_RATE_LIMIT_WINDOW_SECS` (default: 60)
    /// - `PROMPTGATE_REDIS_URL` (default: unset, in-process store)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_requests: parse_env_warn(
                "PROMPTGATE_RATE_LIMIT_MAX_REQUESTS",
                default.max_requests,
            ),
            window_seconds: parse_env_warn(
                "PROMPTGATE_RATE_LIMIT_WINDOW_SECS",
                default.window_seconds,
            ),
            redis_url: std::env::var("PROMPTGATE_REDIS_URL")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Configuration for the guardrail validator.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// Maximum message length in characters. Messages at exactly this
    /// length pass.
    pub max_input_length: usize,

    /// Blocked keywords, scanned in order. Matching is case-insensitive
    /// and whole-word.
    pub blocked_keywords: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_input_length: 5000,
            blocked_keywords: vec!["secret_key".to_string(), "internal_only".to_string()],
        }
    }
}

impl GuardrailConfig {
    /// Load configuration from environment variables.
    ///
    /// - `PROMPTGATE_MAX_INPUT_LENGTH` (default: 5000)
    /// - `PROMPTGATE_BLOCKED_KEYWORDS` (comma-separated,
    ///   default: `secret_key,internal_only`)
    pub fn from_env() -> Self {
        let default = Self::default();

        let blocked_keywords = match std::env::var("PROMPTGATE_BLOCKED_KEYWORDS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => default.blocked_keywords,
        };

        Self {
            max_input_length: parse_env_warn("PROMPTGATE_MAX_INPUT_LENGTH", default.max_input_length),
            blocked_keywords,
        }
    }
}

/// Configuration for the generation backend client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible backend (e.g. "http://localhost:8000").
    pub base_url: String,

    /// Model identifier sent with every request.
    pub model: String,

    /// Bearer token for the backend, if it requires one.
    pub api_key: Option<String>,

    /// Total request timeout, including streamed body delivery.
    pub timeout: Duration,

    /// Connection timeout (TCP + TLS handshake).
    pub connect_timeout: Duration,

    /// Maximum idle connections kept per host.
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout.
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: "gemini-3-flash".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl UpstreamConfig {
    /// Load configuration from environment variables.
    ///
    /// - `PROMPTGATE_UPSTREAM_URL` (required)
    /// - `PROMPTGATE_UPSTREAM_MODEL` (default: "gemini-3-flash")
    /// - `PROMPTGATE_UPSTREAM_API_KEY` (default: unset)
    /// - `PROMPTGATE_UPSTREAM_TIMEOUT_SECS` (default: 120)
    /// - `PROMPTGATE_UPSTREAM_CONNECT_TIMEOUT_SECS` (default: 5)
    ///
    /// # Errors
    ///
    /// Returns an error if `PROMPTGATE_UPSTREAM_URL` is not set.
    pub fn from_env() -> GatewayResult<Self> {
        let default = Self::default();

        let base_url =
            std::env::var("PROMPTGATE_UPSTREAM_URL").map_err(|_| GatewayError::Internal {
                reason: "PROMPTGATE_UPSTREAM_URL environment variable is required".to_string(),
            })?;

        Ok(Self {
            base_url,
            model: std::env::var("PROMPTGATE_UPSTREAM_MODEL").unwrap_or(default.model),
            api_key: std::env::var("PROMPTGATE_UPSTREAM_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            timeout: Duration::from_secs(parse_env_warn(
                "PROMPTGATE_UPSTREAM_TIMEOUT_SECS",
                default.timeout.as_secs(),
            )),
            connect_timeout: Duration::from_secs(parse_env_warn(
                "PROMPTGATE_UPSTREAM_CONNECT_TIMEOUT_SECS",
                default.connect_timeout.as_secs(),
            )),
            ..default
        })
    }

    /// Create a config with the given base URL and defaults for the rest.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Configuration for the persistence sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Path of the JSON-lines record file.
    pub path: PathBuf,

    /// Capacity of the hand-off channel to the sink worker. Records are
    /// dropped with a warning when the channel is full.
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("promptgate-requests.jsonl"),
            channel_capacity: 1024,
        }
    }
}

impl SinkConfig {
    /// Load configuration from environment variables.
    ///
    /// - `PROMPTGATE_LOG_PATH` (default: "promptgate-requests.jsonl")
    /// - `PROMPTGATE_LOG_CHANNEL_CAPACITY` (default: 1024)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            path: std::env::var("PROMPTGATE_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.path),
            channel_capacity: parse_env_warn(
                "PROMPTGATE_LOG_CHANNEL_CAPACITY",
                default.channel_capacity,
            ),
        }
    }
}
