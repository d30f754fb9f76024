//! Per-client sliding-window admission control.
//!
//! # Overview
//!
//! Every client key owns an ordered window of request timestamps bounded to
//! the trailing `window_seconds`. On admission the window is pruned, counted,
//! and only then extended, as one atomic unit, so concurrent callers can
//! never push a key past `max_requests` within a window.
//!
//! Two stores implement the same contract behind [`RateStore`]: an
//! in-process [`MemoryStore`] and a Redis-backed [`RedisStore`] for
//! deployments with more than one gateway replica. The store is selected
//! once at startup from configuration.

pub mod layer;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RateLimitConfig;
use crate::error::GatewayResult;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Storage contract for the sliding-window limiter.
///
/// `admit` decides and records in one step; `retry_after` reports how long
/// a denied client should wait. Both stores fail open on infrastructure
/// errors rather than turning a store outage into an outage of the gateway.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Check whether a request under `key` is admitted and record it if so.
    ///
    /// Entries older than `now - window_seconds` are discarded first; the
    /// request is denied without being recorded when the remaining count
    /// has reached `max_requests`. A `max_requests` of zero denies always.
    async fn admit(&self, key: &str, max_requests: u32, window_seconds: u64) -> bool;

    /// Seconds until the oldest window entry expires, at least 1 for a key
    /// with recorded history, 0 for a key without any.
    async fn retry_after(&self, key: &str, window_seconds: u64) -> u64;
}

/// The admission-control service handed to the HTTP layer.
///
/// Owns the selected store plus the configured limits, so call sites only
/// ever deal in client keys.
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    max_requests: u32,
    window_seconds: u64,
}

impl RateLimiter {
    /// Create a limiter over the given store and limits.
    pub fn new(store: Arc<dyn RateStore>, config: &RateLimitConfig) -> Self {
        info!(
            max_requests = config.max_requests,
            window_seconds = config.window_seconds,
            "Rate limiter configured"
        );
        Self {
            store,
            max_requests: config.max_requests,
            window_seconds: config.window_seconds,
        }
    }

    /// Admit or deny one request for `key`, recording it when admitted.
    pub async fn admit(&self, key: &str) -> bool {
        self.store
            .admit(key, self.max_requests, self.window_seconds)
            .await
    }

    /// Seconds a denied `key` should wait before retrying.
    pub async fn retry_after(&self, key: &str) -> u64 {
        self.store.retry_after(key, self.window_seconds).await
    }

    /// The configured window width in seconds.
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }
}

/// Build the store selected by configuration.
///
/// A configured Redis URL selects the distributed store; otherwise the
/// in-process store is used and its sweeper task is spawned against the
/// given shutdown token.
pub async fn build_store(
    config: &RateLimitConfig,
    shutdown: CancellationToken,
) -> GatewayResult<Arc<dyn RateStore>> {
    match &config.redis_url {
        Some(url) => {
            info!("Using Redis for rate limiting");
            let store = RedisStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory store for rate limiting");
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(config.window_seconds, shutdown);
            Ok(store)
        }
    }
}

/// Current wall-clock time as fractional seconds since the epoch.
///
/// Both stores score window entries with this clock so the retry-after
/// formula and the Redis sorted-set scores share one basis.
pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Seconds until the oldest entry leaves the window, clamped to at least 1.
pub(crate) fn retry_after_from_oldest(oldest: f64, window_seconds: u64, now: f64) -> u64 {
    let remaining = (oldest + window_seconds as f64 - now) as i64 + 1;
    remaining.max(1) as u64
}
