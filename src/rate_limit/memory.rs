//! In-process sliding-window store backed by a concurrent map.
//!
//! Suitable for a single gateway instance. Each client key maps to the
//! timestamps of its admitted requests; the per-key shard lock makes the
//! prune/count/record sequence atomic without a global mutex. A background
//! sweeper evicts keys that have gone idle for a full window so the map
//! does not grow with one entry per client ever seen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{epoch_seconds, retry_after_from_oldest, RateStore};

/// Sliding-window state for every active client key.
#[derive(Default)]
pub struct MemoryStore {
    windows: DashMap<String, Vec<f64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of client keys currently holding window state.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Evict entries older than the window and drop keys left empty.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, window_seconds: u64) -> usize {
        let cutoff = epoch_seconds() - window_seconds as f64;
        let before = self.windows.len();
        self.windows.retain(|_, entries| {
            entries.retain(|&ts| ts > cutoff);
            !entries.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Spawn a background task that sweeps idle keys until shutdown.
    ///
    /// Runs at half the window width so a key is dropped at most one and a
    /// half windows after its last request.
    pub fn spawn_sweeper(self: &Arc<Self>, window_seconds: u64, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        let period = Duration::from_secs((window_seconds / 2).max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = store.sweep(window_seconds);
                        if removed > 0 {
                            debug!(removed, "Swept idle rate limit keys");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Rate limit sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn admit(&self, key: &str, max_requests: u32, window_seconds: u64) -> bool {
        let now = epoch_seconds();
        let cutoff = now - window_seconds as f64;

        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.retain(|&ts| ts > cutoff);

        let admitted = (entry.len() as u32) < max_requests;
        if admitted {
            entry.push(now);
        }
        let left_empty = entry.is_empty();
        drop(entry);

        // A denied or fully pruned key must not linger as empty state.
        if left_empty {
            self.windows.remove_if(key, |_, entries| entries.is_empty());
        }
        admitted
    }

    async fn retry_after(&self, key: &str, window_seconds: u64) -> u64 {
        let Some(entry) = self.windows.get(key) else {
            return 0;
        };
        let oldest = entry.iter().copied().fold(f64::INFINITY, f64::min);
        drop(entry);
        if !oldest.is_finite() {
            return 0;
        }
        retry_after_from_oldest(oldest, window_seconds, epoch_seconds())
    }
}
