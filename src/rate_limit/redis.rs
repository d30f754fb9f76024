//! Redis-backed sliding-window store for multi-replica deployments.
//!
//! Window state lives in one sorted set per client key, scored by the
//! request's epoch timestamp. Prune, count, and record run inside a single
//! server-evaluated Lua script so concurrent replicas cannot interleave
//! between the check and the write. Store errors fail open: an unreachable
//! Redis admits traffic instead of refusing it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::warn;

use super::{epoch_seconds, retry_after_from_oldest, RateStore};
use crate::error::{GatewayError, GatewayResult};

/// Namespace for limiter keys, kept apart from anything else in the
/// database.
const KEY_PREFIX: &str = "rate_limit";

/// Atomic prune-count-record over one sorted set.
///
/// KEYS[1]  sorted set for the client key
/// ARGV[1]  current time, fractional epoch seconds
/// ARGV[2]  window width in seconds
/// ARGV[3]  maximum requests per window
/// ARGV[4]  unique member for this request
///
/// Returns 1 when admitted, 0 when denied. Denials leave the set
/// untouched. The TTL bounds how long an idle key survives.
static SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= max_requests then
    return 0
end

redis.call('ZADD', key, now, ARGV[4])
redis.call('EXPIRE', key, window)
return 1
"#;

/// Shared window state behind a multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to the given Redis URL and verify the connection works.
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url).map_err(|e| GatewayError::Internal {
            reason: format!("invalid Redis URL: {e}"),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Internal {
                reason: format!("Redis connection failed: {e}"),
            })?;
        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    fn window_key(key: &str) -> String {
        format!("{KEY_PREFIX}:{key}")
    }
}

#[async_trait]
impl RateStore for RedisStore {
    async fn admit(&self, key: &str, max_requests: u32, window_seconds: u64) -> bool {
        let now = epoch_seconds();
        // Scores can collide across replicas; the member must not.
        let member = format!("{now}:{}", uuid::Uuid::new_v4());
        let mut conn = self.conn.clone();

        let result: Result<i64, redis::RedisError> = self
            .script
            .key(Self::window_key(key))
            .arg(now)
            .arg(window_seconds)
            .arg(max_requests)
            .arg(member)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(admitted) => admitted == 1,
            Err(e) => {
                warn!(error = %e, client = key, "Rate limit store unavailable, admitting request");
                true
            }
        }
    }

    async fn retry_after(&self, key: &str, window_seconds: u64) -> u64 {
        let mut conn = self.conn.clone();
        let result: Result<Vec<(String, f64)>, redis::RedisError> = redis::cmd("ZRANGE")
            .arg(Self::window_key(key))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(entries) => match entries.first() {
                Some((_, oldest)) => {
                    retry_after_from_oldest(*oldest, window_seconds, epoch_seconds())
                }
                None => 0,
            },
            Err(e) => {
                warn!(error = %e, client = key, "Rate limit store unavailable, skipping retry hint");
                0
            }
        }
    }
}
