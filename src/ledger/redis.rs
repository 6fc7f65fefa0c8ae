//! Redis-backed sliding-window ledger client.
//!
//! One atomic script execution per check: prune expired members, count,
//! conditionally insert, refresh the bucket TTL. Connection-pooled and
//! tuned for sub-second tail latency with a small bounded retry.

use deadpool_redis::{
    Config, Pool, PoolConfig, Runtime,
    redis::{Script, cmd},
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{StoreError, Verdict, reset_after};

/// Per-command deadline. Keeps one slow ledger node from stalling the
/// admission path.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Retries after the first attempt.
const MAX_RETRIES: u32 = 2;

/// Base delay for the exponential retry backoff.
const RETRY_BACKOFF: Duration = Duration::from_millis(8);

/// Atomic sliding-window check-and-admit.
///
/// KEYS[1] bucket key, ARGV[1] window in ms, ARGV[2] limit, ARGV[3] now in
/// ms, ARGV[4] unique member payload. Returns {admitted, remaining}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local current = redis.call('ZCARD', key)

if current < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('EXPIRE', key, math.ceil(window / 1000) + 1)
    return {1, limit - current - 1}
else
    return {0, 0}
end
"#;

pub struct RedisLedger {
    pool: Pool,
    script: Script,
}

impl RedisLedger {
    /// Connect to the ledger and verify reachability with a ping.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let mut config = Config::from_url(url);
        config.pool = Some(PoolConfig::new(pool_size));

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(pool_size, "quota ledger connected");

        Ok(Self {
            pool,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    /// Run the atomic check for one bucket.
    ///
    /// `now_ms` is supplied by the caller in the same units as bucket
    /// scores; the store never consults its own clock.
    pub async fn check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now_ms: i64,
    ) -> Result<Verdict, StoreError> {
        let tagged = hash_tagged(key);
        let window_ms = window.as_millis() as i64;
        let member = Uuid::new_v4().to_string();

        let mut last_error = StoreError::PoolExhausted;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                debug!(key, attempt, ?backoff, "retrying ledger check");
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(
                COMMAND_TIMEOUT,
                self.eval(&tagged, window_ms, limit, now_ms, &member),
            )
            .await
            {
                Ok(Ok((admitted, remaining))) => {
                    let reset_at = reset_after(now_ms, window);
                    return Ok(if admitted == 1 {
                        Verdict::admit(remaining, reset_at)
                    } else {
                        Verdict::deny(reset_at)
                    });
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = StoreError::Timeout(COMMAND_TIMEOUT),
            }
        }

        warn!(key, error = %last_error, "ledger check failed after retries");
        Err(last_error)
    }

    async fn eval(
        &self,
        key: &str,
        window_ms: i64,
        limit: i64,
        now_ms: i64,
        member: &str,
    ) -> Result<(i64, i64), StoreError> {
        let mut conn = self.pool.get().await.map_err(|e| match e {
            deadpool_redis::PoolError::Timeout(_) => StoreError::PoolExhausted,
            other => StoreError::Connection(other.to_string()),
        })?;

        self.script
            .key(key)
            .arg(window_ms)
            .arg(limit)
            .arg(now_ms)
            .arg(member)
            .invoke_async::<(i64, i64)>(&mut *conn)
            .await
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() {
                    StoreError::Connection(e.to_string())
                } else {
                    StoreError::Protocol(e.to_string())
                }
            })
    }
}

/// Prepend a cluster hash tag derived from the key's base identity so that
/// all buckets for one caller land on the same shard. Bucket keys are
/// `kind::payload[::payload]`; the first payload component is the base
/// identity (the caller for source-scoped kinds, the route class for the
/// route kind). Benign on single-node deployments.
fn hash_tagged(key: &str) -> String {
    match key.splitn(3, "::").nth(1) {
        Some(base) if !base.is_empty() => format!("{{{}}}:{}", base, key),
        _ => key.to_string(),
    }
}
