//! # Quota Ledger Module
//!
//! This module is the client side of the authoritative quota ledger: a
//! shared Redis store holding one sorted set of millisecond timestamps per
//! quota bucket, mutated only through an atomic sliding-window script.
//!
//! ## Features
//!
//! - **Atomic check-and-admit**: One round-trip per check, executed as a
//!   server-side script (see [`redis`])
//! - **Decision caching**: A short-TTL per-instance cache in front of the
//!   store to absorb micro-bursts of identical keys (see [`cache`])
//! - **Disabled mode**: A no-op admitter used when the ledger is turned off
//!   by configuration (see [`noop`])
//!
//! Store failures are surfaced as [`StoreError`]; converting them into
//! admit verdicts (fail-open) is the quota coordinator's responsibility,
//! not this module's.

pub mod cache;
pub mod noop;
pub mod redis;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// The outcome of one dimension check against the ledger.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub admitted: bool,
    /// Requests left in the window after this check. Zero on deny.
    pub remaining: i64,
    /// Approximate end of the current window, used for advisory headers.
    pub reset_at: DateTime<Utc>,
}

impl Verdict {
    pub fn admit(remaining: i64, reset_at: DateTime<Utc>) -> Self {
        Self {
            admitted: true,
            remaining,
            reset_at,
        }
    }

    pub fn deny(reset_at: DateTime<Utc>) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            reset_at,
        }
    }
}

/// Failures talking to the ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger connection failed: {0}")]
    Connection(String),

    #[error("ledger command timed out after {0:?}")]
    Timeout(Duration),

    #[error("ledger protocol error: {0}")]
    Protocol(String),

    #[error("ledger connection pool exhausted")]
    PoolExhausted,
}

/// Compute the advisory reset instant for a window starting now.
pub(crate) fn reset_after(now_ms: i64, window: Duration) -> DateTime<Utc> {
    let reset_ms = now_ms + window.as_millis() as i64;
    DateTime::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now)
}

/// Dispatch over the configured ledger backends.
///
/// Request handling holds this behind an `Arc`; the variants share the
/// `check(key, limit, window, now_ms)` contract, with `now_ms` supplied by
/// the caller so the store never consults its own clock.
pub enum LedgerClient {
    Redis(redis::RedisLedger),
    Disabled(noop::NoopLedger),
    #[cfg(test)]
    Mock(MockLedger),
}

impl LedgerClient {
    pub async fn check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now_ms: i64,
    ) -> Result<Verdict, StoreError> {
        match self {
            LedgerClient::Redis(ledger) => ledger.check(key, limit, window, now_ms).await,
            LedgerClient::Disabled(ledger) => Ok(ledger.check(limit, window, now_ms)),
            #[cfg(test)]
            LedgerClient::Mock(ledger) => ledger.check(key, limit, window, now_ms),
        }
    }
}

/// In-memory sliding-window ledger used by tests in place of Redis.
///
/// Prunes and counts timestamps per bucket exactly like the server-side
/// script, and can be told to fail some or all keys to exercise the
/// fail-open paths.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockLedger {
    inner: std::sync::Arc<std::sync::Mutex<MockState>>,
}

#[cfg(test)]
#[derive(Default)]
struct MockState {
    buckets: std::collections::HashMap<String, Vec<i64>>,
    fail_all: bool,
    fail_keys: std::collections::HashSet<String>,
    checks: u64,
}

#[cfg(test)]
impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let ledger = Self::default();
        ledger.inner.lock().unwrap().fail_all = true;
        ledger
    }

    pub fn fail_key(&self, key: &str) {
        self.inner.lock().unwrap().fail_keys.insert(key.to_string());
    }

    /// Pre-fill a bucket as if `count` requests were admitted just now.
    pub fn seed(&self, key: &str, count: usize) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.inner.lock().unwrap();
        state
            .buckets
            .entry(key.to_string())
            .or_default()
            .extend(std::iter::repeat(now_ms).take(count));
    }

    /// Bucket cardinality as the script would observe it right now.
    pub fn cardinality(&self, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .buckets
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Total number of checks issued against this ledger.
    pub fn checks(&self) -> u64 {
        self.inner.lock().unwrap().checks
    }

    fn check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now_ms: i64,
    ) -> Result<Verdict, StoreError> {
        let mut state = self.inner.lock().unwrap();
        state.checks += 1;

        if state.fail_all || state.fail_keys.contains(key) {
            return Err(StoreError::Connection("simulated outage".to_string()));
        }

        let window_ms = window.as_millis() as i64;
        let bucket = state.buckets.entry(key.to_string()).or_default();
        bucket.retain(|&ts| ts > now_ms - window_ms);

        let reset_at = reset_after(now_ms, window);
        if (bucket.len() as i64) < limit {
            bucket.push(now_ms);
            Ok(Verdict::admit(limit - bucket.len() as i64, reset_at))
        } else {
            Ok(Verdict::deny(reset_at))
        }
    }
}
