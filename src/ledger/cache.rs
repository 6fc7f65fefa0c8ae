use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_DECISION_CACHE_TTL_MS: i64 = 1_000;

/// A memoized admit verdict. Only store-backed admits are cached; denies
/// must be re-checked so a caller recovers the moment its window slides,
/// and errors must not mask store recovery.
#[derive(Debug, Clone)]
struct CachedVerdict {
    remaining: i64,
    stored_at_ms: i64,
}

/// Per-instance short-TTL cache of quota verdicts, keyed by ledger key.
/// Damps fan-out to the store under micro-bursts of identical keys; not
/// authoritative.
#[derive(Debug)]
pub struct DecisionCache {
    entries: Arc<RwLock<HashMap<String, CachedVerdict>>>,
    ttl_ms: i64,
}

impl DecisionCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Return the cached remaining count for a fresh admit verdict, lazily
    /// deleting the entry when it has expired.
    pub async fn get(&self, key: &str, now_ms: i64) -> Option<i64> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(cached) if now_ms - cached.stored_at_ms < self.ttl_ms => {
                    return Some(cached.remaining);
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired entry: drop the read lock and evict it.
        let mut entries = self.entries.write().await;
        if let Some(cached) = entries.get(key) {
            if now_ms - cached.stored_at_ms >= self.ttl_ms {
                entries.remove(key);
            } else {
                return Some(cached.remaining);
            }
        }
        None
    }

    /// Record a store-backed admit verdict.
    pub async fn store_admit(&self, key: &str, remaining: i64, now_ms: i64) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CachedVerdict {
                remaining,
                stored_at_ms: now_ms,
            },
        );
    }

    /// Evict stragglers the lazy path has not touched. Run periodically at
    /// half the TTL by a background task.
    pub async fn sweep(&self, now_ms: i64) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, cached| now_ms - cached.stored_at_ms < self.ttl_ms);

        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, retained = entries.len(), "decision cache sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let cache = DecisionCache::new(1_000);
        cache.store_admit("source::1.2.3.4", 7, 10_000).await;

        assert_eq!(cache.get("source::1.2.3.4", 10_500).await, Some(7));
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let cache = DecisionCache::new(1_000);
        cache.store_admit("source::1.2.3.4", 7, 10_000).await;

        assert_eq!(cache.get("source::1.2.3.4", 11_000).await, None);
        // The lazy path removed the entry.
        assert_eq!(cache.entries.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = DecisionCache::new(1_000);
        assert_eq!(cache.get("route::/items/*", 0).await, None);
    }

    #[tokio::test]
    async fn test_sweep_evicts_stragglers() {
        let cache = DecisionCache::new(1_000);
        cache.store_admit("a", 1, 0).await;
        cache.store_admit("b", 2, 900).await;

        cache.sweep(1_500).await;

        let entries = cache.entries.read().await;
        assert!(!entries.contains_key("a"));
        assert!(entries.contains_key("b"));
    }
}
