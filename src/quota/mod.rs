//! # Quota Coordinator Module
//!
//! For one classified request, this module composes the set of quota
//! dimensions to check (source, route, source×route), fans the checks out
//! to the ledger in parallel under a shared deadline, and aggregates the
//! per-dimension verdicts into a single admit/deny decision.
//!
//! ## Aggregation Rules
//!
//! - Any deny wins; ties break in the fixed order source → route →
//!   source×route and the denying dimension is attached for logging and
//!   metrics
//! - All admits produce an admit whose advisory counters use the minimum
//!   remaining and the earliest reset across dimensions
//! - A store error in any dimension without a deny produces an admit
//!   (fail-open); the error is logged and counted
//!
//! This is the only place request handling introduces concurrency.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ProxyConfig;
use crate::ledger::{LedgerClient, StoreError, Verdict, cache::DecisionCache, reset_after};
use crate::metrics::Metrics;

/// Shared deadline for the parallel dimension checks. Expiry is treated as
/// a store error for the affected dimension, which fails open.
pub const CHECK_DEADLINE: Duration = Duration::from_secs(1);

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// One of the three quota axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Source,
    Route,
    SourceRoute,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Source => "source",
            Dimension::Route => "route",
            Dimension::SourceRoute => "source_route",
        }
    }
}

/// A quota bucket identity, serialized to the stable string the ledger
/// keys its sorted sets by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionKey {
    dimension: Dimension,
    key: String,
}

impl DimensionKey {
    pub fn source(source: &str) -> Self {
        Self {
            dimension: Dimension::Source,
            key: format!("source::{source}"),
        }
    }

    pub fn route(route: &str) -> Self {
        Self {
            dimension: Dimension::Route,
            key: format!("route::{route}"),
        }
    }

    pub fn source_route(source: &str, route: &str) -> Self {
        Self {
            dimension: Dimension::SourceRoute,
            key: format!("source_route::{source}::{route}"),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

/// The limit applied to one dimension for the configured window.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub limit: i64,
    pub window: Duration,
}

/// The coordinator's aggregate answer for one request.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub admitted: bool,
    /// Advisory limit: the denying dimension's limit on deny, the minimum
    /// limit across dimensions on admit.
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub denied_by: Option<DimensionKey>,
    pub store_errors: u32,
}

impl QuotaDecision {
    /// Seconds until the window resets, floored at 1 for `Retry-After`.
    pub fn retry_after_secs(&self) -> i64 {
        (self.reset_at - Utc::now()).num_seconds().max(1)
    }
}

pub struct QuotaCoordinator {
    ledger: Arc<LedgerClient>,
    cache: Arc<DecisionCache>,
    config: Arc<ProxyConfig>,
    metrics: Arc<Metrics>,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

impl QuotaCoordinator {
    pub fn new(
        ledger: Arc<LedgerClient>,
        cache: Arc<DecisionCache>,
        config: Arc<ProxyConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ledger,
            cache,
            config,
            metrics,
        }
    }

    /// Check every dimension for one request and aggregate the verdicts.
    pub async fn check(&self, source: &str, route: &str) -> QuotaDecision {
        let now_ms = Utc::now().timestamp_millis();

        let dimensions = [
            (DimensionKey::source(source), self.source_policy(source)),
            (DimensionKey::route(route), self.route_policy(route)),
            (
                DimensionKey::source_route(source, route),
                self.source_route_policy(source, route),
            ),
        ];

        let mut handles = Vec::with_capacity(dimensions.len());
        for (key, policy) in &dimensions {
            let ledger = Arc::clone(&self.ledger);
            let cache = Arc::clone(&self.cache);
            let key = key.as_str().to_string();
            let policy = policy.clone();

            handles.push(tokio::spawn(async move {
                match tokio::time::timeout(
                    CHECK_DEADLINE,
                    check_dimension(ledger, cache, key, policy, now_ms),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(CHECK_DEADLINE)),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(StoreError::Protocol(format!("check task failed: {e}"))),
            });
        }

        self.aggregate(&dimensions, results, now_ms)
    }

    fn source_policy(&self, source: &str) -> QuotaPolicy {
        QuotaPolicy {
            limit: self
                .config
                .source_limits
                .get(source)
                .copied()
                .unwrap_or(self.config.default_limit),
            window: self.config.window,
        }
    }

    fn route_policy(&self, route: &str) -> QuotaPolicy {
        QuotaPolicy {
            limit: self
                .config
                .route_limits
                .get(route)
                .copied()
                .unwrap_or(self.config.default_limit),
            window: self.config.window,
        }
    }

    fn source_route_policy(&self, source: &str, route: &str) -> QuotaPolicy {
        let override_key = format!("{source}::{route}");
        QuotaPolicy {
            // The combined dimension defaults to half the general limit.
            limit: self
                .config
                .source_route_limits
                .get(&override_key)
                .copied()
                .unwrap_or((self.config.default_limit / 2).max(1)),
            window: self.config.window,
        }
    }

    fn aggregate(
        &self,
        dimensions: &[(DimensionKey, QuotaPolicy); 3],
        results: Vec<Result<Verdict, StoreError>>,
        now_ms: i64,
    ) -> QuotaDecision {
        let mut min_remaining: Option<i64> = None;
        let mut min_limit: Option<i64> = None;
        let mut earliest_reset: Option<DateTime<Utc>> = None;
        let mut denied: Option<(DimensionKey, i64, Verdict)> = None;
        let mut store_errors = 0u32;

        for ((key, policy), result) in dimensions.iter().zip(results) {
            match result {
                Ok(verdict) if !verdict.admitted => {
                    if denied.is_none() {
                        denied = Some((key.clone(), policy.limit, verdict));
                    }
                }
                Ok(verdict) => {
                    min_remaining =
                        Some(min_remaining.map_or(verdict.remaining, |m| m.min(verdict.remaining)));
                    min_limit = Some(min_limit.map_or(policy.limit, |m| m.min(policy.limit)));
                    earliest_reset =
                        Some(earliest_reset.map_or(verdict.reset_at, |r| r.min(verdict.reset_at)));
                }
                Err(e) => {
                    store_errors += 1;
                    self.metrics.store_errors_total.inc();
                    warn!(key = key.as_str(), error = %e, "ledger check failed, failing open");
                }
            }
        }

        if let Some((key, limit, verdict)) = denied {
            return QuotaDecision {
                admitted: false,
                limit,
                remaining: 0,
                reset_at: verdict.reset_at,
                denied_by: Some(key),
                store_errors,
            };
        }

        // Admit. With no successful verdict at all this is the synthetic
        // fail-open admit.
        let fallback_limit = dimensions
            .iter()
            .map(|(_, policy)| policy.limit)
            .min()
            .unwrap_or(self.config.default_limit);

        QuotaDecision {
            admitted: true,
            limit: min_limit.unwrap_or(fallback_limit),
            remaining: min_remaining.unwrap_or(fallback_limit - 1),
            reset_at: earliest_reset.unwrap_or_else(|| reset_after(now_ms, self.config.window)),
            denied_by: None,
            store_errors,
        }
    }
}

/// One dimension's check: consult the decision cache, then the ledger.
/// Only store-backed admits are written back to the cache.
async fn check_dimension(
    ledger: Arc<LedgerClient>,
    cache: Arc<DecisionCache>,
    key: String,
    policy: QuotaPolicy,
    now_ms: i64,
) -> Result<Verdict, StoreError> {
    if let Some(remaining) = cache.get(&key, now_ms).await {
        return Ok(Verdict::admit(remaining, reset_after(now_ms, policy.window)));
    }

    let verdict = ledger
        .check(&key, policy.limit, policy.window, now_ms)
        .await?;
    if verdict.admitted {
        cache.store_admit(&key, verdict.remaining, now_ms).await;
    }
    Ok(verdict)
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
