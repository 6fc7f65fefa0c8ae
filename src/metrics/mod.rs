//! # Metrics Module
//!
//! Process-wide counter registry and its scrape surface. All metric
//! families carry the stable `quotagate_` prefix and are registered into
//! one explicit [`prometheus::Registry`] owned by [`Metrics`]; there is no
//! hidden module-level state. The hot path never touches this module
//! directly except for the in-progress gauge and the store-error counter,
//! both single atomic operations; everything else flows through the async
//! collector in [`collector`].

pub mod collector;

use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::error;

/// Every metric family exposed by the proxy.
pub struct Metrics {
    registry: Registry,
    /// Total requests by method, route class and status.
    pub requests_total: IntCounterVec,
    /// Requests blocked by quota, by dimension kind and bucket key.
    pub rate_limit_blocked_total: IntCounterVec,
    /// Request duration histogram by method, route class and status.
    pub request_duration_seconds: HistogramVec,
    /// Requests currently being processed.
    pub requests_in_progress: IntGaugeVec,
    /// Recent per-route-class request rate.
    pub requests_per_second: GaugeVec,
    /// Metric events dropped because the pipeline queue was full.
    pub dropped_events_total: IntCounter,
    /// Ledger failures converted into fail-open admits.
    pub store_errors_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("quotagate_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let rate_limit_blocked_total = IntCounterVec::new(
            Opts::new(
                "quotagate_rate_limit_blocked_total",
                "Total number of requests blocked by rate limiting",
            ),
            &["limit_type", "key"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "quotagate_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "path", "status"],
        )?;
        let requests_in_progress = IntGaugeVec::new(
            Opts::new(
                "quotagate_requests_in_progress",
                "Number of HTTP requests currently being processed",
            ),
            &["method", "path"],
        )?;
        let requests_per_second = GaugeVec::new(
            Opts::new(
                "quotagate_requests_per_second",
                "Current requests per second",
            ),
            &["path"],
        )?;
        let dropped_events_total = IntCounter::new(
            "quotagate_dropped_events_total",
            "Metric events dropped because the collector queue was full",
        )?;
        let store_errors_total = IntCounter::new(
            "quotagate_store_errors_total",
            "Quota ledger errors handled by failing open",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(rate_limit_blocked_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(requests_in_progress.clone()))?;
        registry.register(Box::new(requests_per_second.clone()))?;
        registry.register(Box::new(dropped_events_total.clone()))?;
        registry.register(Box::new(store_errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            rate_limit_blocked_total,
            request_duration_seconds,
            requests_in_progress,
            requests_per_second,
            dropped_events_total,
            store_errors_total,
        })
    }

    /// Render the registry in the text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Router for the dedicated metrics listener: the scrape endpoint plus a
/// plain-text liveness probe.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(scrape_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(metrics)
}

async fn scrape_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.encode(),
    )
}
