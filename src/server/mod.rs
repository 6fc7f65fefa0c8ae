//! # Admission Front-End Module
//!
//! The public HTTP surface of the proxy: the health and status endpoints
//! plus the admission path that composes classification, quota
//! coordination, upstream forwarding and metric emission for every other
//! request.
//!
//! ## Request Flow
//!
//! 1. Record arrival (in-progress gauge, timer, structured log)
//! 2. Classify the request (source identity, route class)
//! 3. Bypass requests skip quota entirely and forward with the prefix
//!    stripped; everything else asks the quota coordinator for a verdict
//! 4. Admit: forward upstream and attach advisory rate-limit headers.
//!    Deny: reply 429 with advisory headers and `Retry-After`
//! 5. Emit one request event and one quota event to the async collector

pub mod shutdown;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::classify;
use crate::config::ProxyConfig;
use crate::metrics::{Metrics, collector::MetricsRecorder};
use crate::proxy::{self, UpstreamProxy};
use crate::quota::{QuotaCoordinator, QuotaDecision};

const RATE_LIMITED_BODY: &str = r#"{"error":"rate_limit_exceeded","message":"Too many requests"}"#;

/// Application state shared across handlers. Every field is a process-wide
/// singleton constructed at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub coordinator: Arc<QuotaCoordinator>,
    pub proxy: Arc<UpstreamProxy>,
    pub recorder: MetricsRecorder,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .fallback(admission_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Everything that is not a reserved endpoint flows through here.
async fn admission_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    let started = Instant::now();
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let source = classify::extract_source(req.headers(), peer);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    info!(
        method = %method,
        path = %path,
        source = %source,
        user_agent = %user_agent,
        "incoming request"
    );

    // The bypass namespace forwards with the prefix stripped and without
    // consulting the coordinator at all.
    if let Some(stripped) = proxy::strip_bypass_prefix(&path) {
        let route_class = proxy::NO_RATELIMIT_ROUTE_CLASS;
        let rewritten = match req.uri().query() {
            Some(query) => format!("{stripped}?{query}"),
            None => stripped.to_string(),
        };
        if let Ok(uri) = rewritten.parse() {
            *req.uri_mut() = uri;
        }

        let in_progress = state
            .metrics
            .requests_in_progress
            .with_label_values(&[&method, route_class]);
        in_progress.inc();

        let response = state.proxy.forward(req).await;

        in_progress.dec();
        state.recorder.record_request(
            &method,
            route_class,
            response.status().as_u16(),
            started.elapsed(),
        );
        return response;
    }

    let route_class = classify::normalize_route(&path);
    let in_progress = state
        .metrics
        .requests_in_progress
        .with_label_values(&[&method, &route_class]);
    in_progress.inc();

    let decision = state.coordinator.check(&source, &route_class).await;
    if decision.store_errors > 0 {
        debug!(
            store_errors = decision.store_errors,
            source = %source,
            path = %route_class,
            "quota verdict degraded by ledger errors"
        );
    }

    match &decision.denied_by {
        Some(key) => {
            warn!(
                limit_type = key.dimension().as_str(),
                key = key.as_str(),
                source = %source,
                path = %route_class,
                "rate limit exceeded"
            );
            state
                .recorder
                .record_quota(key.dimension().as_str(), key.as_str(), false);
        }
        None => {
            let combined = format!("{source}:{route_class}");
            state.recorder.record_quota("combined", &combined, true);
        }
    }

    let response = if decision.admitted {
        let mut response = state.proxy.forward(req).await;
        apply_advisory_headers(&mut response, &decision);
        response
    } else {
        rate_limited_response(&decision)
    };

    in_progress.dec();
    state.recorder.record_request(
        &method,
        &route_class,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

/// Advisory headers on forwarded responses: the most restrictive remaining
/// count and the earliest reset across the checked dimensions.
fn apply_advisory_headers(response: &mut Response, decision: &QuotaDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = decision.reset_at.timestamp().to_string().parse() {
        headers.insert("x-ratelimit-reset", value);
    }
}

fn rate_limited_response(decision: &QuotaDecision) -> Response {
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-ratelimit-limit", decision.limit.to_string())
        .header("x-ratelimit-remaining", decision.remaining.to_string())
        .header("x-ratelimit-reset", decision.reset_at.timestamp().to_string())
        .header("retry-after", decision.retry_after_secs().to_string())
        .body(Body::from(RATE_LIMITED_BODY))
        .unwrap()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed();
    let runtime_metrics = tokio::runtime::Handle::current().metrics();

    Json(json!({
        "status": "healthy",
        "service": "quotagate",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format!("{uptime:.1?}"),
        "upstream_url": state.config.upstream_url,
        "system": {
            "worker_threads": runtime_metrics.num_workers(),
            "cpu_count": std::thread::available_parallelism().map_or(1, |n| n.get()),
            "memory_mb": resident_memory_mb(),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format!("{:.1?}", state.started_at.elapsed()),
        "service": "quotagate",
    }))
}

fn resident_memory_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Some(resident_pages) = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
        {
            return resident_pages * 4096 / (1024 * 1024);
        }
    }
    0
}
