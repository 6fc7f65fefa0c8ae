//! module structure:
//! classify
//! config
//! ledger
//! metrics
//! proxy
//! quota
//! server
//! main.rs

mod classify;
mod config;
mod ledger;
mod metrics;
mod proxy;
mod quota;
mod server;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use ledger::{
    LedgerClient,
    cache::{DEFAULT_DECISION_CACHE_TTL_MS, DecisionCache},
    noop::NoopLedger,
    redis::RedisLedger,
};
use metrics::{Metrics, collector::MetricsCollector};
use proxy::UpstreamProxy;
use quota::QuotaCoordinator;
use server::{
    AppState,
    shutdown::{ShutdownAwareTask, ShutdownCoordinator},
};

/// Bound on how long shutdown waits for in-flight work and the metrics
/// drain after the listeners stop accepting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize tracing before anything else so startup validation is
    // visible.
    let log_filter = std::env::var("QUOTAGATE_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "quotagate=info,tower_http=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting quotagate");

    let config = Arc::new(config::get_config());

    let metrics = Arc::new(Metrics::new().expect("failed to build metrics registry"));

    let ledger = if config.redis_enabled {
        match RedisLedger::connect(&config.redis_url, config.redis_pool_size).await {
            Ok(ledger) => LedgerClient::Redis(ledger),
            Err(e) => {
                error!(error = %e, "failed to connect to quota ledger");
                std::process::exit(1);
            }
        }
    } else {
        warn!("quota ledger disabled, every request will be admitted");
        LedgerClient::Disabled(NoopLedger::new())
    };

    let decision_cache = Arc::new(DecisionCache::new(DEFAULT_DECISION_CACHE_TTL_MS));
    let coordinator = Arc::new(QuotaCoordinator::new(
        Arc::new(ledger),
        decision_cache.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let upstream_proxy = Arc::new(
        UpstreamProxy::new(&config.upstream_url).expect("failed to build upstream transport"),
    );

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let (recorder, collector_handle) = MetricsCollector::spawn(metrics.clone(), shutdown.subscribe());

    // Sweep decision-cache stragglers at half the TTL.
    {
        let decision_cache = decision_cache.clone();
        let mut task = ShutdownAwareTask::new(&shutdown);
        let interval = Duration::from_millis((decision_cache.ttl_ms() / 2).max(1) as u64);
        tokio::spawn(async move {
            loop {
                if task.wait_or_shutdown(interval).await {
                    break;
                }
                decision_cache
                    .sweep(chrono::Utc::now().timestamp_millis())
                    .await;
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        coordinator,
        proxy: upstream_proxy,
        recorder,
        metrics: metrics.clone(),
        started_at: Instant::now(),
    };
    let app = server::create_router(state);
    let metrics_app = metrics::metrics_router(metrics.clone());

    let metrics_listener = tokio::net::TcpListener::bind(config.metrics_bind_address)
        .await
        .expect("failed to bind metrics listener");
    info!(address = %config.metrics_bind_address, "metrics server listening");

    let mut metrics_shutdown = shutdown.subscribe();
    let metrics_server = tokio::spawn(async move {
        let server = axum::serve(metrics_listener, metrics_app).with_graceful_shutdown(async move {
            metrics_shutdown.recv().await.ok();
        });
        if let Err(e) = server.await {
            error!("metrics server error: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .expect("failed to bind inbound listener");
    info!(
        address = %config.bind_address,
        upstream = %config.upstream_url,
        "quotagate listening"
    );

    let signal_waiter = shutdown.clone();
    tokio::spawn(async move {
        signal_waiter.wait_for_shutdown_signal().await;
    });

    let mut server_shutdown = shutdown.subscribe();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        server_shutdown.recv().await.ok();
    });
    if let Err(e) = server.await {
        error!("server error: {}", e);
    }

    // The server can also return on a listener error; make sure the rest
    // of the process tears down either way.
    if !shutdown.is_shutdown_initiated() {
        warn!("server stopped without a shutdown signal");
    }
    shutdown.initiate_shutdown();

    info!("draining metrics and background tasks");
    let drain = async {
        let _ = metrics_server.await;
        let _ = collector_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed before all tasks finished");
    }

    info!("quotagate shutdown complete");
}
