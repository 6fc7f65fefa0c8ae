//! End-to-end scenarios driving the real router and proxy over local
//! servers, with the scripted in-memory ledger standing in for Redis.

use axum::{
    Router,
    body::Body,
    extract::Request,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ProxyConfig;
use crate::ledger::{LedgerClient, MockLedger, cache::DecisionCache};
use crate::metrics::{Metrics, collector::MetricsCollector};
use crate::proxy::UpstreamProxy;
use crate::quota::QuotaCoordinator;
use crate::server::{self, AppState, shutdown::ShutdownCoordinator};

/// A throwaway upstream that records every path it is asked for. The
/// `/redirect-me` path answers with a 302 pointing elsewhere.
struct UpstreamHandle {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl UpstreamHandle {
    fn received(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn spawn_upstream() -> UpstreamHandle {
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    let app = Router::new().fallback(move |req: Request| {
        let recorded = recorded.clone();
        async move {
            let path = req.uri().path().to_string();
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            recorded.lock().unwrap().push(path_and_query);

            match path.as_str() {
                "/redirect-me" => Response::builder()
                    .status(302)
                    .header("location", "https://elsewhere.example/landing")
                    .body(Body::empty())
                    .unwrap(),
                "/echo" => {
                    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
                        .await
                        .unwrap();
                    Response::builder()
                        .status(200)
                        .body(Body::from(bytes))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(200)
                    .body(Body::from("upstream ok"))
                    .unwrap(),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    UpstreamHandle { addr, requests }
}

struct ProxyHarness {
    base_url: String,
    metrics: Arc<Metrics>,
    // Keeps the collector's shutdown channel open for the test's lifetime.
    _shutdown: Arc<ShutdownCoordinator>,
}

/// Boot the full admission stack on an ephemeral port. The decision cache
/// runs with a zero TTL so every check reaches the scripted ledger.
async fn spawn_proxy(config: ProxyConfig, ledger: MockLedger) -> ProxyHarness {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new().unwrap());
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let (recorder, _collector) = MetricsCollector::spawn(metrics.clone(), shutdown.subscribe());

    let coordinator = Arc::new(QuotaCoordinator::new(
        Arc::new(LedgerClient::Mock(ledger)),
        Arc::new(DecisionCache::new(0)),
        config.clone(),
        metrics.clone(),
    ));
    let upstream_proxy = Arc::new(UpstreamProxy::new(&config.upstream_url).unwrap());

    let state = AppState {
        config,
        coordinator,
        proxy: upstream_proxy,
        recorder,
        metrics: metrics.clone(),
        started_at: Instant::now(),
    };
    let app = server::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    ProxyHarness {
        base_url: format!("http://{addr}"),
        metrics,
        _shutdown: shutdown,
    }
}

/// Test client that returns redirects to the caller instead of following
/// them.
fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_source_limit_admits_then_denies_within_window() {
    let upstream = spawn_upstream().await;
    let mut config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    config.source_limits.insert("203.0.113.10".to_string(), 3);
    let ledger = MockLedger::new();
    let harness = spawn_proxy(config, ledger.clone()).await;
    let client = test_client();

    for expected_remaining in ["2", "1", "0"] {
        let response = client
            .get(format!("{}/categories/MLA1", harness.base_url))
            .header("x-forwarded-for", "203.0.113.10")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            expected_remaining
        );
    }

    for _ in 0..7 {
        let response = client
            .get(format!("{}/categories/MLA1", harness.base_url))
            .header("x-forwarded-for", "203.0.113.10")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 429);

        let retry_after: i64 = response
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);

        let body = response.text().await.unwrap();
        assert!(body.contains("rate_limit_exceeded"));
    }

    assert_eq!(ledger.cardinality("source::203.0.113.10"), 3);
}

#[tokio::test]
async fn test_path_variants_share_one_route_bucket() {
    let upstream = spawn_upstream().await;
    let mut config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    config.route_limits.insert("/items/*".to_string(), 5);
    let ledger = MockLedger::new();
    let harness = spawn_proxy(config, ledger.clone()).await;
    let client = test_client();

    let variants = [
        "/items/MLA123",
        "/items/MLA123/",
        "/items/MLA123?x=1",
        "/items/MLA123/attributes",
        "/items/MLA999",
    ];
    for path in variants {
        let response = client
            .get(format!("{}{path}", harness.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "expected admit for {path}");
    }

    // The shared bucket is exhausted for every shape of the path.
    let response = client
        .get(format!("{}/items/MLA123?y=2", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);

    assert_eq!(ledger.cardinality("route::/items/*"), 5);
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    let harness = spawn_proxy(config, MockLedger::failing()).await;
    let client = test_client();

    for _ in 0..10 {
        let response = client
            .get(format!("{}/items/MLA123", harness.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert!(harness.metrics.store_errors_total.get() >= 10);
}

#[tokio::test]
async fn test_route_dimension_denies_while_source_has_headroom() {
    let upstream = spawn_upstream().await;
    let mut config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    config.source_limits.insert("10.0.0.1".to_string(), 100);
    config.route_limits.insert("/users/*".to_string(), 5);
    let ledger = MockLedger::new();
    let harness = spawn_proxy(config, ledger.clone()).await;
    let client = test_client();

    let mut statuses = Vec::new();
    for _ in 0..7 {
        let response = client
            .get(format!("{}/users/42", harness.base_url))
            .header("x-forwarded-for", "10.0.0.1")
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, [200, 200, 200, 200, 200, 429, 429]);

    // The denying dimension is observable through the blocked counter.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        harness
            .metrics
            .rate_limit_blocked_total
            .with_label_values(&["route", "route::/users/*"])
            .get(),
        2
    );
}

#[tokio::test]
async fn test_bypass_strips_prefix_and_skips_quota() {
    let upstream = spawn_upstream().await;
    let mut config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    config.default_limit = 1;
    let ledger = MockLedger::new();
    let harness = spawn_proxy(config, ledger.clone()).await;
    let client = test_client();

    for _ in 0..5 {
        let response = client
            .get(format!("{}/no-ratelimit/sites/MLA?x=1", harness.base_url))
            .header("x-forwarded-for", "1.2.3.4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("x-proxied-by").unwrap(), "quotagate");
    }

    // The ledger was never consulted and the upstream saw the bare path.
    assert_eq!(ledger.checks(), 0);
    let received = upstream.received();
    assert_eq!(received.len(), 5);
    assert!(received.iter().all(|path| path == "/sites/MLA?x=1"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        harness
            .metrics
            .requests_total
            .with_label_values(&["GET", "/no-ratelimit/*", "200"])
            .get(),
        5
    );
}

#[tokio::test]
async fn test_upstream_redirect_is_returned_verbatim() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    let harness = spawn_proxy(config, MockLedger::new()).await;
    let client = test_client();

    let response = client
        .get(format!("{}/redirect-me", harness.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://elsewhere.example/landing"
    );
    // Responses are uncacheable regardless of what the upstream said.
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-cache, no-store, must-revalidate"
    );

    // The proxy issued exactly one upstream request and did not follow the
    // redirect itself.
    assert_eq!(upstream.received().len(), 1);
}

#[tokio::test]
async fn test_unreachable_upstream_translates_to_502() {
    // A port nothing is listening on.
    let config = ProxyConfig::for_tests("http://127.0.0.1:9");
    let harness = spawn_proxy(config, MockLedger::new()).await;
    let client = test_client();

    let response = client
        .get(format!("{}/items/MLA1", harness.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body = response.text().await.unwrap();
    assert!(body.contains("service_unavailable"));
    assert!(body.contains("Upstream service error"));
}

#[tokio::test]
async fn test_health_and_status_endpoints_are_not_proxied() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    let harness = spawn_proxy(config, MockLedger::new()).await;
    let client = test_client();

    let response = client
        .get(format!("{}/health", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let health: serde_json::Value = response.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "quotagate");
    assert!(health["system"]["cpu_count"].as_u64().unwrap() >= 1);

    let response = client
        .get(format!("{}/status", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["status"], "ok");

    assert!(upstream.received().is_empty());
}

#[tokio::test]
async fn test_request_body_reaches_upstream_unchanged() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::for_tests(&format!("http://{}", upstream.addr));
    let harness = spawn_proxy(config, MockLedger::new()).await;
    let client = test_client();

    let response = client
        .post(format!("{}/echo", harness.base_url))
        .body(r#"{"title":"new item"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"title":"new item"}"#);
    assert_eq!(upstream.received(), vec!["/echo".to_string()]);
}
