//! # Reverse Proxy Module
//!
//! Forwards admitted requests to the fixed upstream origin over a single
//! tuned transport shared by the whole process.
//!
//! ## Features
//!
//! - **Transparent forwarding**: Path, query, headers and body pass through
//!   untouched; only the authority is rewritten and `X-Forwarded-*` headers
//!   are added when absent
//! - **Tuned transport**: Large connection pool, sub-second connect
//!   timeout, short idle timeout, TCP keep-alive, TLS 1.2 minimum, no
//!   compression, redirects returned verbatim
//! - **Error translation**: Any transport failure becomes a 502 with a
//!   fixed JSON body
//! - **Response hygiene**: Every response is marked uncacheable and stamped
//!   with the proxy identification header

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use std::time::Duration;
use tracing::{error, info};

/// Reserved path prefix that skips quota enforcement. The prefix is
/// stripped before forwarding.
pub const NO_RATELIMIT_PREFIX: &str = "/no-ratelimit/";

/// Route class bypass traffic is observed under.
pub const NO_RATELIMIT_ROUTE_CLASS: &str = "/no-ratelimit/*";

const UPSTREAM_ERROR_BODY: &str =
    r#"{"error":"service_unavailable","message":"Upstream service error"}"#;

/// Hop-by-hop headers are connection-scoped and must not be forwarded in
/// either direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct UpstreamProxy {
    client: reqwest::Client,
    /// Upstream origin without a trailing slash.
    upstream: String,
}

impl UpstreamProxy {
    pub fn new(upstream_url: &str) -> Result<Self, reqwest::Error> {
        let client = build_transport()?;
        info!(upstream = upstream_url, "upstream transport initialized");

        Ok(Self {
            client,
            upstream: upstream_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward one request and translate transport failures into a 502.
    pub async fn forward(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let target = build_target_url(&self.upstream, parts.uri.path(), parts.uri.query());

        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        if !headers.contains_key("x-forwarded-proto") {
            headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        }
        if !headers.contains_key("x-forwarded-host") {
            if let Some(host) = original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
                headers.insert("x-forwarded-host", host);
            }
        }

        let upstream_response = self
            .client
            .request(parts.method, target.as_str())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream_response = match upstream_response {
            Ok(response) => response,
            Err(e) => {
                error!(target = %target, error = %e, "upstream request failed");
                return upstream_error_response();
            }
        };

        let status = upstream_response.status();
        let mut headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut headers);
        apply_response_hygiene(&mut headers);

        let mut builder = Response::builder().status(status);
        if let Some(map) = builder.headers_mut() {
            *map = headers;
        }
        builder
            .body(Body::from_stream(upstream_response.bytes_stream()))
            .unwrap_or_else(|_| upstream_error_response())
    }
}

/// The shared transport, tuned for sustained high request rates against a
/// single origin.
fn build_transport() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(1_000)
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(15))
        .tcp_keepalive(Duration::from_secs(30))
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        // Redirects are returned to the caller verbatim.
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

fn build_target_url(upstream: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{upstream}{path}?{query}"),
        None => format!("{upstream}{path}"),
    }
}

/// Strip the `/no-ratelimit` routing prefix, keeping the leading slash of
/// the remainder. Returns `None` for paths outside the bypass namespace.
pub fn strip_bypass_prefix(path: &str) -> Option<&str> {
    if path.starts_with(NO_RATELIMIT_PREFIX) {
        Some(&path[NO_RATELIMIT_PREFIX.len() - 1..])
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Responses must never be cached downstream and always identify the proxy.
fn apply_response_hygiene(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert("x-proxied-by", HeaderValue::from_static("quotagate"));
}

fn upstream_error_response() -> Response {
    let mut headers = HeaderMap::new();
    apply_response_hygiene(&mut headers);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    let mut builder = Response::builder().status(502);
    if let Some(map) = builder.headers_mut() {
        *map = headers;
    }
    builder
        .body(Body::from(UPSTREAM_ERROR_BODY))
        .expect("static 502 response must build")
}
