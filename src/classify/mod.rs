//! # Request Classifier Module
//!
//! This module derives the two quota identities from an inbound request:
//! the source identity (best-effort caller address) and the route class
//! (normalized request path used as a quota key and metric label).
//!
//! ## Features
//!
//! - **Forwarding-aware source extraction**: Scans `X-Forwarded-For` for the
//!   first syntactically valid address, falls back to `X-Real-IP`, then to
//!   the transport peer with its port stripped
//! - **Path normalization**: Strips query strings and trailing slashes and
//!   collapses well-known resource prefixes to a single bucket per prefix
//! - **Total functions**: Every request yields a non-empty source and route
//!   class; there is no error path out of this module
//!
//! Both functions are pure and safe to call from any number of tasks.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Path prefixes whose leaf segment is collapsed into a single route class,
/// e.g. `/items/MLA123/attributes` -> `/items/*`.
const COLLAPSED_PREFIXES: [&str; 4] = ["categories", "items", "users", "sites"];

/// Extract the caller identity for quota accounting.
///
/// Order of precedence: first valid IP in `X-Forwarded-For`, then a valid
/// `X-Real-IP`, then the transport peer address without its port. Never
/// returns an empty string.
pub fn extract_source(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        for entry in forwarded.split(',') {
            let candidate = entry.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return candidate.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let candidate = real_ip.trim();
        if candidate.parse::<IpAddr>().is_ok() {
            return candidate.to_string();
        }
    }

    peer.ip().to_string()
}

/// Normalize a request path into its route class.
///
/// Strips the query string, lowercases, removes a single trailing slash
/// (except for the root path), and collapses the leaf segment of the known
/// resource prefixes. Unknown paths pass through unchanged apart from the
/// normalization steps. Idempotent.
pub fn normalize_route(path: &str) -> String {
    let path = match path.find('?') {
        Some(idx) => &path[..idx],
        None => path,
    };

    let mut normalized = path.to_ascii_lowercase();
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized.is_empty() {
        return "/".to_string();
    }

    if let Some(rest) = normalized.strip_prefix('/') {
        if let Some((head, leaf)) = rest.split_once('/') {
            // The leaf segment must be non-empty for the prefix to collapse.
            if !leaf.is_empty() && !leaf.starts_with('/') && COLLAPSED_PREFIXES.contains(&head) {
                return format!("/{}/*", head);
            }
        }
    }

    normalized
}
