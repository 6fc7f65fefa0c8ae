//! Environment variable validation and configuration for quotagate.
//!
//! This module centralizes every environment variable the proxy consumes
//! and validates the whole set at startup, before any singleton is built.
//!
//! # Supported Environment Variables
//!
//! ## Listeners
//! - `QUOTAGATE_PORT`: inbound listener port (default: "8080")
//! - `QUOTAGATE_METRICS_PORT`: metrics listener port (default: "9090")
//!
//! ## Upstream
//! - `QUOTAGATE_UPSTREAM_URL`: forwarding target (required)
//!
//! ## Quota Ledger
//! - `QUOTAGATE_REDIS_URL`: ledger endpoint (required while enabled)
//! - `QUOTAGATE_REDIS_ENABLED`: "false" admits everything (default: "true")
//! - `QUOTAGATE_REDIS_POOL_SIZE`: ledger connection pool size (default: "1000")
//!
//! ## Quota Policy
//! - `QUOTAGATE_DEFAULT_LIMIT`: per-window default limit (default: "100")
//! - `QUOTAGATE_WINDOW_SECS`: sliding window length (default: "60")
//! - `QUOTAGATE_SOURCE_LIMITS`: per-source overrides, "1.2.3.4:200,..."
//! - `QUOTAGATE_ROUTE_LIMITS`: per-route-class overrides, "/items/*:50,..."
//! - `QUOTAGATE_SOURCE_ROUTE_LIMITS`: combined overrides,
//!   "1.2.3.4::/items/*:25,..."
//!
//! ## Logging
//! - `RUST_LOG` / `QUOTAGATE_LOG_LEVEL`: log filter
//!   (default: "quotagate=info,tower_http=debug")

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Environment validation errors
#[derive(Debug, Clone)]
pub struct EnvValidationError {
    pub variable: String,
    pub message: String,
    pub severity: ErrorSeverity,
}

/// Severity level for environment validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// Critical errors that prevent application startup
    Critical,
    /// Suboptimal or partially ignored configurations
    Warning,
    /// Defaults being used
    Info,
}

/// Validated application configuration derived from environment variables
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listeners
    pub port: u16,
    pub metrics_port: u16,
    pub bind_address: SocketAddr,
    pub metrics_bind_address: SocketAddr,

    // Upstream
    pub upstream_url: String,

    // Quota ledger
    pub redis_url: String,
    pub redis_enabled: bool,
    pub redis_pool_size: usize,

    // Quota policy
    pub default_limit: i64,
    pub window: Duration,
    pub source_limits: HashMap<String, i64>,
    pub route_limits: HashMap<String, i64>,
    pub source_route_limits: HashMap<String, i64>,
}

impl ProxyConfig {
    /// Minimal configuration for in-crate tests; never reads the
    /// environment.
    #[cfg(test)]
    pub fn for_tests(upstream_url: &str) -> Self {
        Self {
            port: 0,
            metrics_port: 0,
            bind_address: "127.0.0.1:0".parse().unwrap(),
            metrics_bind_address: "127.0.0.1:0".parse().unwrap(),
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            redis_url: String::new(),
            redis_enabled: false,
            redis_pool_size: 4,
            default_limit: 100,
            window: Duration::from_secs(60),
            source_limits: HashMap::new(),
            route_limits: HashMap::new(),
            source_route_limits: HashMap::new(),
        }
    }
}

/// Validate all environment variables and return configuration or errors
pub fn validate_environment() -> Result<ProxyConfig, Vec<EnvValidationError>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let port: u16 = parse_env_var_with_default("QUOTAGATE_PORT", 8080, &mut warnings);
    let metrics_port: u16 = parse_env_var_with_default("QUOTAGATE_METRICS_PORT", 9090, &mut warnings);

    let upstream_url = match env::var("QUOTAGATE_UPSTREAM_URL") {
        Ok(url) if url.starts_with("http://") || url.starts_with("https://") => {
            url.trim_end_matches('/').to_string()
        }
        Ok(url) => {
            errors.push(EnvValidationError {
                variable: "QUOTAGATE_UPSTREAM_URL".to_string(),
                message: format!("Not an absolute http(s) URL: {}", url),
                severity: ErrorSeverity::Critical,
            });
            String::new()
        }
        Err(_) => {
            errors.push(EnvValidationError {
                variable: "QUOTAGATE_UPSTREAM_URL".to_string(),
                message: "Required variable is not set".to_string(),
                severity: ErrorSeverity::Critical,
            });
            String::new()
        }
    };

    let redis_enabled =
        parse_bool_env_var_with_default("QUOTAGATE_REDIS_ENABLED", true, &mut warnings);

    let redis_url = match env::var("QUOTAGATE_REDIS_URL") {
        Ok(url) => url,
        Err(_) if redis_enabled => {
            errors.push(EnvValidationError {
                variable: "QUOTAGATE_REDIS_URL".to_string(),
                message: "Required while QUOTAGATE_REDIS_ENABLED is true".to_string(),
                severity: ErrorSeverity::Critical,
            });
            String::new()
        }
        Err(_) => String::new(),
    };

    let redis_pool_size =
        parse_env_var_with_default("QUOTAGATE_REDIS_POOL_SIZE", 1000usize, &mut warnings);

    let default_limit: i64 = parse_env_var_with_default("QUOTAGATE_DEFAULT_LIMIT", 100, &mut warnings);
    if default_limit < 1 {
        errors.push(EnvValidationError {
            variable: "QUOTAGATE_DEFAULT_LIMIT".to_string(),
            message: format!("Limit must be a positive integer, got {}", default_limit),
            severity: ErrorSeverity::Critical,
        });
    }

    let window_secs: u64 = parse_env_var_with_default("QUOTAGATE_WINDOW_SECS", 60, &mut warnings);
    if window_secs == 0 {
        errors.push(EnvValidationError {
            variable: "QUOTAGATE_WINDOW_SECS".to_string(),
            message: "Window must be at least one second".to_string(),
            severity: ErrorSeverity::Critical,
        });
    }

    let source_limits = parse_limit_overrides(
        &env::var("QUOTAGATE_SOURCE_LIMITS").unwrap_or_default(),
        "QUOTAGATE_SOURCE_LIMITS",
        &mut warnings,
    );
    let route_limits = parse_limit_overrides(
        &env::var("QUOTAGATE_ROUTE_LIMITS").unwrap_or_default(),
        "QUOTAGATE_ROUTE_LIMITS",
        &mut warnings,
    );
    let source_route_limits = parse_limit_overrides(
        &env::var("QUOTAGATE_SOURCE_ROUTE_LIMITS").unwrap_or_default(),
        "QUOTAGATE_SOURCE_ROUTE_LIMITS",
        &mut warnings,
    );

    errors.extend(warnings);

    let has_critical_errors = errors.iter().any(|e| e.severity == ErrorSeverity::Critical);
    if has_critical_errors {
        return Err(errors);
    }

    for error in &errors {
        match error.severity {
            ErrorSeverity::Warning => warn!("{}: {}", error.variable, error.message),
            ErrorSeverity::Info => info!("{}: {}", error.variable, error.message),
            ErrorSeverity::Critical => {}
        }
    }

    Ok(ProxyConfig {
        port,
        metrics_port,
        bind_address: SocketAddr::from(([0, 0, 0, 0], port)),
        metrics_bind_address: SocketAddr::from(([0, 0, 0, 0], metrics_port)),
        upstream_url,
        redis_url,
        redis_enabled,
        redis_pool_size,
        default_limit,
        window: Duration::from_secs(window_secs),
        source_limits,
        route_limits,
        source_route_limits,
    })
}

/// Get the validated configuration, exiting the process if validation fails
pub fn get_config() -> ProxyConfig {
    match validate_environment() {
        Ok(config) => config,
        Err(errors) => {
            eprintln!("Environment validation failed:");
            for error in errors {
                match error.severity {
                    ErrorSeverity::Critical => {
                        eprintln!("CRITICAL - {}: {}", error.variable, error.message)
                    }
                    ErrorSeverity::Warning => {
                        eprintln!("WARNING - {}: {}", error.variable, error.message)
                    }
                    ErrorSeverity::Info => {
                        eprintln!("INFO - {}: {}", error.variable, error.message)
                    }
                }
            }
            std::process::exit(1);
        }
    }
}

/// Parse override maps of the form `key:limit,key:limit`. Keys may contain
/// `:`-free route classes and `::`-joined composites, so the split happens
/// on the last colon of each pair. Malformed pairs are skipped with a
/// warning.
fn parse_limit_overrides(
    input: &str,
    variable: &str,
    warnings: &mut Vec<EnvValidationError>,
) -> HashMap<String, i64> {
    let mut overrides = HashMap::new();
    if input.is_empty() {
        return overrides;
    }

    for pair in input.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.rsplit_once(':') {
            Some((key, limit)) if !key.is_empty() => match limit.trim().parse::<i64>() {
                Ok(limit) if limit > 0 => {
                    overrides.insert(key.trim().to_string(), limit);
                }
                _ => warnings.push(EnvValidationError {
                    variable: variable.to_string(),
                    message: format!("Ignoring pair with invalid limit: '{}'", pair),
                    severity: ErrorSeverity::Warning,
                }),
            },
            _ => warnings.push(EnvValidationError {
                variable: variable.to_string(),
                message: format!("Ignoring malformed pair: '{}'", pair),
                severity: ErrorSeverity::Warning,
            }),
        }
    }

    overrides
}

/// Helper function to parse environment variable with default value
fn parse_env_var_with_default<T>(
    var_name: &str,
    default: T,
    warnings: &mut Vec<EnvValidationError>,
) -> T
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match env::var(var_name) {
        Ok(value_str) => match value_str.parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warnings.push(EnvValidationError {
                    variable: var_name.to_string(),
                    message: format!(
                        "Invalid value '{}': {}. Using default: {}",
                        value_str, e, default
                    ),
                    severity: ErrorSeverity::Warning,
                });
                default
            }
        },
        Err(_) => {
            warnings.push(EnvValidationError {
                variable: var_name.to_string(),
                message: format!("Using default value: {}", default),
                severity: ErrorSeverity::Info,
            });
            default
        }
    }
}

/// Helper function to parse boolean environment variable with default value
fn parse_bool_env_var_with_default(
    var_name: &str,
    default: bool,
    warnings: &mut Vec<EnvValidationError>,
) -> bool {
    match env::var(var_name) {
        Ok(value_str) => match value_str.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                warnings.push(EnvValidationError {
                    variable: var_name.to_string(),
                    message: format!(
                        "Invalid boolean value '{}'. Using default: {}",
                        value_str, default
                    ),
                    severity: ErrorSeverity::Warning,
                });
                default
            }
        },
        Err(_) => {
            warnings.push(EnvValidationError {
                variable: var_name.to_string(),
                message: format!("Using default value: {}", default),
                severity: ErrorSeverity::Info,
            });
            default
        }
    }
}
