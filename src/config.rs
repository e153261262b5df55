//! Proxy configuration
//!
//! Settings come from three layers, later ones overriding earlier ones:
//! built-in defaults, an optional JSON file, then command-line flags and
//! `DNSVEIL_*` environment variables (see [`crate::cli`]).

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ProxyError;

/// Limits applied by the admission gate in front of the DoH endpoints
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_concurrent: usize,
    pub min_spacing_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            min_spacing_ms: 100,
        }
    }
}

/// Retry budget for a single DoH call
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 5000,
            backoff_ms: 500,
        }
    }
}

/// Complete proxy configuration
///
/// # Examples
///
/// ```
/// use dnsveil::config::ProxyConfig;
///
/// let config = ProxyConfig::from_json(r#"{
///     "doh_endpoints": ["https://dns.example/dns-query"],
///     "override_pattern": "\\.lan$",
///     "retry": { "max_attempts": 5 }
/// }"#).unwrap();
///
/// assert_eq!(config.retry.max_attempts, 5);
/// assert_eq!(config.retry.backoff_ms, 500);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the UDP listener binds to
    pub listen: SocketAddr,
    /// DoH endpoint URLs; one is picked at random per query
    pub doh_endpoints: Vec<String>,
    /// SOCKS5 proxy URL that DoH traffic is tunneled through
    pub socks_proxy: Option<String>,
    /// Accept invalid TLS certificates from DoH endpoints
    pub insecure_skip_verify: bool,
    /// Questions whose name matches this pattern go to the secondary resolver
    pub override_pattern: Option<String>,
    /// Plain DNS resolver used for overridden names
    pub secondary_resolver: SocketAddr,
    pub secondary_timeout_ms: u64,
    /// Retry over DoH when the secondary resolver fails
    pub secondary_fallback: bool,
    pub rate_limit: RateLimitConfig,
    pub retry: RetrySettings,
    /// Lifetime of cached responses that carry no answers
    pub negative_ttl_secs: u64,
    /// Share one upstream lookup between concurrent identical queries
    pub single_flight: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 53)),
            doh_endpoints: vec![
                "https://cloudflare-dns.com/dns-query".to_string(),
                "https://dns.google/dns-query".to_string(),
            ],
            socks_proxy: None,
            insecure_skip_verify: false,
            override_pattern: None,
            secondary_resolver: SocketAddr::from(([1, 1, 1, 1], 53)),
            secondary_timeout_ms: 5000,
            secondary_fallback: false,
            rate_limit: RateLimitConfig::default(),
            retry: RetrySettings::default(),
            negative_ttl_secs: 30,
            single_flight: true,
        }
    }
}

impl ProxyConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse configuration JSON")
    }

    /// Reads a JSON configuration file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Checks the settings for values the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.doh_endpoints.is_empty() {
            return Err(ProxyError::NoEndpoints);
        }
        for endpoint in &self.doh_endpoints {
            if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
                return Err(ProxyError::Config(format!(
                    "DoH endpoint must be an http(s) URL: {}",
                    endpoint
                )));
            }
        }
        if self.rate_limit.max_concurrent == 0 {
            return Err(ProxyError::Config(
                "rate_limit.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProxyError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        self.override_regex()?;
        Ok(())
    }

    /// Compiles `override_pattern`, if one is set.
    pub fn override_regex(&self) -> Result<Option<Regex>, ProxyError> {
        self.override_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ProxyError::Config(format!("invalid override pattern {:?}: {}", pattern, e))
                })
            })
            .transpose()
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn secondary_timeout(&self) -> Duration {
        Duration::from_millis(self.secondary_timeout_ms)
    }
}
