//! Command-line interface for the dnsveil proxy
//!
//! Every option can also be supplied through a `DNSVEIL_*` environment
//! variable, which is how the proxy is usually configured when run as a
//! service. Options given here override the JSON config file.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::ProxyConfig;

/// Main command-line interface structure for dnsveil
///
/// Fields left unset fall back to the config file, then to built-in defaults.
///
/// # Examples
///
/// ```
/// use clap::Parser;
/// use dnsveil::cli::Cli;
///
/// let cli = Cli::try_parse_from([
///     "dnsveil",
///     "--listen", "127.0.0.1:5353",
///     "--doh-endpoint", "https://dns.example/dns-query",
/// ]).unwrap();
/// let config = cli.into_config().unwrap();
///
/// assert_eq!(config.listen.port(), 5353);
/// assert_eq!(config.doh_endpoints.len(), 1);
/// ```
#[derive(Parser, Debug)]
#[command(
    name = "dnsveil",
    about = "Caching DNS proxy that resolves over DNS-over-HTTPS",
    version
)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "DNSVEIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on for DNS queries
    #[arg(short, long, env = "DNSVEIL_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// DoH endpoint URL; repeat for several (comma-separated in the environment)
    #[arg(long = "doh-endpoint", env = "DNSVEIL_DOH_ENDPOINTS", value_delimiter = ',')]
    pub doh_endpoints: Vec<String>,

    /// SOCKS5 proxy to tunnel DoH traffic through (e.g. socks5h://127.0.0.1:9050)
    #[arg(long, env = "DNSVEIL_SOCKS_PROXY")]
    pub socks_proxy: Option<String>,

    /// Accept invalid TLS certificates from DoH endpoints
    #[arg(long, env = "DNSVEIL_INSECURE_SKIP_VERIFY")]
    pub insecure_skip_verify: bool,

    /// Regular expression; matching names are sent to the secondary resolver
    #[arg(long, env = "DNSVEIL_OVERRIDE_PATTERN")]
    pub override_pattern: Option<String>,

    /// Plain DNS resolver used for names matching the override pattern
    #[arg(long, env = "DNSVEIL_SECONDARY_RESOLVER")]
    pub secondary_resolver: Option<SocketAddr>,

    /// Timeout for a secondary resolver reply, in milliseconds
    #[arg(long, env = "DNSVEIL_SECONDARY_TIMEOUT_MS")]
    pub secondary_timeout_ms: Option<u64>,

    /// Fall back to DoH when the secondary resolver fails
    #[arg(long, env = "DNSVEIL_SECONDARY_FALLBACK")]
    pub secondary_fallback: bool,

    /// Maximum concurrent DoH calls
    #[arg(long, env = "DNSVEIL_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Minimum spacing between DoH call starts, in milliseconds
    #[arg(long, env = "DNSVEIL_MIN_SPACING_MS")]
    pub min_spacing_ms: Option<u64>,

    /// Attempts per DoH call, including the first
    #[arg(long, env = "DNSVEIL_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Timeout for a single DoH attempt, in milliseconds
    #[arg(short = 't', long, env = "DNSVEIL_ATTEMPT_TIMEOUT_MS")]
    pub attempt_timeout_ms: Option<u64>,

    /// Delay between DoH attempts, in milliseconds
    #[arg(long, env = "DNSVEIL_BACKOFF_MS")]
    pub backoff_ms: Option<u64>,

    /// Seconds to cache responses without answers (0 disables)
    #[arg(long, env = "DNSVEIL_NEGATIVE_TTL_SECS")]
    pub negative_ttl_secs: Option<u64>,

    /// Resolve every query independently, even identical concurrent ones
    #[arg(long, env = "DNSVEIL_NO_SINGLE_FLIGHT")]
    pub no_single_flight: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "DNSVEIL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Builds the effective configuration: defaults, then file, then flags.
    pub fn into_config(self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.doh_endpoints.is_empty() {
            config.doh_endpoints = self.doh_endpoints;
        }
        if self.socks_proxy.is_some() {
            config.socks_proxy = self.socks_proxy;
        }
        if self.insecure_skip_verify {
            config.insecure_skip_verify = true;
        }
        if self.override_pattern.is_some() {
            config.override_pattern = self.override_pattern;
        }
        if let Some(secondary) = self.secondary_resolver {
            config.secondary_resolver = secondary;
        }
        if let Some(timeout) = self.secondary_timeout_ms {
            config.secondary_timeout_ms = timeout;
        }
        if self.secondary_fallback {
            config.secondary_fallback = true;
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.rate_limit.max_concurrent = max_concurrent;
        }
        if let Some(spacing) = self.min_spacing_ms {
            config.rate_limit.min_spacing_ms = spacing;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(timeout) = self.attempt_timeout_ms {
            config.retry.attempt_timeout_ms = timeout;
        }
        if let Some(backoff) = self.backoff_ms {
            config.retry.backoff_ms = backoff;
        }
        if let Some(ttl) = self.negative_ttl_secs {
            config.negative_ttl_secs = ttl;
        }
        if self.no_single_flight {
            config.single_flight = false;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}
