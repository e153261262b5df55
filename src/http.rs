//! DNS-over-HTTPS transport
//!
//! This module provides the encrypted upstream path:
//! - [`ReqwestExchange`] performs one RFC 8484 POST, optionally tunneled
//!   through a SOCKS5 proxy
//! - [`DohClient`] puts the admission gate and the retry loop in front of
//!   any [`DohExchange`]
//!
//! TLS certificates are validated unless the configuration explicitly
//! opts out.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Proxy};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::rate_limit::RateLimiter;
use crate::retry::{with_fixed_backoff, RetryConfig};

/// Media type of a wire-format DNS message body
pub const DNS_MESSAGE_MIME: &str = "application/dns-message";

/// A single DoH request/response exchange
///
/// Implementations perform exactly one attempt; retries and rate limiting
/// are layered on top by [`DohClient`].
#[async_trait]
pub trait DohExchange: Send + Sync {
    /// POSTs `query` to `endpoint` and returns the response body.
    async fn post_dns_message(&self, endpoint: &str, query: &[u8]) -> Result<Vec<u8>, ProxyError>;
}

/// [`DohExchange`] backed by a pooled reqwest client
pub struct ReqwestExchange {
    client: Client,
}

impl ReqwestExchange {
    /// Builds the HTTP client from the proxy settings
    ///
    /// The per-attempt deadline is enforced by the retry loop, so no
    /// request timeout is configured on the client itself.
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut builder = ClientBuilder::new()
            .user_agent(concat!("dnsveil/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(60));

        if let Some(proxy_url) = &config.socks_proxy {
            let proxy = Proxy::all(proxy_url.as_str())
                .map_err(|e| ProxyError::Config(format!("invalid SOCKS proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
            debug!("Tunneling DoH traffic through {}", proxy_url);
        }

        if config.insecure_skip_verify {
            warn!("TLS certificate validation is DISABLED for DoH endpoints");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl DohExchange for ReqwestExchange {
    async fn post_dns_message(&self, endpoint: &str, query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(ACCEPT, DNS_MESSAGE_MIME)
            .body(query.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 429 {
                warn!("Rate limited by {}: {}", endpoint, status);
            } else if status.is_server_error() {
                warn!("Server error from {}: {}", endpoint, status);
            } else {
                warn!("Request rejected by {}: {}", endpoint, status);
            }
            return Err(ProxyError::UpstreamStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(body.to_vec())
    }
}

/// Rate-limited, retrying DoH client
///
/// All calls share one [`RateLimiter`]; a call holds its admission permit
/// for every attempt it makes, so with the default single permit the
/// endpoints see one call at a time.
pub struct DohClient {
    exchange: Arc<dyn DohExchange>,
    retry_config: RetryConfig,
    rate_limiter: Arc<RateLimiter>,
}

impl DohClient {
    pub fn new(
        exchange: Arc<dyn DohExchange>,
        retry_config: RetryConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            exchange,
            retry_config,
            rate_limiter,
        }
    }

    /// Builds a client talking to real endpoints with the configured limits.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self::new(
            Arc::new(ReqwestExchange::new(config)?),
            RetryConfig::from(&config.retry),
            Arc::new(RateLimiter::from_config(&config.rate_limit)),
        ))
    }

    /// Sets a custom retry configuration for the client
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Sends `query` to `endpoint`, waiting for admission and retrying
    /// transient failures.
    pub async fn query(&self, endpoint: &str, query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        debug!("Acquiring rate limit permit for {}", endpoint);
        let _permit = self.rate_limiter.acquire().await?;

        let exchange = &self.exchange;
        let body = with_fixed_backoff(
            |attempt| async move {
                debug!("DoH attempt {} to {}", attempt, endpoint);
                exchange.post_dns_message(endpoint, query).await
            },
            ProxyError::is_retriable,
            &self.retry_config,
        )
        .await?;

        debug!("Received {} byte DoH response from {}", body.len(), endpoint);
        Ok(body)
    }
}
