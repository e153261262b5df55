//! Upstream resolution strategies
//!
//! A cache miss is resolved one of two ways:
//! 1. names matching the override pattern are forwarded as-is to the
//!    secondary UDP resolver
//! 2. everything else goes to a randomly chosen DoH endpoint through the
//!    rate-limited retrying [`DohClient`]
//!
//! A failure on the secondary path is final unless fallback to DoH has
//! been switched on in the configuration.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use regex::Regex;
use tracing::{debug, warn};
use trust_dns_resolver::proto::op::Message;

use crate::codec;
use crate::config::ProxyConfig;
use crate::dns::SecondaryResolver;
use crate::error::ProxyError;
use crate::http::DohClient;

/// Produces a fresh response for a query the cache could not answer
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolves `query`, whose wire form is `raw`.
    ///
    /// Implementations never touch the cache; the dispatcher stores
    /// whatever they return.
    async fn resolve(&self, query: &Message, raw: &[u8]) -> Result<Message, ProxyError>;
}

/// Path chosen for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Secondary,
    Doh,
}

pub struct UpstreamResolver {
    doh: DohClient,
    endpoints: Vec<String>,
    secondary: SecondaryResolver,
    override_pattern: Option<Regex>,
    secondary_fallback: bool,
}

impl UpstreamResolver {
    pub fn new(
        doh: DohClient,
        endpoints: Vec<String>,
        secondary: SecondaryResolver,
        override_pattern: Option<Regex>,
    ) -> Self {
        Self {
            doh,
            endpoints,
            secondary,
            override_pattern,
            secondary_fallback: false,
        }
    }

    /// Lets a failed secondary lookup be retried over DoH.
    pub fn with_secondary_fallback(mut self, enabled: bool) -> Self {
        self.secondary_fallback = enabled;
        self
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let resolver = Self::new(
            DohClient::from_config(config)?,
            config.doh_endpoints.clone(),
            SecondaryResolver::new(config.secondary_resolver, config.secondary_timeout()),
            config.override_regex()?,
        );
        Ok(resolver.with_secondary_fallback(config.secondary_fallback))
    }

    /// Picks the path for `query`: secondary if any question name matches
    /// the override pattern, DoH otherwise.
    pub fn strategy_for(&self, query: &Message) -> Strategy {
        let Some(pattern) = &self.override_pattern else {
            return Strategy::Doh;
        };

        let matched = query.queries().iter().any(|q| {
            let name = q.name().to_string();
            pattern.is_match(name.trim_end_matches('.'))
        });

        if matched {
            Strategy::Secondary
        } else {
            Strategy::Doh
        }
    }

    /// Chooses a DoH endpoint uniformly at random.
    pub fn select_endpoint(&self) -> Result<&str, ProxyError> {
        self.endpoints
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .ok_or(ProxyError::NoEndpoints)
    }

    async fn resolve_doh(&self, raw: &[u8]) -> Result<Message, ProxyError> {
        let endpoint = self.select_endpoint()?;
        debug!("Resolving via DoH endpoint {}", endpoint);
        let body = self.doh.query(endpoint, raw).await?;
        codec::decode(&body)
    }

    async fn resolve_secondary(&self, raw: &[u8]) -> Result<Message, ProxyError> {
        debug!("Resolving via secondary resolver {}", self.secondary.server());
        let reply = self.secondary.forward(raw).await?;
        codec::decode(&reply)
    }
}

#[async_trait]
impl Resolve for UpstreamResolver {
    async fn resolve(&self, query: &Message, raw: &[u8]) -> Result<Message, ProxyError> {
        match self.strategy_for(query) {
            Strategy::Doh => self.resolve_doh(raw).await,
            Strategy::Secondary => match self.resolve_secondary(raw).await {
                Err(err) if self.secondary_fallback => {
                    warn!("Secondary resolver failed ({}), falling back to DoH", err);
                    self.resolve_doh(raw).await
                }
                result => result,
            },
        }
    }
}
