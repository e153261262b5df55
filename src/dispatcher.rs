//! Per-query orchestration
//!
//! Every datagram goes through the same steps:
//! 1. decode the query (malformed input is dropped without a reply)
//! 2. look it up in the resolution cache
//! 3. on a hit, reply with the decayed cached response
//! 4. otherwise resolve upstream, store the response, and reply
//!
//! Any failure aborts only the query at hand: nothing is sent back and the
//! client is left to retry, as usual for DNS over UDP.
//!
//! Concurrent misses for the same question sequence can share a single
//! upstream lookup (single-flight). The first task to miss becomes the
//! leader; later ones await its result instead of calling upstream again.
//!
//! Replies larger than the client's advertised payload size are replaced
//! by a header-only response with the TC bit set.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use trust_dns_resolver::proto::op::{Message, MessageType};

use crate::cache::{Lookup, ResolutionCache};
use crate::codec::{self, CacheKey};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::upstream::{Resolve, UpstreamResolver};

type SharedLookup = Shared<BoxFuture<'static, Result<Message, ProxyError>>>;

/// Why a datagram was dropped without a reply
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The datagram is not a decodable DNS query
    #[error("malformed query: {0}")]
    Malformed(ProxyError),

    /// The query decoded but could not be answered
    #[error("query id={id}: {error}")]
    Unresolved { id: u16, error: ProxyError },
}

/// Core engine answering DNS queries
///
/// The dispatcher owns the cache and the pending-lookup table; the
/// upstream resolver is shared behind an `Arc` so in-flight lookups can
/// outlive the task that started them.
///
/// # Examples
///
/// ```no_run
/// use dnsveil::config::ProxyConfig;
/// use dnsveil::dispatcher::QueryDispatcher;
///
/// # async fn example(datagram: &[u8]) -> anyhow::Result<()> {
/// let dispatcher = QueryDispatcher::from_config(&ProxyConfig::default())?;
///
/// let peer: std::net::SocketAddr = "192.0.2.1:40000".parse()?;
/// if let Some(reply) = dispatcher.handle(peer, datagram).await {
///     println!("{} byte reply", reply.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct QueryDispatcher {
    cache: Arc<ResolutionCache>,
    resolver: Arc<dyn Resolve>,
    in_flight: DashMap<CacheKey, SharedLookup>,
    single_flight: bool,
}

impl QueryDispatcher {
    pub fn new(cache: ResolutionCache, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            cache: Arc::new(cache),
            resolver,
            in_flight: DashMap::new(),
            single_flight: true,
        }
    }

    /// Enables or disables sharing of identical concurrent upstream lookups.
    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let resolver = UpstreamResolver::from_config(config)?;
        let cache = ResolutionCache::new(config.negative_ttl());
        Ok(Self::new(cache, Arc::new(resolver)).with_single_flight(config.single_flight))
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Answers one datagram from `peer`, or returns `None` when the query is dropped.
    ///
    /// Errors are logged here and never propagate to the listener.
    pub async fn handle(&self, peer: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        match self.dispatch(datagram).await {
            Ok(reply) => Some(reply),
            Err(DispatchError::Malformed(err)) => {
                warn!("Dropping malformed query from {}: {}", peer, err);
                None
            }
            Err(DispatchError::Unresolved {
                id,
                error: err @ ProxyError::Exhausted { .. },
            }) => {
                error!("Dropping query id={} from {}: {}", id, peer, err);
                None
            }
            Err(DispatchError::Unresolved { id, error }) => {
                warn!("Dropping query id={} from {}: {}", id, peer, error);
                None
            }
        }
    }

    /// Runs the full pipeline for one datagram and returns the encoded reply.
    pub async fn dispatch(&self, datagram: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let query = codec::decode(datagram).map_err(DispatchError::Malformed)?;
        let id = query.id();
        self.answer(query, datagram)
            .await
            .map_err(|error| DispatchError::Unresolved { id, error })
    }

    async fn answer(&self, query: Message, datagram: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let request_id = query.id();
        let limit = usize::from(query.max_payload());
        let key = CacheKey::from_message(&query);

        match self.cache.lookup(&key, request_id, Instant::now()) {
            Lookup::Hit(message) => match codec::encode(&message) {
                Ok(reply) => {
                    debug!("Cache hit for {}", key);
                    return fit_to_payload(&message, reply, limit);
                }
                Err(err) => {
                    // Self-heal: drop the entry and refetch rather than fail the client
                    let err = ProxyError::CacheConsistency(err.to_string());
                    warn!("Discarding cached entry for {}: {}", key, err);
                    self.cache.remove(&key);
                }
            },
            Lookup::Stale => debug!("Cache entry for {} expired", key),
            Lookup::Miss => debug!("Cache miss for {}", key),
        }

        let mut message = self.resolve_upstream(key, query, datagram).await?;
        message.set_id(request_id);
        let reply = codec::encode(&message)?;
        fit_to_payload(&message, reply, limit)
    }

    /// Resolves upstream and stores a successful result in the cache.
    ///
    /// With single-flight the store happens inside the shared lookup, so the
    /// result is cached even when the task that started it is dropped.
    async fn resolve_upstream(
        &self,
        key: CacheKey,
        query: Message,
        raw: &[u8],
    ) -> Result<Message, ProxyError> {
        if !self.single_flight {
            let message = self.resolver.resolve(&query, raw).await?;
            self.cache.store(key, message.clone(), Instant::now());
            return Ok(message);
        }

        let (lookup, guard) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight lookup for {}", key);
                (entry.get().clone(), None)
            }
            Entry::Vacant(entry) => {
                let resolver = Arc::clone(&self.resolver);
                let cache = Arc::clone(&self.cache);
                let raw = raw.to_vec();
                let store_key = key.clone();
                let lookup = async move {
                    let result = resolver.resolve(&query, &raw).await;
                    if let Ok(message) = &result {
                        cache.store(store_key, message.clone(), Instant::now());
                    }
                    result
                }
                .boxed()
                .shared();
                entry.insert(lookup.clone());
                let guard = InFlightGuard {
                    table: &self.in_flight,
                    key,
                };
                (lookup, Some(guard))
            }
        };

        let result = lookup.await;
        // The cache already holds the result, so the lookup can be unregistered
        drop(guard);
        result
    }
}

/// Replaces an oversized reply with a header-only one carrying the TC bit.
///
/// `limit` is the client's advertised EDNS payload size, or 512 without EDNS.
fn fit_to_payload(message: &Message, reply: Vec<u8>, limit: usize) -> Result<Vec<u8>, ProxyError> {
    if reply.len() <= limit {
        return Ok(reply);
    }

    debug!(
        "Truncating {} byte reply for query id={} to fit {} bytes",
        reply.len(),
        message.id(),
        limit
    );

    let mut truncated = Message::new();
    truncated
        .set_id(message.id())
        .set_message_type(MessageType::Response)
        .set_op_code(message.op_code())
        .set_response_code(message.response_code())
        .set_recursion_desired(message.recursion_desired())
        .set_recursion_available(message.recursion_available())
        .set_truncated(true)
        .add_queries(message.queries().to_vec());
    codec::encode(&truncated)
}

/// Removes a pending lookup from the table when its leader finishes or is dropped
struct InFlightGuard<'a> {
    table: &'a DashMap<CacheKey, SharedLookup>,
    key: CacheKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}
