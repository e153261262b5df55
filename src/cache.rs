//! In-memory resolution cache with read-time TTL decay
//!
//! Entries are keyed by the question sequence of the query that produced
//! them and hold the decoded upstream response plus the instant it was
//! stored. Nothing expires in the background: remaining TTLs are computed
//! on every lookup, and an entry whose shortest answer TTL has run out is
//! removed by the lookup that finds it.
//!
//! Responses without answer records (NXDOMAIN, NODATA) have no TTL to decay
//! from, so they live for a fixed negative-caching period instead.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use trust_dns_resolver::proto::op::Message;

use crate::codec::{min_answer_ttl, CacheKey};

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// A valid entry, already decayed and carrying the requester's id
    Hit(Message),
    /// An entry existed but had expired; it has been removed
    Stale,
    Miss,
}

struct CacheEntry {
    message: Message,
    inserted_at: Instant,
}

/// Concurrent TTL-aware response cache
///
/// The cache is unbounded; entries leave only when a lookup finds them
/// expired or when [`ResolutionCache::remove`] is called.
///
/// # Examples
///
/// ```
/// use dnsveil::cache::{Lookup, ResolutionCache};
/// use dnsveil::codec::CacheKey;
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// let cache = ResolutionCache::new(Duration::from_secs(30));
/// let key = CacheKey::from_queries(&[]);
/// assert_eq!(cache.lookup(&key, 7, Instant::now()), Lookup::Miss);
/// ```
pub struct ResolutionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    negative_ttl: Duration,
}

impl ResolutionCache {
    /// Creates an empty cache.
    ///
    /// `negative_ttl` is how long answerless responses stay valid;
    /// `Duration::ZERO` disables caching them.
    pub fn new(negative_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            negative_ttl,
        }
    }

    /// Looks up `key` as of `now`.
    ///
    /// On a hit every answer TTL is reduced by the whole seconds elapsed
    /// since the entry was stored (never below zero), and the returned
    /// message carries `request_id`. The stored entry is never modified.
    pub fn lookup(&self, key: &CacheKey, request_id: u16, now: Instant) -> Lookup {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Miss;
        };

        let elapsed = now.saturating_duration_since(entry.inserted_at);
        if elapsed < self.lifetime(&entry.message) {
            return Lookup::Hit(decay(&entry.message, elapsed, request_id));
        }

        let inserted_at = entry.inserted_at;
        drop(entry);

        // Only evict the entry judged stale, not one a concurrent writer just stored
        self.entries
            .remove_if(key, |_, entry| entry.inserted_at == inserted_at);
        debug!("Evicted stale cache entry for {} after {:?}", key, elapsed);
        Lookup::Stale
    }

    /// Stores `message` under `key`, replacing any previous entry.
    ///
    /// Returns `false` when the message would already be expired at
    /// insertion (a zero TTL, or no answers with negative caching off).
    pub fn store(&self, key: CacheKey, message: Message, now: Instant) -> bool {
        if self.lifetime(&message).is_zero() {
            debug!("Not caching {}: zero lifetime", key);
            return false;
        }

        self.entries.insert(
            key,
            CacheEntry {
                message,
                inserted_at: now,
            },
        );
        true
    }

    /// Drops the entry for `key`, if any.
    pub fn remove(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lifetime(&self, message: &Message) -> Duration {
        match min_answer_ttl(message) {
            Some(ttl) => Duration::from_secs(u64::from(ttl)),
            None => self.negative_ttl,
        }
    }
}

/// Copies `message` with answer TTLs reduced by `elapsed` and the id replaced.
fn decay(message: &Message, elapsed: Duration, request_id: u16) -> Message {
    let elapsed_secs = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);

    let mut copy = message.clone();
    let answers = copy
        .take_answers()
        .into_iter()
        .map(|mut record| {
            let remaining = record.ttl().saturating_sub(elapsed_secs);
            record.set_ttl(remaining);
            record
        })
        .collect();
    copy.insert_answers(answers);
    copy.set_id(request_id);
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use trust_dns_resolver::proto::op::{MessageType, Query};
    use trust_dns_resolver::proto::rr::rdata::TXT;
    use trust_dns_resolver::proto::rr::{Name, RData, Record, RecordType};

    fn response(id: u16, ttls: &[u32]) -> Message {
        let name = Name::from_ascii("example.com.").unwrap();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .add_query(Query::query(name.clone(), RecordType::TXT));
        for ttl in ttls {
            message.add_answer(Record::from_rdata(
                name.clone(),
                *ttl,
                RData::TXT(TXT::new(vec!["v".to_string()])),
            ));
        }
        message
    }

    #[test]
    fn test_decay_leaves_original_untouched() {
        let original = response(1, &[100]);
        let decayed = decay(&original, Duration::from_millis(42_900), 9);

        assert_eq!(decayed.answers()[0].ttl(), 58);
        assert_eq!(decayed.id(), 9);
        assert_eq!(original.answers()[0].ttl(), 100);
        assert_eq!(original.id(), 1);
    }

    #[test]
    fn test_decay_clamps_at_zero() {
        let decayed = decay(&response(1, &[5, 500]), Duration::from_secs(60), 1);
        let ttls: Vec<u32> = decayed.answers().iter().map(|r| r.ttl()).collect();
        assert_eq!(ttls, vec![0, 440]);
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let cache = ResolutionCache::new(Duration::from_secs(30));
        let msg = response(1, &[0, 300]);
        let key = CacheKey::from_message(&msg);

        assert!(!cache.store(key, msg, Instant::now()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_answerless_response_uses_negative_ttl() {
        let cache = ResolutionCache::new(Duration::from_secs(30));
        let msg = response(1, &[]);
        let key = CacheKey::from_message(&msg);
        let t0 = Instant::now();

        assert!(cache.store(key.clone(), msg, t0));
        assert!(matches!(
            cache.lookup(&key, 2, t0 + Duration::from_secs(29)),
            Lookup::Hit(m) if m.id() == 2
        ));
        assert_eq!(cache.lookup(&key, 2, t0 + Duration::from_secs(30)), Lookup::Stale);
    }

    #[test]
    fn test_negative_caching_disabled() {
        let cache = ResolutionCache::new(Duration::ZERO);
        let msg = response(1, &[]);
        let key = CacheKey::from_message(&msg);

        assert!(!cache.store(key, msg, Instant::now()));
    }
}
