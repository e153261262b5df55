//! DNS wire codec boundary and cache keys
//!
//! Wire parsing is delegated to the trust-dns protocol types; this module
//! only adapts them to the proxy's error type and derives the values the
//! cache needs from a decoded message.

use std::fmt;

use trust_dns_resolver::proto::op::{Message, Query};
use trust_dns_resolver::proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::error::ProxyError;

/// Decodes a raw DNS datagram.
pub fn decode(bytes: &[u8]) -> Result<Message, ProxyError> {
    Ok(Message::from_bytes(bytes)?)
}

/// Encodes a message to wire format.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProxyError> {
    Ok(message.to_bytes()?)
}

/// Smallest TTL across the answer section, `None` when there are no answers.
pub fn min_answer_ttl(message: &Message) -> Option<u32> {
    message.answers().iter().map(|record| record.ttl()).min()
}

/// Key identifying a question sequence.
///
/// Order-sensitive: the same questions in a different order produce a
/// different key. Names are kept exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_queries(queries: &[Query]) -> Self {
        let mut key = String::with_capacity(queries.len() * 32);
        for query in queries {
            // '|' and ';' cannot appear unescaped in a presentation-format name
            key.push_str(&query.name().to_string());
            key.push('|');
            key.push_str(&u16::from(query.query_type()).to_string());
            key.push('|');
            key.push_str(&u16::from(query.query_class()).to_string());
            key.push(';');
        }
        Self(key)
    }

    pub fn from_message(message: &Message) -> Self {
        Self::from_queries(message.queries())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trust_dns_resolver::proto::op::message::{update_header_counts, HeaderCounts};
    use trust_dns_resolver::proto::op::MessageType;
    use trust_dns_resolver::proto::rr::rdata::TXT;
    use trust_dns_resolver::proto::rr::{DNSClass, Name, RData, Record, RecordType};

    fn query(name: &str, rtype: RecordType) -> Query {
        Query::query(Name::from_ascii(name).unwrap(), rtype)
    }

    fn response_with_ttls(ttls: &[u32]) -> Message {
        let name = Name::from_ascii("example.com.").unwrap();
        let mut message = Message::new();
        message
            .set_id(0x1234)
            .set_message_type(MessageType::Response)
            .add_query(Query::query(name.clone(), RecordType::TXT));
        for ttl in ttls {
            message.add_answer(Record::from_rdata(
                name.clone(),
                *ttl,
                RData::TXT(TXT::new(vec!["hello".to_string()])),
            ));
        }
        message
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut message = response_with_ttls(&[300, 60]);
        let header = update_header_counts(
            message.header(),
            message.truncated(),
            HeaderCounts {
                query_count: message.queries().len(),
                answer_count: message.answers().len(),
                nameserver_count: message.name_servers().len(),
                additional_count: message.additionals().len(),
            },
        );
        message.set_header(header);
        let bytes = encode(&message).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(&[0x12]), Err(ProxyError::Codec(_))));
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_min_answer_ttl() {
        assert_eq!(min_answer_ttl(&response_with_ttls(&[300, 60, 120])), Some(60));
        assert_eq!(min_answer_ttl(&response_with_ttls(&[])), None);
    }

    #[test]
    fn test_cache_key_is_pure() {
        let a = CacheKey::from_queries(&[query("example.com.", RecordType::A)]);
        let b = CacheKey::from_queries(&[query("example.com.", RecordType::A)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_key_distinguishes_fields() {
        let a = CacheKey::from_queries(&[query("example.com.", RecordType::A)]);
        let aaaa = CacheKey::from_queries(&[query("example.com.", RecordType::AAAA)]);
        let other = CacheKey::from_queries(&[query("example.org.", RecordType::A)]);

        let mut chaos = query("example.com.", RecordType::A);
        chaos.set_query_class(DNSClass::CH);
        let chaos = CacheKey::from_queries(&[chaos]);

        assert_ne!(a, aaaa);
        assert_ne!(a, other);
        assert_ne!(a, chaos);
    }

    #[test]
    fn test_cache_key_is_order_sensitive() {
        let first = query("a.example.", RecordType::A);
        let second = query("b.example.", RecordType::A);

        let forward = CacheKey::from_queries(&[first.clone(), second.clone()]);
        let reversed = CacheKey::from_queries(&[second, first]);

        assert_ne!(forward, reversed);
    }
}
