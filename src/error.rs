//! Error taxonomy for the resolution path
//!
//! Errors are grouped by how the dispatcher reacts to them:
//! - `Codec` and `CacheConsistency` are local and recovered by resolving upstream again
//! - `Transport`, `Timeout` and retriable `UpstreamStatus` values are retried
//! - `Exhausted` means the retry budget is spent and the query is dropped
//!
//! The type is `Clone` so one upstream outcome can be handed to every
//! waiter that joined the same in-flight lookup.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Malformed DNS wire data
    #[error("codec error: {0}")]
    Codec(String),

    /// Network failure talking to an upstream
    #[error("transport error: {0}")]
    Transport(String),

    /// A single attempt ran past its deadline
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream answered with a non-success HTTP status
    #[error("upstream returned HTTP status {0}")]
    UpstreamStatus(u16),

    /// A cached entry could not be turned back into a reply
    #[error("cached entry unusable: {0}")]
    CacheConsistency(String),

    #[error("upstream failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ProxyError> },

    #[error("no upstream endpoints configured")]
    NoEndpoints,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProxyError {
    /// Whether another attempt may succeed where this one failed.
    ///
    /// Rate limiting (429) and server errors are worth retrying; other
    /// client errors will fail the same way every time.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProxyError::Transport(_) | ProxyError::Timeout(_) => true,
            ProxyError::UpstreamStatus(status) => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

impl From<trust_dns_resolver::proto::error::ProtoError> for ProxyError {
    fn from(err: trust_dns_resolver::proto::error::ProtoError) -> Self {
        ProxyError::Codec(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProxyError::UpstreamStatus(status.as_u16()),
            None => ProxyError::Transport(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Transport(err.to_string())
    }
}
