// dnsveil: caching DNS proxy resolving over DNS-over-HTTPS
// Exposes the proxy's components as a library

pub mod cache;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod http;
pub mod rate_limit;
pub mod retry;
pub mod server;
pub mod upstream;
