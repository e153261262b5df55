#![allow(dead_code)]

use async_trait::async_trait;
use dnsveil::codec;
use dnsveil::error::ProxyError;
use dnsveil::http::DohExchange;
use dnsveil::upstream::Resolve;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use trust_dns_resolver::proto::op::{Message, MessageType, Query};
use trust_dns_resolver::proto::rr::rdata::TXT;
use trust_dns_resolver::proto::rr::{Name, RData, Record, RecordType};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Id every fake upstream stamps on its responses
pub const UPSTREAM_ID: u16 = 0xBEEF;

/// Client address handed to the dispatcher in tests
pub const PEER: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 40000);

pub fn query_message(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
    message
}

pub fn query_bytes(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
    codec::encode(&query_message(id, name, rtype)).unwrap()
}

/// Builds an upstream response to `query` with one TXT answer per TTL.
pub fn response_for(query: &Message, ttls: &[u32]) -> Message {
    let mut message = Message::new();
    message
        .set_id(UPSTREAM_ID)
        .set_message_type(MessageType::Response)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .add_queries(query.queries().to_vec());

    let name = query.queries()[0].name().clone();
    for (i, ttl) in ttls.iter().enumerate() {
        message.add_answer(Record::from_rdata(
            name.clone(),
            *ttl,
            RData::TXT(TXT::new(vec![format!("answer-{}", i)])),
        ));
    }
    message
}

pub fn answer_ttls(message: &Message) -> Vec<u32> {
    message.answers().iter().map(|r| r.ttl()).collect()
}

/// Resolver answering every query locally and counting invocations
pub struct FakeResolver {
    ttls: Vec<u32>,
    delay: Duration,
    slow_name: Option<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn answering(ttls: &[u32]) -> Self {
        Self {
            ttls: ttls.to_vec(),
            delay: Duration::ZERO,
            slow_name: None,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::answering(&[])
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Applies the delay only to queries for `name`.
    pub fn slow_for(mut self, name: &str) -> Self {
        self.slow_name = Some(name.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn resolve(&self, query: &Message, _raw: &[u8]) -> Result<Message, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let slow = match &self.slow_name {
            Some(name) => query.queries()[0].name().to_string() == *name,
            None => true,
        };
        if slow && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ProxyError::Exhausted {
                attempts: 3,
                last: Box::new(ProxyError::Transport("connection refused".to_string())),
            });
        }
        Ok(response_for(query, &self.ttls))
    }
}

/// DoH exchange replaying scripted outcomes, then a fallback outcome forever
pub struct ScriptedExchange {
    script: Mutex<VecDeque<Result<Vec<u8>, ProxyError>>>,
    fallback: Result<Vec<u8>, ProxyError>,
    delay: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedExchange {
    pub fn always(outcome: Result<Vec<u8>, ProxyError>) -> Self {
        Self::scripted(Vec::new(), outcome)
    }

    pub fn scripted(
        script: Vec<Result<Vec<u8>, ProxyError>>,
        fallback: Result<Vec<u8>, ProxyError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl DohExchange for ScriptedExchange {
    async fn post_dns_message(&self, endpoint: &str, _query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), Instant::now()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Collects formatted log output for assertions
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's `tracing` events into the capture until the guard drops.
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Lines logged at `level` that contain every one of `needles`.
    pub fn matching(&self, level: &str, needles: &[&str]) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains(level) && needles.iter().all(|n| line.contains(n)))
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
