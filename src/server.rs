//! UDP listener
//!
//! One receive loop owns the listening socket and hands each datagram to
//! its own task, so a slow upstream lookup never holds up other queries.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dispatcher::QueryDispatcher;

/// Largest query datagram read from clients
pub const MAX_QUERY_SIZE: usize = 4096;

/// Smallest datagram that can hold a DNS header
const HEADER_LEN: usize = 12;

pub struct DnsServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<QueryDispatcher>,
}

impl DnsServer {
    /// Binds the listening socket. Failure here is fatal for the proxy.
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<QueryDispatcher>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;

        Ok(Self {
            socket: Arc::new(socket),
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Serves queries until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("DNS proxy listening on {}", self.local_addr()?);

        tokio::select! {
            _ = self.receive_loop() => {}
            _ = shutdown => info!("Shutting down listener"),
        }

        info!("{} cached entries at shutdown", self.dispatcher.cache().len());
        Ok(())
    }

    async fn receive_loop(&self) {
        let mut buf = vec![0u8; MAX_QUERY_SIZE];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    // Per-datagram errors (e.g. ICMP port unreachable) must not stop the listener
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            };

            if len < HEADER_LEN {
                warn!("Ignoring {} byte datagram from {}", len, peer);
                continue;
            }

            let datagram = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let dispatcher = Arc::clone(&self.dispatcher);

            tokio::spawn(async move {
                let Some(reply) = dispatcher.handle(peer, &datagram).await else {
                    return;
                };
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!("Failed to send reply to {}: {}", peer, e);
                }
            });
        }
    }
}
