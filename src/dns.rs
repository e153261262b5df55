use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;

/// Largest reply datagram accepted from the secondary resolver
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Plain DNS resolver reached over UDP
///
/// Queries are forwarded byte for byte from a fresh ephemeral socket and
/// the first reply datagram is returned unmodified. There is no retry.
#[derive(Debug, Clone)]
pub struct SecondaryResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl SecondaryResolver {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Sends `query` to the server and waits for one reply.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        // connect() makes the kernel drop datagrams from any other source
        socket.connect(self.server).await?;
        socket.send(query).await?;

        debug!("Forwarded {} byte query to {}", query.len(), self.server);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;
        buf.truncate(len);

        debug!("Received {} byte reply from {}", len, self.server);
        Ok(buf)
    }
}
