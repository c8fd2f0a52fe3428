//! Async UDP transport.
//!
//! Binds through `socket2` so buffer sizes and address reuse can be set
//! before handing the socket to tokio.

use crate::transport::{StatsCounters, Transport, TransportError, TransportResult, TransportStats};
use crate::{MAX_DATAGRAM_SIZE, TransportConfig};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Async UDP transport using Tokio.
///
/// Cloning shares the socket and counters.
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<StatsCounters>,
}

impl AsyncUdpTransport {
    /// Bind with default socket options.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with(addr.into(), &TransportConfig::default()).await
    }

    /// Bind with explicit socket options.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound
    pub async fn bind_with(addr: SocketAddr, config: &TransportConfig) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_err)?;
        socket
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_err)?;
        socket
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_err)?;
        socket
            .set_reuse_address(config.reuse_address)
            .map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;
        tracing::debug!("UDP transport bound to {:?}", socket.local_addr().ok());

        Ok(Self::from_socket(socket))
    }

    /// Wrap an already-bound Tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(StatsCounters::default()),
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::DatagramTooLarge {
                size: buf.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.record_send(sent);
                Ok(sent)
            }
            Err(e) => {
                self.counters.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.counters.record_recv(size);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.record_recv_error();
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let bound = transport.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
        assert!(bound.is_ipv4());
    }

    #[tokio::test]
    async fn test_udp_send_recv() {
        let server = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let client = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let sent = client.send_to(b"strand datagram", server_addr).await.unwrap();
        assert_eq!(sent, 15);

        let mut buf = vec![0u8; 1500];
        let (size, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..size], b"strand datagram");
        assert_eq!(from, client.local_addr().unwrap());

        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().bytes_received, 15);
    }

    #[tokio::test]
    async fn test_udp_closed() {
        let transport = AsyncUdpTransport::bind(loopback()).await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        let result = transport.send_to(b"x", "127.0.0.1:9".parse().unwrap()).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_udp_oversized_rejected() {
        let transport = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let result = transport.send_to(&big, "127.0.0.1:9".parse().unwrap()).await;
        assert!(matches!(result, Err(TransportError::DatagramTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_udp_clone_shares_socket() {
        let transport = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let clone = transport.clone();
        assert_eq!(
            transport.local_addr().unwrap(),
            clone.local_addr().unwrap()
        );
        clone.close().await.unwrap();
        assert!(transport.is_closed());
    }
}
