//! Transport trait abstraction for datagram backends.
//!
//! Every backend (UDP socket, in-memory test network) implements
//! [`Transport`]. The node above it never assumes ordering or delivery: the
//! reliable connection layer restores both where the application needs them.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Datagram exceeds what the backend can carry
    #[error("Datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge {
        /// Offered size
        size: usize,
        /// Backend limit
        max: usize,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// `send_to` resolves once the backend accepted the datagram. It says nothing
/// about delivery.
///
/// # Examples
///
/// ```no_run
/// use strand_transport::transport::Transport;
/// use strand_transport::udp_async::AsyncUdpTransport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = AsyncUdpTransport::bind(addr).await?;
///
/// transport.send_to(b"hello", "127.0.0.1:22527".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// println!("Received {} bytes from {}", size, from);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to a remote address.
    ///
    /// # Errors
    /// Returns `TransportError` if the backend rejects the datagram
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram.
    ///
    /// Returns the number of bytes written into `buf` and the sender's address.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails or the
    /// transport was closed
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport.
    ///
    /// Later sends and receives return `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Snapshot of transport counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
    /// Datagrams dropped by the backend (simulated loss)
    pub dropped: u64,
}

/// Lock-free counters shared by transport backends
#[derive(Debug, Default)]
pub struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCounters {
    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped datagram
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
