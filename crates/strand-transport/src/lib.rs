//! # strand Transport
//!
//! Datagram transport consumed by the strand transport core.
//!
//! The core assumes nothing beyond an unreliable, unordered, at-most-once
//! datagram service: packets may be lost, reordered or duplicated, and a
//! completed send only means the datagram left this process.
//!
//! This crate provides:
//! - [`transport::Transport`]: the async trait every backend implements
//! - [`udp_async::AsyncUdpTransport`]: tokio UDP with `socket2` buffer sizing
//! - [`memory::MemoryNetwork`]: an in-process network with configurable loss,
//!   duplication and reordering for deterministic tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod udp_async;

pub use memory::{MemoryNetwork, MemoryTransport, SimulatorConfig};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::AsyncUdpTransport;

/// Largest datagram the transports will carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Socket-level transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size requested from the OS
    pub recv_buffer_size: usize,
    /// Send buffer size requested from the OS
    pub send_buffer_size: usize,
    /// Allow rebinding a recently used address
    pub reuse_address: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            reuse_address: false,
        }
    }
}
