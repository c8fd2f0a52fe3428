//! # strand Core
//!
//! Transport core of the strand overlay network.
//!
//! This crate provides:
//! - Message chunking and bounded, timeout-guarded reassembly
//! - A TCP-like reliable connection (handshake, retransmission, teardown)
//! - Deadline timers and RFC 6298 RTO estimation
//! - The [`node::Node`] runtime wiring these to discovery and transport
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Application                             │
//! │        (send(recipient, payload), NodeEvent notifications)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Chunking (per channel)                       │
//! │   (split oversized payloads, reassemble in order, bounded)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Reliable connection (optional)                   │
//! │   (ordered records, retransmission, idle probes, close)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Envelope + path selection                       │
//! │   (network id, hop budget, PathRegistry, relay via super peer)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod connection;
pub mod error;
pub mod node;
pub mod timer;

pub use chunk::{
    Chunk, ChunkCodec, ChunkConfig, ChunkReassemblyBuffer, ChunkSplitter, Decoded,
    ReassemblyState, SequenceWidth,
};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionState, Control, RecordId, ReliableConnection,
    Role, Segment,
};
pub use error::{Error, Result};
pub use node::{Node, NodeConfig, NodeError, NodeEvent};
pub use timer::{RtoEstimator, Timer};
