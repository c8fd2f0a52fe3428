//! Node runtime
//!
//! ```text
//!                  Node::send(peer, payload)
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────┐
//! │ channel task (one per peer)                     │
//! │   ChunkSplitter ─▶ ReliableConnection ─▶ armor  │
//! │   ChunkReassemblyBuffer ◀─ segments ◀─ unarmor  │
//! └────────────────────────┬────────────────────────┘
//!                          │ Application envelopes
//!                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │ PathRegistry: intra-process │ direct │ relay    │
//! └──────────┬─────────────────────────┬────────────┘
//!            ▼                         ▼
//!     IntraProcessHub            Transport (UDP)
//! ```
//!
//! Discovery (hello, ack, unite, relaying) lives in [`discovery`]; the wire
//! envelope in [`envelope`].

pub(crate) mod channel;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod event;
#[allow(clippy::module_inception)]
pub mod node;

pub use config::{DEFAULT_PORT, NodeConfig, PortMapStrategy, PortMappingConfig};
pub use envelope::{ENVELOPE_HEADER_LEN, ENVELOPE_MAGIC, Envelope, EnvelopeKind, Hello, Unite};
pub use error::{NodeError, Result};
pub use event::NodeEvent;
pub use node::Node;
