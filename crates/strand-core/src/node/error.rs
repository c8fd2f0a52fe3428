//! Error types for the node runtime.
//!
//! Protocol failures keep their core [`Error`] kind so callers can match on
//! the closed taxonomy; the remaining variants describe the runtime around
//! it (transport, discovery, configuration, lifecycle).
//!
//! # Example
//!
//! ```no_run
//! use strand_core::node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use crate::error::Error;
use std::borrow::Cow;
use strand_crypto::PeerAddress;
use strand_discovery::DiscoveryError;
use strand_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Protocol Errors ============
    /// Failure reported by the transport core
    #[error(transparent)]
    Core(#[from] Error),

    // ============ Transport Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Discovery Errors ============
    /// Discovery operation failed
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// No path to the peer and no super peer to relay through
    #[error("No route to peer {}", .0.short())]
    NoRoute(PeerAddress),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Per-peer channel task is gone
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Core(e) => e.is_transient(),
            NodeError::Transport(_) | NodeError::NoRoute(_) | NodeError::Channel(_) => true,
            NodeError::Discovery(e) => !e.is_fatal(),
            NodeError::InvalidConfig(_) | NodeError::InvalidState(_) => false,
        }
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        NodeError::Channel(Cow::Borrowed(context))
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        NodeError::Transport(err.to_string().into())
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;
