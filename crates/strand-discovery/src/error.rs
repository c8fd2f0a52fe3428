//! Discovery error types.

use std::time::Duration;
use strand_crypto::PeerAddress;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// No super peer confirmed registration before the guard fired
    #[error("no super peer reachable within {0:?}")]
    SuperPeerUnreachable(Duration),

    /// Every port mapping strategy failed
    #[error("all port mapping strategies exhausted")]
    NatMappingExhausted,

    /// The super peer guard was cancelled before it resolved
    #[error("super peer guard cancelled")]
    GuardCancelled,

    /// The address is already a member of this network on the hub
    #[error("peer {peer} already joined network {1}", peer = .0.short())]
    AlreadyJoined(PeerAddress, u32),

    /// The registry event stream was closed
    #[error("path event stream closed")]
    EventsClosed,
}

impl DiscoveryError {
    /// Returns true if the node should abort startup on this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, DiscoveryError::SuperPeerUnreachable(_))
    }
}
