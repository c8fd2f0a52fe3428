//! Notifications delivered to the application.

use crate::error::Error;
use strand_crypto::PeerAddress;

/// Node notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A complete application message arrived
    MessageReceived {
        /// Sending node
        sender: PeerAddress,
        /// Reassembled payload
        payload: Vec<u8>,
    },
    /// A peer became reachable
    PeerPathAdded {
        /// Peer
        peer: PeerAddress,
    },
    /// The last path to a peer went away
    PeerPathRemoved {
        /// Peer
        peer: PeerAddress,
    },
    /// Reliable connection handshake completed
    ConnectionEstablished {
        /// Peer
        peer: PeerAddress,
    },
    /// Reliable connection started closing
    ConnectionClosing {
        /// Peer
        peer: PeerAddress,
        /// True if the peer closed first
        initiated_by_remote: bool,
    },
    /// Reliable connection failed
    ConnectionFailed {
        /// Peer
        peer: PeerAddress,
        /// Cause
        error: Error,
    },
    /// Startup finished (super peer registered, if any were configured)
    NodeOnline,
    /// Node shut down
    NodeOffline,
}
