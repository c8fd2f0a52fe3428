//! Paths and path lifecycle events.
//!
//! A path is one concrete way to reach a peer. Lower priority values are
//! preferred: an intra-process path beats a static route, which beats a
//! direct UDP path learned from discovery, which beats relaying through a
//! super peer.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use strand_crypto::PeerAddress;

/// Identifies the discovery mechanism that produced a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathId {
    /// Another node in the same process, reached through the hub
    IntraProcess,
    /// Endpoint from the static route table
    Static,
    /// Direct UDP endpoint learned through hello/unite exchange
    Direct,
    /// Traffic relayed by a super peer
    Relay,
}

impl PathId {
    /// Conventional priority for paths of this kind
    #[must_use]
    pub const fn default_priority(self) -> i16 {
        match self {
            PathId::IntraProcess => 1,
            PathId::Static => 5,
            PathId::Direct => 10,
            PathId::Relay => 20,
        }
    }

    /// Short name used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PathId::IntraProcess => "intra-process",
            PathId::Static => "static",
            PathId::Direct => "udp",
            PathId::Relay => "relay",
        }
    }

    /// Paths that expire without hello traffic
    #[must_use]
    pub const fn is_expiring(self) -> bool {
        matches!(self, PathId::Direct | PathId::Relay)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known path to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Mechanism that produced the path
    pub id: PathId,
    /// Lower is preferred
    pub priority: i16,
    /// Underlying transport address, if the path has one
    pub endpoint: Option<SocketAddr>,
    /// Last time traffic or discovery confirmed the path
    pub last_seen: Instant,
    /// Last measured round-trip time
    pub rtt_millis: Option<u32>,
}

impl Path {
    /// Create a path seen now
    #[must_use]
    pub fn new(id: PathId, endpoint: Option<SocketAddr>, priority: i16) -> Self {
        Self {
            id,
            priority,
            endpoint,
            last_seen: Instant::now(),
            rtt_millis: None,
        }
    }

    /// True if `self` should be used in preference to `other`
    #[must_use]
    pub fn is_better_than(&self, other: &Path) -> bool {
        (self.priority, std::cmp::Reverse(self.last_seen))
            < (other.priority, std::cmp::Reverse(other.last_seen))
    }
}

/// Path lifecycle notification, compared by value for deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvent {
    /// First path to a previously unknown peer
    PeerAdded {
        /// Peer
        peer: PeerAddress,
        /// Path that made the peer known
        path: PathId,
        /// Underlying address
        endpoint: Option<SocketAddr>,
    },
    /// Last path to a peer was withdrawn
    PeerRemoved {
        /// Peer
        peer: PeerAddress,
        /// Path that was withdrawn last
        path: PathId,
    },
    /// Peer became reachable as our super peer
    SuperPeerAdded {
        /// Super peer
        peer: PeerAddress,
        /// Path to the super peer
        path: PathId,
        /// Underlying address
        endpoint: Option<SocketAddr>,
    },
    /// Super peer lost its last path
    SuperPeerRemoved {
        /// Super peer
        peer: PeerAddress,
        /// Path that was withdrawn last
        path: PathId,
    },
    /// Peer registered with us as its super peer
    ChildrenAdded {
        /// Child peer
        peer: PeerAddress,
        /// Path to the child
        path: PathId,
        /// Underlying address
        endpoint: Option<SocketAddr>,
    },
    /// Child peer lost its last path
    ChildrenRemoved {
        /// Child peer
        peer: PeerAddress,
        /// Path that was withdrawn last
        path: PathId,
    },
    /// New round-trip measurement
    RttUpdated {
        /// Peer
        peer: PeerAddress,
        /// Measured path
        path: PathId,
        /// Underlying address
        endpoint: Option<SocketAddr>,
        /// Round-trip time in milliseconds
        rtt_millis: u32,
    },
}

impl PathEvent {
    /// Peer the event is about
    #[must_use]
    pub fn peer(&self) -> PeerAddress {
        match self {
            PathEvent::PeerAdded { peer, .. }
            | PathEvent::PeerRemoved { peer, .. }
            | PathEvent::SuperPeerAdded { peer, .. }
            | PathEvent::SuperPeerRemoved { peer, .. }
            | PathEvent::ChildrenAdded { peer, .. }
            | PathEvent::ChildrenRemoved { peer, .. }
            | PathEvent::RttUpdated { peer, .. } => *peer,
        }
    }

    /// Path the event is about
    #[must_use]
    pub fn path(&self) -> PathId {
        match self {
            PathEvent::PeerAdded { path, .. }
            | PathEvent::PeerRemoved { path, .. }
            | PathEvent::SuperPeerAdded { path, .. }
            | PathEvent::SuperPeerRemoved { path, .. }
            | PathEvent::ChildrenAdded { path, .. }
            | PathEvent::ChildrenRemoved { path, .. }
            | PathEvent::RttUpdated { path, .. } => *path,
        }
    }

    /// True for events announcing reachability
    #[must_use]
    pub fn is_addition(&self) -> bool {
        matches!(
            self,
            PathEvent::PeerAdded { .. }
                | PathEvent::SuperPeerAdded { .. }
                | PathEvent::ChildrenAdded { .. }
        )
    }

    /// True for events announcing loss of reachability
    #[must_use]
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            PathEvent::PeerRemoved { .. }
                | PathEvent::SuperPeerRemoved { .. }
                | PathEvent::ChildrenRemoved { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_priorities_ordered() {
        assert!(PathId::IntraProcess.default_priority() < PathId::Static.default_priority());
        assert!(PathId::Static.default_priority() < PathId::Direct.default_priority());
        assert!(PathId::Direct.default_priority() < PathId::Relay.default_priority());
    }

    #[test]
    fn test_display() {
        assert_eq!(PathId::Direct.to_string(), "udp");
        assert_eq!(PathId::Relay.to_string(), "relay");
    }

    #[test]
    fn test_is_better_than_priority() {
        let udp = Path::new(PathId::Direct, None, 10);
        let relay = Path::new(PathId::Relay, None, 20);
        assert!(udp.is_better_than(&relay));
        assert!(!relay.is_better_than(&udp));
    }

    #[test]
    fn test_is_better_than_tie_prefers_recent() {
        let mut older = Path::new(PathId::Direct, None, 10);
        let newer = Path::new(PathId::Static, None, 10);
        older.last_seen = newer.last_seen - Duration::from_secs(5);
        assert!(newer.is_better_than(&older));
    }

    #[test]
    fn test_event_accessors() {
        let peer = PeerAddress::from_bytes([1; 32]);
        let event = PathEvent::RttUpdated {
            peer,
            path: PathId::Direct,
            endpoint: None,
            rtt_millis: 12,
        };
        assert_eq!(event.peer(), peer);
        assert_eq!(event.path(), PathId::Direct);
        assert!(!event.is_addition());
        assert!(!event.is_removal());

        let added = PathEvent::SuperPeerAdded {
            peer,
            path: PathId::Direct,
            endpoint: None,
        };
        assert!(added.is_addition());
    }
}
