//! Process-wide hub for nodes running in the same process.
//!
//! Nodes that share an [`IntraProcessHub`] (and a network id) reach each
//! other without sockets. The hub is an explicit object: create one per
//! process (or per test), pass it by reference into every node that should
//! use it, and let nodes [`join`](IntraProcessHub::join) on start and
//! [`leave`](IntraProcessHub::leave) on stop.

use crate::error::DiscoveryError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strand_crypto::PeerAddress;
use tokio::sync::{broadcast, mpsc};

const HUB_EVENT_CAPACITY: usize = 256;

/// Datagram handed between nodes of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntraDatagram {
    /// Sending node
    pub from: PeerAddress,
    /// Raw envelope bytes
    pub bytes: Vec<u8>,
}

/// Hub membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    /// A node joined a network
    Joined {
        /// Network id
        network_id: u32,
        /// Node address
        peer: PeerAddress,
    },
    /// A node left a network
    Left {
        /// Network id
        network_id: u32,
        /// Node address
        peer: PeerAddress,
    },
}

/// What a node gets back when it joins
#[derive(Debug)]
pub struct HubMembership {
    /// Datagrams addressed to the joining node
    pub inbox: mpsc::UnboundedReceiver<IntraDatagram>,
    /// Membership changes after the join
    pub events: broadcast::Receiver<HubEvent>,
    /// Members of the network at join time, excluding the joiner
    pub peers: Vec<PeerAddress>,
}

/// Explicit process-wide registry of local nodes
#[derive(Debug)]
pub struct IntraProcessHub {
    members: DashMap<(u32, PeerAddress), mpsc::UnboundedSender<IntraDatagram>>,
    events: broadcast::Sender<HubEvent>,
}

impl IntraProcessHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(HUB_EVENT_CAPACITY);
        Self {
            members: DashMap::new(),
            events,
        }
    }

    /// Register `peer` in `network_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::AlreadyJoined`] if the address is already a member.
    pub fn join(
        &self,
        network_id: u32,
        peer: PeerAddress,
    ) -> Result<HubMembership, DiscoveryError> {
        let events = self.events.subscribe();
        let (tx, inbox) = mpsc::unbounded_channel();
        match self.members.entry((network_id, peer)) {
            Entry::Occupied(_) => return Err(DiscoveryError::AlreadyJoined(peer, network_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        let peers = self.members(network_id)
            .into_iter()
            .filter(|p| *p != peer)
            .collect();
        tracing::debug!("Node {} joined intra-process network {}", peer.short(), network_id);
        let _ = self.events.send(HubEvent::Joined { network_id, peer });
        Ok(HubMembership {
            inbox,
            events,
            peers,
        })
    }

    /// Remove `peer` from `network_id`. No-op if not a member.
    pub fn leave(&self, network_id: u32, peer: PeerAddress) {
        if self.members.remove(&(network_id, peer)).is_some() {
            tracing::debug!("Node {} left intra-process network {}", peer.short(), network_id);
            let _ = self.events.send(HubEvent::Left { network_id, peer });
        }
    }

    /// Current members of a network
    #[must_use]
    pub fn members(&self, network_id: u32) -> Vec<PeerAddress> {
        self.members
            .iter()
            .filter(|e| e.key().0 == network_id)
            .map(|e| e.key().1)
            .collect()
    }

    /// Deliver `bytes` from `from` to `to`. Returns false if `to` is not a member.
    pub fn send(&self, network_id: u32, from: PeerAddress, to: PeerAddress, bytes: Vec<u8>) -> bool {
        match self.members.get(&(network_id, to)) {
            Some(tx) => tx.send(IntraDatagram { from, bytes }).is_ok(),
            None => false,
        }
    }
}

impl Default for IntraProcessHub {
    fn default() -> Self {
        Self::new()
    }
}
