//! Concurrent per-peer path table.
//!
//! The registry is the one structure shared by every channel and every
//! discovery mechanism of a node. It maps each [`PeerAddress`] to the set of
//! paths currently known for it, together with the peer's role (super peer,
//! children).
//!
//! # Concurrency
//!
//! Backed by [`DashMap`]: every mutation of a peer goes through the entry
//! API and therefore happens under that peer's shard lock, so readers never
//! observe a half-updated path set. Events are published after the lock is
//! released.
//!
//! # Events
//!
//! Reachability changes (peer added/removed, super peer and children
//! registrations) pass through a [`DuplicatePathEventFilter`] before being
//! broadcast. RTT measurements are always broadcast.

use crate::filter::DuplicatePathEventFilter;
use crate::path::{Path, PathEvent, PathId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use strand_crypto::PeerAddress;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Peer,
    SuperPeer,
    Children,
}

#[derive(Debug)]
struct PeerEntry {
    /// Sorted by priority, then most recently seen
    paths: Vec<Path>,
    role: Role,
}

impl PeerEntry {
    fn new(role: Role) -> Self {
        Self {
            paths: Vec::with_capacity(2),
            role,
        }
    }

    fn sort(&mut self) {
        self.paths.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
    }

    fn path_mut(&mut self, id: PathId) -> Option<&mut Path> {
        self.paths.iter_mut().find(|p| p.id == id)
    }

    /// Insert or refresh. Returns true if the path is new.
    fn upsert(&mut self, id: PathId, endpoint: Option<SocketAddr>, priority: i16) -> bool {
        let new = match self.path_mut(id) {
            Some(path) => {
                path.endpoint = endpoint.or(path.endpoint);
                path.priority = priority;
                path.last_seen = Instant::now();
                false
            }
            None => {
                self.paths.push(Path::new(id, endpoint, priority));
                true
            }
        };
        self.sort();
        new
    }
}

/// Where to send traffic for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Peer whose path is used (the recipient itself, or the super peer)
    pub via: PeerAddress,
    /// Chosen path of `via`
    pub path: Path,
}

impl Route {
    /// True if traffic goes through a super peer
    #[must_use]
    pub fn is_relayed(&self, recipient: &PeerAddress) -> bool {
        self.via != *recipient
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of known peers
    pub peers: usize,
    /// Total route lookups
    pub lookups: u64,
    /// Lookups that fell back to the super peer
    pub default_routes: u64,
    /// Lookups that found nothing
    pub misses: u64,
}

/// Per-peer path table
///
/// # Example
///
/// ```
/// use strand_discovery::{PathId, PathRegistry};
/// use strand_crypto::PeerAddress;
///
/// let registry = PathRegistry::new();
/// let peer = PeerAddress::from_bytes([1; 32]);
/// registry.add_path(peer, PathId::Direct, Some("10.0.0.1:22527".parse().unwrap()), 10);
/// registry.add_path(peer, PathId::Relay, None, 20);
/// assert_eq!(registry.best_path(&peer).unwrap().id, PathId::Direct);
/// ```
pub struct PathRegistry {
    peers: DashMap<PeerAddress, PeerEntry>,
    super_peer: Mutex<Option<PeerAddress>>,
    filter: DuplicatePathEventFilter,
    events: broadcast::Sender<PathEvent>,
    lookups: AtomicU64,
    default_routes: AtomicU64,
    misses: AtomicU64,
}

impl PathRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: DashMap::new(),
            super_peer: Mutex::new(None),
            filter: DuplicatePathEventFilter::new(),
            events,
            lookups: AtomicU64::new(0),
            default_routes: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Subscribe to path events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PathEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PathEvent) {
        if self.filter.should_emit(&event) {
            tracing::debug!("Path event: {:?}", event);
            let _ = self.events.send(event);
        } else {
            tracing::trace!("Suppressed duplicate path event: {:?}", event);
        }
    }

    fn default_super_peer(&self) -> Option<PeerAddress> {
        *self
            .super_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_default_super_peer(&self, peer: Option<PeerAddress>) {
        *self
            .super_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = peer;
    }

    fn add_with_role(
        &self,
        peer: PeerAddress,
        id: PathId,
        endpoint: Option<SocketAddr>,
        priority: i16,
        role: Role,
    ) -> bool {
        let (new_path, new_peer, promoted) = match self.peers.entry(peer) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let promoted = role != Role::Peer && entry.role != role;
                if promoted {
                    entry.role = role;
                }
                (entry.upsert(id, endpoint, priority), false, promoted)
            }
            Entry::Vacant(vacant) => {
                let mut entry = PeerEntry::new(role);
                entry.upsert(id, endpoint, priority);
                vacant.insert(entry);
                (true, true, role != Role::Peer)
            }
        };

        if role == Role::SuperPeer && self.default_super_peer().is_none() {
            self.set_default_super_peer(Some(peer));
        }

        if new_peer || promoted {
            let event = match role {
                Role::Peer => PathEvent::PeerAdded {
                    peer,
                    path: id,
                    endpoint,
                },
                Role::SuperPeer => PathEvent::SuperPeerAdded {
                    peer,
                    path: id,
                    endpoint,
                },
                Role::Children => PathEvent::ChildrenAdded {
                    peer,
                    path: id,
                    endpoint,
                },
            };
            self.emit(event);
        }
        if new_path {
            tracing::debug!(
                "Added path {} (priority {}) to peer {}",
                id,
                priority,
                peer.short()
            );
        }
        new_path
    }

    /// Insert or refresh the path `id` of `peer`.
    ///
    /// Returns true if the path did not exist before. Emits
    /// [`PathEvent::PeerAdded`] when this is the first path of the peer.
    pub fn add_path(
        &self,
        peer: PeerAddress,
        id: PathId,
        endpoint: Option<SocketAddr>,
        priority: i16,
    ) -> bool {
        self.add_with_role(peer, id, endpoint, priority, Role::Peer)
    }

    /// Like [`PathRegistry::add_path`], and mark the peer as a super peer.
    ///
    /// The first super peer becomes the default route. Emits
    /// [`PathEvent::SuperPeerAdded`].
    pub fn add_super_peer_path(
        &self,
        peer: PeerAddress,
        id: PathId,
        endpoint: Option<SocketAddr>,
        priority: i16,
    ) -> bool {
        self.add_with_role(peer, id, endpoint, priority, Role::SuperPeer)
    }

    /// Like [`PathRegistry::add_path`], and mark the peer as registered
    /// through us. Emits [`PathEvent::ChildrenAdded`].
    pub fn add_children_path(
        &self,
        peer: PeerAddress,
        id: PathId,
        endpoint: Option<SocketAddr>,
        priority: i16,
    ) -> bool {
        self.add_with_role(peer, id, endpoint, priority, Role::Children)
    }

    /// Remove the path `id` of `peer`.
    ///
    /// Returns true if the path existed. When it was the peer's last path the
    /// peer is forgotten and a removal event matching its role is emitted.
    /// The duplicate filter then drops its memory of the peer.
    pub fn remove_path(&self, peer: &PeerAddress, id: PathId) -> bool {
        let (removed, emptied_role) = match self.peers.entry(*peer) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let before = entry.paths.len();
                entry.paths.retain(|p| p.id != id);
                let removed = entry.paths.len() != before;
                if entry.paths.is_empty() {
                    let role = entry.role;
                    occupied.remove();
                    (removed, Some(role))
                } else {
                    (removed, None)
                }
            }
            Entry::Vacant(_) => (false, None),
        };

        if let Some(role) = emptied_role {
            if role == Role::SuperPeer && self.default_super_peer() == Some(*peer) {
                self.set_default_super_peer(self.find_other_super_peer(peer));
            }
            let event = match role {
                Role::Peer => PathEvent::PeerRemoved { peer: *peer, path: id },
                Role::SuperPeer => PathEvent::SuperPeerRemoved { peer: *peer, path: id },
                Role::Children => PathEvent::ChildrenRemoved { peer: *peer, path: id },
            };
            self.emit(event);
            self.filter.forget(peer);
        }
        if removed {
            tracing::debug!("Removed path {} from peer {}", id, peer.short());
        }
        removed
    }

    fn find_other_super_peer(&self, except: &PeerAddress) -> Option<PeerAddress> {
        self.peers
            .iter()
            .filter(|e| e.value().role == Role::SuperPeer && e.key() != except)
            .min_by_key(|e| {
                e.value()
                    .paths
                    .first()
                    .and_then(|p| p.rtt_millis)
                    .unwrap_or(u32::MAX)
            })
            .map(|e| *e.key())
    }

    /// Remove every path produced by mechanism `id`, across all peers.
    ///
    /// Returns the number of paths removed.
    pub fn remove_paths(&self, id: PathId) -> usize {
        let affected: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|e| e.value().paths.iter().any(|p| p.id == id))
            .map(|e| *e.key())
            .collect();
        affected
            .iter()
            .filter(|peer| self.remove_path(peer, id))
            .count()
    }

    /// Remove paths of kind `id` not seen for longer than `max_age`.
    ///
    /// Returns the affected peers.
    pub fn remove_stale_paths(&self, id: PathId, max_age: Duration) -> Vec<PeerAddress> {
        let now = Instant::now();
        let stale: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|e| {
                e.value()
                    .paths
                    .iter()
                    .any(|p| p.id == id && now.saturating_duration_since(p.last_seen) > max_age)
            })
            .map(|e| *e.key())
            .collect();
        for peer in &stale {
            tracing::debug!("Path {} to {} went stale", id, peer.short());
            self.remove_path(peer, id);
        }
        stale
    }

    /// Record a round-trip measurement.
    ///
    /// Returns false if the path is unknown. Always emits
    /// [`PathEvent::RttUpdated`] for known paths.
    pub fn update_rtt(&self, peer: &PeerAddress, id: PathId, rtt_millis: u32) -> bool {
        let endpoint = match self.peers.get_mut(peer) {
            Some(mut entry) => match entry.path_mut(id) {
                Some(path) => {
                    path.rtt_millis = Some(rtt_millis);
                    path.last_seen = Instant::now();
                    let endpoint = path.endpoint;
                    entry.sort();
                    endpoint
                }
                None => return false,
            },
            None => return false,
        };
        let _ = self.events.send(PathEvent::RttUpdated {
            peer: *peer,
            path: id,
            endpoint,
            rtt_millis,
        });
        true
    }

    /// Refresh the last-seen time of a path. Returns false if unknown.
    pub fn touch(&self, peer: &PeerAddress, id: PathId) -> bool {
        match self.peers.get_mut(peer) {
            Some(mut entry) => match entry.path_mut(id) {
                Some(path) => {
                    path.last_seen = Instant::now();
                    entry.sort();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Preferred path to `peer`: lowest priority, ties broken by most
    /// recently seen.
    #[must_use]
    pub fn best_path(&self, peer: &PeerAddress) -> Option<Path> {
        self.peers
            .get(peer)
            .and_then(|entry| entry.paths.first().cloned())
    }

    /// Route for outbound traffic: the peer's best path, else the default
    /// super peer's best path.
    #[must_use]
    pub fn route(&self, peer: &PeerAddress) -> Option<Route> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(path) = self.best_path(peer) {
            return Some(Route { via: *peer, path });
        }
        let route = self.default_super_peer().and_then(|super_peer| {
            self.best_path(&super_peer).map(|path| Route {
                via: super_peer,
                path,
            })
        });
        match route {
            Some(_) => self.default_routes.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        route
    }

    /// All paths of a peer, best first
    #[must_use]
    pub fn paths(&self, peer: &PeerAddress) -> Vec<Path> {
        self.peers
            .get(peer)
            .map(|entry| entry.paths.clone())
            .unwrap_or_default()
    }

    /// Current default super peer
    #[must_use]
    pub fn super_peer(&self) -> Option<PeerAddress> {
        self.default_super_peer()
    }

    /// True if `peer` is registered as a super peer
    #[must_use]
    pub fn is_super_peer(&self, peer: &PeerAddress) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|entry| entry.role == Role::SuperPeer)
    }

    /// True if `peer` registered with us as its super peer
    #[must_use]
    pub fn is_children(&self, peer: &PeerAddress) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|entry| entry.role == Role::Children)
    }

    /// All known peers
    #[must_use]
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Peers that currently have a path of kind `id`
    #[must_use]
    pub fn peers_with(&self, id: PathId) -> Vec<PeerAddress> {
        self.peers
            .iter()
            .filter(|e| e.value().paths.iter().any(|p| p.id == id))
            .map(|e| *e.key())
            .collect()
    }

    /// True if the peer has at least one path
    #[must_use]
    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.contains_key(peer)
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True if no peer is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registry statistics
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            peers: self.peers.len(),
            lookups: self.lookups.load(Ordering::Relaxed),
            default_routes: self.default_routes.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Withdraw every path, emitting removal events. Used during shutdown.
    pub fn clear(&self) {
        tracing::debug!("Clearing path registry");
        let all: Vec<(PeerAddress, Vec<PathId>)> = self
            .peers
            .iter()
            .map(|e| (*e.key(), e.value().paths.iter().map(|p| p.id).collect()))
            .collect();
        for (peer, ids) in all {
            for id in ids {
                self.remove_path(&peer, id);
            }
        }
    }
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}
