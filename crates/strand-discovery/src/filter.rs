//! Duplicate path event suppression.
//!
//! Discovery mechanisms re-announce the same facts over and over (every
//! hello refreshes a path that already exists). The filter remembers only the
//! most recent event per peer and drops an event that is equal to it. Every
//! offered event replaces the stored one, so `A, B, A` emits three times
//! while `A, A, A` emits once.

use crate::path::PathEvent;
use dashmap::DashMap;
use strand_crypto::PeerAddress;

/// Per-peer "last event" memory
#[derive(Debug, Default)]
pub struct DuplicatePathEventFilter {
    last: DashMap<PeerAddress, PathEvent>,
}

impl DuplicatePathEventFilter {
    /// Create an empty filter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `event` should be emitted, and remember it.
    ///
    /// The swap is atomic per peer, so concurrent callers never both emit
    /// the same event.
    pub fn should_emit(&self, event: &PathEvent) -> bool {
        match self.last.insert(event.peer(), event.clone()) {
            Some(previous) => previous != *event,
            None => true,
        }
    }

    /// Drop the memory for a peer
    pub fn forget(&self, peer: &PeerAddress) {
        self.last.remove(peer);
    }

    /// Number of peers with a remembered event
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// True if nothing is remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
