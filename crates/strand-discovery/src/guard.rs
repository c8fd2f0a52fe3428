//! Super peer registration timeout.
//!
//! A node configured with super peers is not usable until one of them has
//! confirmed its registration. [`SuperPeerTimeoutGuard`] holds node startup
//! until either a [`PathEvent::SuperPeerAdded`] arrives or the timeout fires.
//! Only a fired guard is fatal; it is the one error allowed to abort startup.
//!
//! ```text
//!  activate ──► Pending ──super peer added──► Online(peer)
//!                  │
//!                  ├──timeout──► SuperPeerUnreachable
//!                  │
//!                  └──cancel───► GuardCancelled
//! ```

use crate::error::DiscoveryError;
use crate::path::PathEvent;
use crate::registry::PathRegistry;
use std::sync::Arc;
use std::time::Duration;
use strand_crypto::PeerAddress;
use tokio::sync::{broadcast, watch};

/// Cancels a pending guard. Idempotent and safe after resolution.
#[derive(Clone, Debug)]
pub struct GuardCanceller {
    cancel: Arc<watch::Sender<bool>>,
}

impl GuardCanceller {
    /// Cancel the guard
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// True once cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// One-shot gate on super peer registration
#[derive(Debug)]
pub struct SuperPeerTimeoutGuard {
    timeout: Duration,
    cancel: Arc<watch::Sender<bool>>,
}

impl SuperPeerTimeoutGuard {
    /// Create a guard that fires after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            timeout,
            cancel: Arc::new(cancel),
        }
    }

    /// Configured timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handle for cancelling the guard from elsewhere
    #[must_use]
    pub fn canceller(&self) -> GuardCanceller {
        GuardCanceller {
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Start the timer and wait for the first outcome.
    ///
    /// Consumes the guard, so it resolves exactly once.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::SuperPeerUnreachable`] if the timer fires first
    /// - [`DiscoveryError::GuardCancelled`] if cancelled before resolution
    /// - [`DiscoveryError::EventsClosed`] if the registry went away
    pub async fn activate(self, registry: &PathRegistry) -> Result<PeerAddress, DiscoveryError> {
        let mut events = registry.subscribe();
        let mut cancelled = self.cancel.subscribe();
        if *cancelled.borrow_and_update() {
            return Err(DiscoveryError::GuardCancelled);
        }
        if let Some(peer) = registry.super_peer() {
            return Ok(peer);
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => {
                    tracing::error!(
                        "No super peer confirmed registration within {:?}",
                        self.timeout
                    );
                    return Err(DiscoveryError::SuperPeerUnreachable(self.timeout));
                }
                changed = cancelled.changed() => {
                    if changed.is_err() || *cancelled.borrow() {
                        tracing::debug!("Super peer guard cancelled");
                        return Err(DiscoveryError::GuardCancelled);
                    }
                }
                event = events.recv() => match event {
                    Ok(PathEvent::SuperPeerAdded { peer, .. }) => {
                        tracing::info!("Super peer {} online", peer.short());
                        return Ok(peer);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(peer) = registry.super_peer() {
                            return Ok(peer);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(DiscoveryError::EventsClosed);
                    }
                },
            }
        }
    }
}
