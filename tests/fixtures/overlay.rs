//! Overlay fixture: nodes on one in-memory network and one intra-process hub
//!
//! # Example
//!
//! ```no_run
//! use strand_integration_tests::fixtures::{OverlayFixture, quiet_config};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_two_nodes() {
//!     let fixture = OverlayFixture::perfect();
//!     let a = fixture.pending();
//!     let b = fixture.pending();
//!     let a = a.start_with(quiet_config()).await;
//!     // ...
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strand_core::node::{Node, NodeConfig, NodeEvent, PortMappingConfig};
use strand_crypto::{Identity, IdentityCrypto, PeerAddress};
use strand_discovery::IntraProcessHub;
use strand_transport::{MemoryNetwork, MemoryTransport, SimulatorConfig, Transport};
use tokio::sync::broadcast;

/// Node configuration without startup waits or port mapping, fast hellos
#[must_use]
pub fn quiet_config() -> NodeConfig {
    NodeConfig {
        super_peer_timeout: None,
        hello_interval: Duration::from_secs(1),
        hello_timeout: Duration::from_secs(10),
        intra_process_discovery: false,
        port_mapping: PortMappingConfig {
            enabled: false,
            ..PortMappingConfig::default()
        },
        ..NodeConfig::default()
    }
}

/// Wait up to two virtual minutes for an event matching `predicate`
///
/// # Panics
///
/// Panics if no matching event arrives in time or the event stream closes.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut predicate: F,
) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for node event")
}

/// Shared network and hub for a group of test nodes
pub struct OverlayFixture {
    /// Simulated datagram network
    pub network: MemoryNetwork,
    /// Intra-process hub
    pub hub: Arc<IntraProcessHub>,
}

impl OverlayFixture {
    /// Fixture over a lossless network
    #[must_use]
    pub fn perfect() -> Self {
        Self::new(MemoryNetwork::perfect())
    }

    /// Fixture over a network with the given simulator settings
    #[must_use]
    pub fn with_simulator(config: SimulatorConfig) -> Self {
        Self::new(MemoryNetwork::new(config))
    }

    fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            hub: Arc::new(IntraProcessHub::new()),
        }
    }

    /// Identity and bound endpoint for a node that is not built yet
    ///
    /// # Panics
    ///
    /// Panics if the memory network refuses the binding.
    #[must_use]
    pub fn pending(&self) -> PendingNode {
        PendingNode {
            identity: Identity::generate(),
            transport: self.network.bind_any().expect("bind memory transport"),
            hub: Arc::clone(&self.hub),
        }
    }
}

/// A node's identity and transport before configuration is known
pub struct PendingNode {
    identity: Identity,
    transport: MemoryTransport,
    hub: Arc<IntraProcessHub>,
}

impl PendingNode {
    /// Overlay address
    #[must_use]
    pub fn address(&self) -> PeerAddress {
        self.identity.address()
    }

    /// Endpoint on the memory network
    ///
    /// # Panics
    ///
    /// Panics if the transport has no address.
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.transport.local_addr().expect("memory transport address")
    }

    /// Build the node without starting it
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn build(self, config: NodeConfig) -> Node {
        Node::new(
            config,
            Arc::new(IdentityCrypto::new(self.identity)),
            Arc::new(self.transport),
            Some(self.hub),
        )
        .expect("valid node configuration")
    }

    /// Build and start the node
    ///
    /// # Panics
    ///
    /// Panics if the node fails to start.
    pub async fn start_with(self, config: NodeConfig) -> Node {
        let node = self.build(config);
        node.start().await.expect("node start");
        tracing::debug!("Test node {} started", node.address());
        node
    }
}
