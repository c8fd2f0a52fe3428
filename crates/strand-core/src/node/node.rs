//! Node implementation - runtime orchestrator
//!
//! The Node owns the datagram transport, the shared [`PathRegistry`], one
//! channel task per peer and the discovery tasks. Everything per peer runs
//! inside that peer's channel task; the registry is the only state shared
//! between tasks.
//!
//! # Example
//!
//! ```no_run
//! use strand_core::node::{Node, NodeConfig};
//! use strand_crypto::Identity;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::bind(NodeConfig::default(), Identity::generate()).await?;
//!     node.start().await?;
//!
//!     let peer = "aa".repeat(32).parse()?;
//!     node.send(peer, b"hello".to_vec()).await?;
//!
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::error::Error;
use crate::node::channel::{self, ChannelCommand, Pipeline, stopped};
use crate::node::config::{NodeConfig, PortMapStrategy};
use crate::node::envelope::{Envelope, EnvelopeKind};
use crate::node::error::{NodeError, Result};
use crate::node::event::NodeEvent;
use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use strand_crypto::{CryptoService, Identity, IdentityCrypto, PeerAddress};
use strand_discovery::{
    DiscoveryError, GuardCanceller, HubEvent, HubMembership, IntraDatagram, IntraProcessHub,
    MappingLease, NatPmpMapping, Path, PathEvent, PathId, PathRegistry, PcpMapping, PortMapper,
    PortMapping, SuperPeerTimeoutGuard,
};
use strand_transport::{AsyncUdpTransport, MAX_DATAGRAM_SIZE, Transport, TransportError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 1024;

/// Where an envelope came from, and where replies go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// UDP endpoint
    Udp(SocketAddr),
    /// Node in the same process
    Intra(PeerAddress),
}

/// Next hop for an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hop {
    Udp(SocketAddr),
    Intra(PeerAddress),
}

impl From<Source> for Hop {
    fn from(source: Source) -> Self {
        match source {
            Source::Udp(endpoint) => Hop::Udp(endpoint),
            Source::Intra(peer) => Hop::Intra(peer),
        }
    }
}

/// Node inner state
pub(crate) struct NodeInner {
    /// Node configuration
    pub(crate) config: NodeConfig,
    /// Signing and payload encryption
    pub(crate) crypto: Arc<dyn CryptoService>,
    /// Our overlay address
    pub(crate) address: PeerAddress,
    /// Datagram transport
    pub(crate) transport: Arc<dyn Transport>,
    /// Process-wide hub, when intra-process discovery is used
    pub(crate) hub: Option<Arc<IntraProcessHub>>,
    /// Paths to every known peer
    pub(crate) registry: Arc<PathRegistry>,
    /// Per-peer channel tasks
    pub(crate) channels: DashMap<PeerAddress, mpsc::UnboundedSender<ChannelCommand>>,
    /// Peers a super peer introduced, with their endpoint and introduction time
    pub(crate) introduced: DashMap<PeerAddress, (SocketAddr, Instant)>,
    /// Children pairs we introduced to each other, as super peer
    pub(crate) united: DashMap<(PeerAddress, PeerAddress), Instant>,
    /// Application notifications
    pub(crate) events: broadcast::Sender<NodeEvent>,
    /// Node running state
    pub(crate) running: AtomicBool,
    /// Flipped to true to stop every task
    pub(crate) shutdown: watch::Sender<bool>,
    /// Spawned tasks, joined on shutdown
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Pending super peer wait of an ongoing `start`
    pub(crate) startup_guard: Mutex<Option<GuardCanceller>>,
    /// Lease published by the port mapper, once it runs
    pub(crate) port_mapping: Mutex<Option<watch::Receiver<Option<MappingLease>>>>,
    /// Origin of hello timestamps
    pub(crate) epoch: tokio::time::Instant,
}

/// strand overlay node
///
/// Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Create a node over an existing transport.
    ///
    /// `hub` is only used when `config.intra_process_discovery` is set.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] if the configuration is rejected.
    pub fn new(
        config: NodeConfig,
        crypto: Arc<dyn CryptoService>,
        transport: Arc<dyn Transport>,
        hub: Option<Arc<IntraProcessHub>>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let hub = hub.filter(|_| config.intra_process_discovery);
        let inner = NodeInner {
            address: crypto.local_address(),
            config,
            crypto,
            transport,
            hub,
            registry: Arc::new(PathRegistry::new()),
            channels: DashMap::new(),
            introduced: DashMap::new(),
            united: DashMap::new(),
            events,
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            startup_guard: Mutex::new(None),
            port_mapping: Mutex::new(None),
            epoch: tokio::time::Instant::now(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Bind a UDP transport at `config.bind_addr` and create a node for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Transport`] if binding fails, or
    /// [`NodeError::InvalidConfig`] if the configuration is rejected.
    pub async fn bind(config: NodeConfig, identity: Identity) -> Result<Self> {
        let transport = AsyncUdpTransport::bind(config.bind_addr).await?;
        Self::new(
            config,
            Arc::new(IdentityCrypto::new(identity)),
            Arc::new(transport),
            None,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Our overlay address
    #[must_use]
    pub fn address(&self) -> PeerAddress {
        self.inner.address
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Path registry shared by all channels
    #[must_use]
    pub fn registry(&self) -> &Arc<PathRegistry> {
        &self.inner.registry
    }

    /// Local transport address
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Transport`] if the transport cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Active NAT port mapping, if a strategy holds one
    #[must_use]
    pub fn port_mapping(&self) -> Option<MappingLease> {
        self.inner
            .port_mapping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|lease| *lease.borrow())
    }

    /// True between `start` and `shutdown`
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribe to node events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn now_millis(&self) -> u64 {
        u64::try_from(self.inner.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the node.
    ///
    /// With super peers configured and a `super_peer_timeout`, waits until
    /// one of them acknowledges our hello. Emits [`NodeEvent::NodeOnline`].
    ///
    /// # Errors
    ///
    /// - [`NodeError::InvalidState`] if already running, or if `shutdown` was
    ///   called while waiting for a super peer
    /// - [`Error::SuperPeerUnreachable`] (as [`NodeError::Core`]) if no super
    ///   peer answered in time; the node is stopped again
    /// - [`NodeError::Discovery`] if joining the intra-process hub fails
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node already running"));
        }
        self.inner.shutdown.send_replace(false);

        let config = &self.inner.config;
        tracing::info!(
            "Starting node {} on {} (network {})",
            self.inner.address.short(),
            self.local_addr()?,
            config.network_id
        );

        let path_events = self.inner.registry.subscribe();
        let node = self.clone();
        self.spawn(async move { node.path_event_loop(path_events).await });

        let node = self.clone();
        self.spawn(async move { node.receive_loop().await });

        if let Some(hub) = &self.inner.hub {
            let membership = match hub.join(config.network_id, self.inner.address) {
                Ok(membership) => membership,
                Err(e) => {
                    self.teardown().await;
                    return Err(e.into());
                }
            };
            let node = self.clone();
            self.spawn(async move { node.hub_loop(membership).await });
        }

        for (peer, endpoint) in &config.static_routes {
            self.inner.registry.add_path(
                *peer,
                PathId::Static,
                Some(*endpoint),
                PathId::Static.default_priority(),
            );
        }

        let node = self.clone();
        self.spawn(async move { node.hello_loop().await });

        self.start_port_mapping();

        if !config.super_peers.is_empty() {
            if let Some(timeout) = config.super_peer_timeout {
                let guard = SuperPeerTimeoutGuard::new(timeout);
                let canceller = guard.canceller();
                *self.startup_guard() = Some(canceller.clone());
                if !self.is_running() {
                    canceller.cancel();
                }
                let outcome = guard.activate(&self.inner.registry).await;
                self.startup_guard().take();
                match outcome {
                    Ok(_) => {}
                    Err(DiscoveryError::GuardCancelled) => {
                        tracing::info!("Node shut down before a super peer answered");
                        return Err(NodeError::invalid_state("Node shut down during startup"));
                    }
                    Err(e) => {
                        tracing::error!("Node startup failed: {}", e);
                        self.inner.running.store(false, Ordering::SeqCst);
                        self.teardown().await;
                        return Err(match e {
                            DiscoveryError::SuperPeerUnreachable(waited) => {
                                Error::SuperPeerUnreachable(waited).into()
                            }
                            other => other.into(),
                        });
                    }
                }
            }
        }

        tracing::info!("Node {} online", self.inner.address.short());
        self.emit(NodeEvent::NodeOnline);
        Ok(())
    }

    /// Stop the node: reset open connections, leave the hub, stop all tasks
    /// and close the transport. Emits [`NodeEvent::NodeOffline`].
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if the node is not running.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node not running"));
        }

        if let Some(guard) = self.startup_guard().take() {
            guard.cancel();
        }
        self.teardown().await;
        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!("Error closing transport: {}", e);
        }

        tracing::info!("Node {} stopped", self.inner.address.short());
        self.emit(NodeEvent::NodeOffline);
        Ok(())
    }

    async fn teardown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        if let Some(hub) = &self.inner.hub {
            hub.leave(self.inner.config.network_id, self.inner.address);
        }

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!("Node task ended abnormally: {}", e);
            }
        }

        self.inner.channels.clear();
        self.inner.registry.remove_paths(PathId::IntraProcess);
    }

    fn startup_guard(&self) -> std::sync::MutexGuard<'_, Option<GuardCanceller>> {
        self.inner
            .startup_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn start_port_mapping(&self) {
        let mapping = &self.inner.config.port_mapping;
        if !mapping.enabled {
            return;
        }
        let Some(gateway) = mapping.gateway else {
            tracing::debug!("No port mapping gateway configured, skipping port mapping");
            return;
        };
        let port = match self.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::warn!("Cannot map port: {}", e);
                return;
            }
        };

        let mut nonce = [0u8; strand_discovery::portmap::PCP_NONCE_LEN];
        nonce.copy_from_slice(&self.inner.address.as_bytes()[..strand_discovery::portmap::PCP_NONCE_LEN]);
        let strategies: Vec<Box<dyn PortMapping>> = mapping
            .strategies
            .iter()
            .map(|strategy| -> Box<dyn PortMapping> {
                match strategy {
                    PortMapStrategy::Pcp => Box::new(PcpMapping::new(gateway, nonce)),
                    PortMapStrategy::NatPmp => Box::new(NatPmpMapping::new(gateway)),
                }
            })
            .collect();
        let mapper = PortMapper::new(strategies);
        *self
            .inner
            .port_mapping
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(mapper.subscribe());
        let shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            if let Err(e) = mapper.run(port, shutdown).await {
                tracing::debug!("Port mapper stopped: {}", e);
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Messaging
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Send `payload` to `recipient`.
    ///
    /// Completes once the payload was handed to the transport: for a reliable
    /// channel, when the last segment of its last chunk was first
    /// transmitted. Delivery is confirmed by the reliable connection, not by
    /// this future.
    ///
    /// # Errors
    ///
    /// - [`NodeError::InvalidState`] if the node is not running or `recipient` is us
    /// - [`Error::FrameTooLarge`] if the payload exceeds the chunking limits
    /// - [`Error::ConnectionClosing`] if the connection is closing
    /// - any failure of the reliable connection before the payload left
    pub async fn send(&self, recipient: PeerAddress, payload: Vec<u8>) -> Result<()> {
        if !self.is_running() {
            return Err(NodeError::invalid_state("Node not running"));
        }
        if recipient == self.inner.address {
            return Err(NodeError::invalid_state("Cannot send to self"));
        }
        let (done, completion) = tokio::sync::oneshot::channel();
        self.channel(recipient)
            .send(ChannelCommand::Send { payload, done })
            .map_err(|_| NodeError::channel("channel task stopped"))?;
        completion
            .await
            .map_err(|_| NodeError::channel("channel task dropped the send"))?
    }

    /// Gracefully close the reliable connection to `peer`, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Channel`] if the channel task is gone.
    pub fn close_connection(&self, peer: &PeerAddress) -> Result<()> {
        let Some(tx) = self.inner.channels.get(peer).map(|tx| tx.clone()) else {
            return Ok(());
        };
        tx.send(ChannelCommand::Close)
            .map_err(|_| NodeError::channel("channel task stopped"))
    }

    /// Channel task for `peer`, spawned on first use
    pub(crate) fn channel(&self, peer: PeerAddress) -> mpsc::UnboundedSender<ChannelCommand> {
        let mut entry = self
            .inner
            .channels
            .entry(peer)
            .or_insert_with(|| self.spawn_channel(peer));
        if entry.is_closed() {
            *entry = self.spawn_channel(peer);
        }
        entry.clone()
    }

    /// Unregister the channel task of `peer`, which is about to return.
    ///
    /// Commands that raced in after the decision are handed to a fresh
    /// channel.
    pub(crate) fn retire_channel(
        &self,
        peer: PeerAddress,
        mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    ) {
        self.inner.channels.remove(&peer);
        commands.close();
        let leftovers: Vec<ChannelCommand> =
            std::iter::from_fn(|| commands.try_recv().ok()).collect();
        tracing::debug!("Retired channel to {}", peer.short());
        if leftovers.is_empty() {
            return;
        }
        let tx = self.channel(peer);
        for command in leftovers {
            let _ = tx.send(command);
        }
    }

    fn spawn_channel(&self, peer: PeerAddress) -> mpsc::UnboundedSender<ChannelCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(&self.inner.config, Arc::clone(&self.inner.crypto), peer);
        let shutdown = self.inner.shutdown.subscribe();
        let node = self.clone();
        tracing::trace!("Spawning channel to {}", peer.short());
        self.spawn(channel::run_channel(node, peer, pipeline, rx, shutdown));
        tx
    }

    /// Wrap channel output in application envelopes and send them towards `peer`
    pub(crate) async fn transmit_all(&self, peer: PeerAddress, bodies: Vec<Vec<u8>>) -> Result<()> {
        if bodies.is_empty() {
            return Ok(());
        }
        let hop = match self.resolve(&peer) {
            Ok(hop) => hop,
            Err(e) => {
                tracing::debug!("Dropping {} datagrams: {}", bodies.len(), e);
                return Err(e);
            }
        };

        let mut result = Ok(());
        for body in bodies {
            let envelope = Envelope::new(
                self.inner.config.network_id,
                EnvelopeKind::Application,
                self.inner.address,
                peer,
                body,
            );
            if let Err(e) = self.send_via(hop, &envelope).await {
                tracing::debug!("Send to {} failed: {}", peer.short(), e);
                result = Err(e);
            }
        }
        result
    }

    /// Pick the next hop for `peer` from the registry
    pub(crate) fn resolve(&self, peer: &PeerAddress) -> Result<Hop> {
        let registry = &self.inner.registry;
        let route = registry.route(peer).ok_or(NodeError::NoRoute(*peer))?;
        match route.path.id {
            PathId::Relay => {
                let super_peer = registry.super_peer().ok_or(NodeError::NoRoute(*peer))?;
                let path = registry
                    .best_path(&super_peer)
                    .filter(|p| p.id != PathId::Relay)
                    .ok_or(NodeError::NoRoute(*peer))?;
                Self::hop_for(super_peer, &path)
            }
            _ => Self::hop_for(route.via, &route.path),
        }
    }

    fn hop_for(via: PeerAddress, path: &Path) -> Result<Hop> {
        match path.id {
            PathId::IntraProcess => Ok(Hop::Intra(via)),
            _ => path.endpoint.map(Hop::Udp).ok_or(NodeError::NoRoute(via)),
        }
    }

    pub(crate) async fn send_via(&self, hop: Hop, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.encode();
        match hop {
            Hop::Udp(endpoint) => {
                self.inner.transport.send_to(&bytes, endpoint).await?;
                Ok(())
            }
            Hop::Intra(to) => {
                let hub = self.inner.hub.as_ref().ok_or(NodeError::NoRoute(to))?;
                if hub.send(self.inner.config.network_id, self.inner.address, to, bytes) {
                    Ok(())
                } else {
                    Err(NodeError::NoRoute(to))
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Background tasks
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    async fn receive_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                received = self.inner.transport.recv_from(&mut buf) => received,
                () = stopped(&mut shutdown) => break,
            };
            match received {
                Ok((len, from)) => match Envelope::decode(&buf[..len]) {
                    Some(envelope) => self.dispatch(envelope, Source::Udp(from)).await,
                    None => tracing::debug!("Dropping {} byte datagram from {}", len, from),
                },
                Err(TransportError::Closed) => break,
                Err(e) => tracing::warn!("Error receiving datagram: {}", e),
            }
        }
        tracing::trace!("Receive loop stopped");
    }

    async fn hub_loop(self, membership: HubMembership) {
        let HubMembership {
            mut inbox,
            mut events,
            peers,
        } = membership;
        let network_id = self.inner.config.network_id;
        let priority = PathId::IntraProcess.default_priority();
        for peer in peers {
            self.inner
                .registry
                .add_path(peer, PathId::IntraProcess, None, priority);
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                datagram = inbox.recv() => {
                    let Some(IntraDatagram { from, bytes }) = datagram else { break };
                    match Envelope::decode(&bytes) {
                        Some(envelope) => self.dispatch(envelope, Source::Intra(from)).await,
                        None => tracing::debug!("Dropping malformed hub datagram from {}", from.short()),
                    }
                }
                event = events.recv() => match event {
                    Ok(HubEvent::Joined { network_id: id, peer })
                        if id == network_id && peer != self.inner.address =>
                    {
                        self.inner
                            .registry
                            .add_path(peer, PathId::IntraProcess, None, priority);
                    }
                    Ok(HubEvent::Left { network_id: id, peer }) if id == network_id => {
                        self.inner.registry.remove_path(&peer, PathId::IntraProcess);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} hub membership events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = stopped(&mut shutdown) => break,
            }
        }
    }

    async fn path_event_loop(self, mut path_events: broadcast::Receiver<PathEvent>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                event = path_events.recv() => event,
                () = stopped(&mut shutdown) => break,
            };
            match event {
                Ok(event) if event.is_addition() => {
                    self.emit(NodeEvent::PeerPathAdded { peer: event.peer() });
                }
                Ok(event) if event.is_removal() => {
                    let peer = event.peer();
                    if let Some(tx) = self.inner.channels.get(&peer).map(|tx| tx.clone()) {
                        let _ = tx.send(ChannelCommand::Retire);
                    }
                    self.emit(NodeEvent::PeerPathRemoved { peer });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} path events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::PortMappingConfig;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use strand_transport::MemoryNetwork;

    fn config() -> NodeConfig {
        NodeConfig {
            super_peer_timeout: None,
            port_mapping: PortMappingConfig {
                enabled: false,
                ..PortMappingConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    fn node_on(network: &MemoryNetwork, config: NodeConfig) -> Node {
        let transport = network.bind_any().unwrap();
        Node::new(
            config,
            Arc::new(IdentityCrypto::new(Identity::generate())),
            Arc::new(transport),
            None,
        )
        .unwrap()
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<NodeEvent>, mut predicate: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let event = events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::perfect();
        let transport = network.bind_any().unwrap();
        let result = Node::new(
            NodeConfig {
                hop_limit: 0,
                ..config()
            },
            Arc::new(IdentityCrypto::new(Identity::generate())),
            Arc::new(transport),
            None,
        );
        assert!(matches!(result, Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let network = MemoryNetwork::perfect();
        let node = node_on(&network, config());
        let mut events = node.subscribe();

        assert!(matches!(
            node.send(PeerAddress::from_bytes([1; 32]), vec![1]).await,
            Err(NodeError::InvalidState(_))
        ));

        node.start().await.unwrap();
        assert!(node.is_running());
        assert_eq!(events.recv().await.unwrap(), NodeEvent::NodeOnline);
        assert!(node.start().await.is_err());

        node.shutdown().await.unwrap();
        assert!(!node.is_running());
        assert_eq!(
            wait_for(&mut events, |e| *e == NodeEvent::NodeOffline).await,
            NodeEvent::NodeOffline
        );
        assert!(node.shutdown().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_over_static_route() {
        let network = MemoryNetwork::perfect();
        let a_transport = network.bind_any().unwrap();
        let b_transport = network.bind_any().unwrap();
        let a_identity = Identity::generate();
        let b_identity = Identity::generate();
        let a_addr = a_identity.address();
        let b_addr = b_identity.address();

        let mut a_config = config();
        a_config.static_routes = BTreeMap::from([(b_addr, b_transport.local_addr().unwrap())]);
        let mut b_config = config();
        b_config.static_routes = BTreeMap::from([(a_addr, a_transport.local_addr().unwrap())]);

        let a = Node::new(
            a_config,
            Arc::new(IdentityCrypto::new(a_identity)),
            Arc::new(a_transport),
            None,
        )
        .unwrap();
        let b = Node::new(
            b_config,
            Arc::new(IdentityCrypto::new(b_identity)),
            Arc::new(b_transport),
            None,
        )
        .unwrap();

        let mut b_events = b.subscribe();
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.send(b_addr, b"over the wire".to_vec()).await.unwrap();
        let event = wait_for(&mut b_events, |e| {
            matches!(e, NodeEvent::MessageReceived { .. })
        })
        .await;
        assert_eq!(
            event,
            NodeEvent::MessageReceived {
                sender: a_addr,
                payload: b"over the wire".to_vec()
            }
        );

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_route_fails_unreliable_send() {
        let network = MemoryNetwork::perfect();
        let node = node_on(
            &network,
            NodeConfig {
                reliability: None,
                ..config()
            },
        );
        node.start().await.unwrap();
        let result = node.send(PeerAddress::from_bytes([9; 32]), vec![1, 2]).await;
        assert!(matches!(result, Err(NodeError::NoRoute(_))));
        node.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_super_peer_unreachable_aborts_start() {
        let network = MemoryNetwork::perfect();
        let mut config = config();
        config.super_peers = BTreeMap::from([(
            PeerAddress::from_bytes([7; 32]),
            "10.9.9.9:22527".parse().unwrap(),
        )]);
        config.super_peer_timeout = Some(Duration::from_secs(2));
        let node = node_on(&network, config);

        let result = node.start().await;
        assert!(matches!(
            result,
            Err(NodeError::Core(Error::SuperPeerUnreachable(d))) if d == Duration::from_secs(2)
        ));
        assert!(!node.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_super_peer_wait() {
        let network = MemoryNetwork::perfect();
        let mut config = config();
        config.super_peers = BTreeMap::from([(
            PeerAddress::from_bytes([7; 32]),
            "10.9.9.9:22527".parse().unwrap(),
        )]);
        config.super_peer_timeout = Some(Duration::from_secs(30));
        let node = node_on(&network, config);
        let mut events = node.subscribe();

        let starting = tokio::spawn({
            let node = node.clone();
            async move { node.start().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let begun = tokio::time::Instant::now();
        node.shutdown().await.unwrap();

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(NodeError::InvalidState(_))), "{result:?}");
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert!(!node.is_running());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen, vec![NodeEvent::NodeOffline]);
    }

    /// Gateway that only speaks NAT-PMP and answers PCP with "unsupported version"
    async fn spawn_nat_pmp_gateway(versions: Arc<Mutex<Vec<u8>>>) -> SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                versions.lock().unwrap().push(buf[0]);
                let mut response = vec![0, 128 | buf[1]];
                match (buf[0], buf[1]) {
                    (0, 0) => {
                        response.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
                        response.extend_from_slice(&[203, 0, 113, 5]);
                    }
                    (0, 1) if n >= 12 => {
                        response.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
                        response.extend_from_slice(&buf[4..6]);
                        response.extend_from_slice(&42_000u16.to_be_bytes());
                        response.extend_from_slice(&buf[8..12]);
                    }
                    _ => response.extend_from_slice(&[0, 1, 0, 0, 0, 1]),
                }
                let _ = socket.send_to(&response, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_port_mapping_falls_back_to_next_strategy() {
        let versions = Arc::new(Mutex::new(Vec::new()));
        let gateway = spawn_nat_pmp_gateway(Arc::clone(&versions)).await;
        let network = MemoryNetwork::perfect();
        let mut config = config();
        config.port_mapping = PortMappingConfig {
            enabled: true,
            gateway: Some(gateway),
            ..PortMappingConfig::default()
        };
        let node = node_on(&network, config);
        node.start().await.unwrap();

        let lease = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(lease) = node.port_mapping() {
                    return lease;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(lease.external, "203.0.113.5:42000".parse().unwrap());

        let versions = versions.lock().unwrap().clone();
        assert_eq!(versions.first(), Some(&2), "PCP is tried first");
        assert!(versions.contains(&0), "NAT-PMP is tried next");

        node.shutdown().await.unwrap();
        assert_eq!(node.port_mapping(), None);
    }

    #[tokio::test]
    async fn test_send_to_self_rejected() {
        let network = MemoryNetwork::perfect();
        let node = node_on(&network, config());
        node.start().await.unwrap();
        assert!(matches!(
            node.send(node.address(), vec![1]).await,
            Err(NodeError::InvalidState(_))
        ));
        node.shutdown().await.unwrap();
    }
}
