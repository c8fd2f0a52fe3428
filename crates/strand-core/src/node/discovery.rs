//! Path discovery between nodes
//!
//! Every node sends a signed `Hello` to its super peers and to peers it
//! holds a direct path to, once per hello interval. The receiver records a
//! direct path to the UDP endpoint the hello came from and answers with an
//! `Ack` echoing the timestamp, which gives the sender a round-trip sample.
//!
//! ```text
//!   child A            super peer S            child B
//!      │ Hello(children)     │                     │
//!      │────────────────────▶│◀────────────────────│ Hello(children)
//!      │◀──── Ack ───────────│──────── Ack ───────▶│
//!      │ App(to B)           │                     │
//!      │────────────────────▶│── App(hops+1) ─────▶│
//!      │◀── Unite(B, ep) ────│──── Unite(A, ep) ──▶│
//!      │──────────────── Hello ───────────────────▶│
//! ```
//!
//! A super peer relays application envelopes between its children and
//! introduces them to each other with `Unite`, after which they talk over a
//! direct path.

use crate::error::Error;
use crate::node::channel::{ChannelCommand, now, stopped};
use crate::node::envelope::{Envelope, EnvelopeKind, Hello, Unite};
use crate::node::node::{Hop, Node, Source};
use std::net::SocketAddr;
use strand_crypto::PeerAddress;
use strand_discovery::PathId;
use tokio::time::MissedTickBehavior;

impl Node {
    /// Route one decoded envelope
    pub(crate) async fn dispatch(&self, envelope: Envelope, source: Source) {
        let inner = &self.inner;
        if envelope.network_id != inner.config.network_id {
            tracing::trace!(
                "Dropping envelope for network {} from {:?}",
                envelope.network_id,
                source
            );
            return;
        }
        if envelope.sender == inner.address {
            return;
        }
        if envelope.recipient != inner.address {
            self.relay(envelope).await;
            return;
        }

        match envelope.kind {
            EnvelopeKind::Hello => self.on_hello(&envelope, source).await,
            EnvelopeKind::Ack => self.on_ack(&envelope, source),
            EnvelopeKind::Unite => self.on_unite(&envelope).await,
            EnvelopeKind::Application => self.on_application(envelope, source),
        }
    }

    fn on_application(&self, envelope: Envelope, source: Source) {
        let registry = &self.inner.registry;
        let sender = envelope.sender;
        if envelope.hops > 0 {
            if !registry.touch(&sender, PathId::Relay) && !registry.contains(&sender) {
                registry.add_path(
                    sender,
                    PathId::Relay,
                    None,
                    PathId::Relay.default_priority(),
                );
            }
        } else {
            let id = match source {
                Source::Udp(_) => PathId::Direct,
                Source::Intra(_) => PathId::IntraProcess,
            };
            registry.touch(&sender, id);
        }

        if self
            .channel(sender)
            .send(ChannelCommand::Inbound(envelope.body))
            .is_err()
        {
            tracing::debug!("Channel to {} is gone, dropping datagram", sender.short());
        }
    }

    async fn on_hello(&self, envelope: &Envelope, source: Source) {
        let Some(hello) = self.verified::<Hello>(envelope, Hello::decode) else {
            return;
        };
        let registry = &self.inner.registry;
        let sender = envelope.sender;
        match source {
            Source::Udp(endpoint) => {
                let priority = PathId::Direct.default_priority();
                if hello.children {
                    registry.add_children_path(sender, PathId::Direct, Some(endpoint), priority);
                } else {
                    registry.add_path(sender, PathId::Direct, Some(endpoint), priority);
                }
            }
            Source::Intra(_) => {
                registry.touch(&sender, PathId::IntraProcess);
            }
        }

        let ack = Hello {
            timestamp_millis: hello.timestamp_millis,
            children: false,
        };
        let envelope = Envelope::signed(
            self.inner.config.network_id,
            EnvelopeKind::Ack,
            sender,
            ack.encode(),
            self.inner.crypto.as_ref(),
        );
        if let Err(e) = self.send_via(source.into(), &envelope).await {
            tracing::debug!("Ack to {} failed: {}", sender.short(), e);
        }
    }

    fn on_ack(&self, envelope: &Envelope, source: Source) {
        let Some(ack) = self.verified::<Hello>(envelope, Hello::decode) else {
            return;
        };
        let registry = &self.inner.registry;
        let sender = envelope.sender;
        let rtt = u32::try_from(self.now_millis().saturating_sub(ack.timestamp_millis))
            .unwrap_or(u32::MAX);

        let id = match source {
            Source::Udp(endpoint) => {
                let priority = PathId::Direct.default_priority();
                if self.inner.config.super_peers.contains_key(&sender) {
                    registry.add_super_peer_path(sender, PathId::Direct, Some(endpoint), priority);
                } else {
                    registry.add_path(sender, PathId::Direct, Some(endpoint), priority);
                }
                if self.inner.introduced.remove(&sender).is_some() {
                    tracing::info!("Direct path to {} at {} confirmed", sender.short(), endpoint);
                }
                PathId::Direct
            }
            Source::Intra(_) => PathId::IntraProcess,
        };
        registry.update_rtt(&sender, id, rtt);
    }

    async fn on_unite(&self, envelope: &Envelope) {
        let Some(unite) = self.verified::<Unite>(envelope, Unite::decode) else {
            return;
        };
        if !self.inner.registry.is_super_peer(&envelope.sender) {
            tracing::debug!(
                "Ignoring unite from {}, not a super peer",
                envelope.sender.short()
            );
            return;
        }
        if unite.peer == self.inner.address {
            return;
        }

        tracing::debug!(
            "Super peer {} introduced {} at {}",
            envelope.sender.short(),
            unite.peer.short(),
            unite.endpoint
        );
        self.inner
            .introduced
            .insert(unite.peer, (unite.endpoint, now()));
        self.send_hello(unite.peer, unite.endpoint, false).await;
    }

    /// Forward an envelope addressed to one of our children
    async fn relay(&self, mut envelope: Envelope) {
        let registry = &self.inner.registry;
        let recipient = envelope.recipient;
        if envelope.kind != EnvelopeKind::Application || !registry.is_children(&recipient) {
            tracing::trace!("Not relaying {:?} to {}", envelope.kind, recipient.short());
            return;
        }
        if envelope.hops >= self.inner.config.hop_limit {
            tracing::debug!(
                "Dropping envelope from {} to {}: hop limit reached",
                envelope.sender.short(),
                recipient.short()
            );
            return;
        }
        envelope.hops += 1;

        match self.resolve(&recipient) {
            Ok(hop) => {
                if let Err(e) = self.send_via(hop, &envelope).await {
                    tracing::debug!("Relay to {} failed: {}", recipient.short(), e);
                }
            }
            Err(e) => tracing::debug!("Cannot relay: {}", e),
        }

        if registry.is_children(&envelope.sender) {
            self.unite(envelope.sender, recipient).await;
        }
    }

    /// Introduce two children to each other, at most once per hello timeout
    async fn unite(&self, a: PeerAddress, b: PeerAddress) {
        let key = if a < b { (a, b) } else { (b, a) };
        let now = now();
        let recent = self
            .inner
            .united
            .get(&key)
            .is_some_and(|last| now.duration_since(*last) < self.inner.config.hello_timeout);
        if recent {
            return;
        }
        let (Some(endpoint_a), Some(endpoint_b)) = (self.direct_endpoint(&a), self.direct_endpoint(&b))
        else {
            return;
        };
        self.inner.united.insert(key, now);

        tracing::debug!("Uniting {} and {}", a.short(), b.short());
        for (to, peer, endpoint, to_endpoint) in [
            (a, b, endpoint_b, endpoint_a),
            (b, a, endpoint_a, endpoint_b),
        ] {
            let envelope = Envelope::signed(
                self.inner.config.network_id,
                EnvelopeKind::Unite,
                to,
                Unite { peer, endpoint }.encode(),
                self.inner.crypto.as_ref(),
            );
            if let Err(e) = self.send_via(Hop::Udp(to_endpoint), &envelope).await {
                tracing::debug!("Unite to {} failed: {}", to.short(), e);
            }
        }
    }

    fn direct_endpoint(&self, peer: &PeerAddress) -> Option<SocketAddr> {
        self.inner
            .registry
            .paths(peer)
            .into_iter()
            .find(|path| path.id == PathId::Direct)
            .and_then(|path| path.endpoint)
    }

    fn verified<T>(&self, envelope: &Envelope, decode: fn(&[u8]) -> Option<T>) -> Option<T> {
        let payload = match envelope.verify(self.inner.crypto.as_ref()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(
                    "Rejecting {:?} from {}: {}",
                    envelope.kind,
                    envelope.sender.short(),
                    Error::AuthenticationFailed(e)
                );
                return None;
            }
        };
        let decoded = decode(payload);
        if decoded.is_none() {
            tracing::debug!(
                "Malformed {:?} from {}",
                envelope.kind,
                envelope.sender.short()
            );
        }
        decoded
    }

    pub(crate) async fn send_hello(&self, peer: PeerAddress, endpoint: SocketAddr, children: bool) {
        let hello = Hello {
            timestamp_millis: self.now_millis(),
            children,
        };
        let envelope = Envelope::signed(
            self.inner.config.network_id,
            EnvelopeKind::Hello,
            peer,
            hello.encode(),
            self.inner.crypto.as_ref(),
        );
        if let Err(e) = self.send_via(Hop::Udp(endpoint), &envelope).await {
            tracing::debug!("Hello to {} at {} failed: {}", peer.short(), endpoint, e);
        }
    }

    /// One round of hellos, then expire paths that went quiet
    pub(crate) async fn hello_round(&self) {
        let config = &self.inner.config;
        let registry = &self.inner.registry;

        for (peer, endpoint) in &config.super_peers {
            self.send_hello(*peer, *endpoint, true).await;
        }

        for peer in registry.peers_with(PathId::Direct) {
            if config.super_peers.contains_key(&peer) || registry.is_children(&peer) {
                continue;
            }
            if let Some(endpoint) = self.direct_endpoint(&peer) {
                self.send_hello(peer, endpoint, false).await;
            }
        }

        let now = now();
        self.inner
            .introduced
            .retain(|_, (_, since)| now.duration_since(*since) < config.hello_timeout);
        self.inner
            .united
            .retain(|_, since| now.duration_since(*since) < config.hello_timeout);
        let introduced: Vec<(PeerAddress, SocketAddr)> = self
            .inner
            .introduced
            .iter()
            .map(|entry| (*entry.key(), entry.value().0))
            .collect();
        for (peer, endpoint) in introduced {
            self.send_hello(peer, endpoint, false).await;
        }

        for id in [PathId::Direct, PathId::Relay] {
            for peer in registry.remove_stale_paths(id, config.hello_timeout) {
                tracing::debug!("Path {} to {} expired", id, peer.short());
            }
        }
    }

    pub(crate) async fn hello_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.hello_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.hello_round().await,
                () = stopped(&mut shutdown) => break,
            }
        }
    }
}
