//! Integration tests for cross-crate interactions.
//!
//! Runs complete nodes over the in-memory network and the intra-process hub:
//! chunking, reliable delivery under loss, super peer relaying and startup,
//! connection teardown and failure reporting.

use std::collections::BTreeMap;
use std::time::Duration;
use strand_core::node::{Envelope, EnvelopeKind, Node, NodeConfig, NodeError, NodeEvent};
use strand_core::{ChunkConfig, Error};
use strand_crypto::PeerAddress;
use strand_integration_tests::fixtures::{OverlayFixture, quiet_config, wait_for_event};
use strand_transport::{SimulatorConfig, Transport};

/// Two started nodes with static routes to each other
async fn linked_pair(fixture: &OverlayFixture, config: NodeConfig) -> (Node, Node) {
    let a = fixture.pending();
    let b = fixture.pending();
    let mut a_config = config.clone();
    a_config.static_routes = BTreeMap::from([(b.address(), b.endpoint())]);
    let mut b_config = config;
    b_config.static_routes = BTreeMap::from([(a.address(), a.endpoint())]);
    (a.start_with(a_config).await, b.start_with(b_config).await)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

async fn next_message(events: &mut tokio::sync::broadcast::Receiver<NodeEvent>) -> (PeerAddress, Vec<u8>) {
    match wait_for_event(events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await {
        NodeEvent::MessageReceived { sender, payload } => (sender, payload),
        other => unreachable!("unexpected event {other:?}"),
    }
}

// ============================================================================
// Data Plane
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreliable_chunked_message() {
    let fixture = OverlayFixture::perfect();
    let config = NodeConfig {
        reliability: None,
        ..quiet_config()
    };
    let (a, b) = linked_pair(&fixture, config).await;
    let mut b_events = b.subscribe();

    let payload = pattern(20_000);
    a.send(b.address(), payload.clone()).await.unwrap();
    let (sender, received) = next_message(&mut b_events).await;
    assert_eq!(sender, a.address());
    assert_eq!(received, payload);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reliable_delivery_over_lossy_network() {
    let fixture = OverlayFixture::with_simulator(SimulatorConfig {
        loss_rate: 0.1,
        reorder_rate: 0.1,
        reorder_delay: Duration::from_millis(30),
        duplicate_rate: 0.05,
        latency: Duration::from_millis(5),
        seed: 7,
    });
    let (a, b) = linked_pair(&fixture, quiet_config()).await;
    let mut b_events = b.subscribe();

    let payload = pattern(64 * 1024);
    a.send(b.address(), payload.clone()).await.unwrap();
    let (_, received) = next_message(&mut b_events).await;
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_messages_arrive_in_send_order() {
    let fixture = OverlayFixture::with_simulator(SimulatorConfig {
        reorder_rate: 0.3,
        reorder_delay: Duration::from_millis(20),
        seed: 11,
        ..SimulatorConfig::default()
    });
    let (a, b) = linked_pair(&fixture, quiet_config()).await;
    let mut b_events = b.subscribe();

    for i in 0..10u8 {
        a.send(b.address(), vec![i; 100 + usize::from(i) * 300])
            .await
            .unwrap();
    }
    for i in 0..10u8 {
        let (_, payload) = next_message(&mut b_events).await;
        assert_eq!(payload[0], i);
        assert_eq!(payload.len(), 100 + usize::from(i) * 300);
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_both_directions_share_one_connection() {
    let fixture = OverlayFixture::perfect();
    let (a, b) = linked_pair(&fixture, quiet_config()).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.send(b.address(), b"ping".to_vec()).await.unwrap();
    assert_eq!(next_message(&mut b_events).await.1, b"ping");
    b.send(a.address(), b"pong".to_vec()).await.unwrap();
    assert_eq!(next_message(&mut a_events).await.1, b"pong");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_oversized_message_rejected_before_sending() {
    let fixture = OverlayFixture::perfect();
    let config = NodeConfig {
        chunking: ChunkConfig {
            max_content_length: 4096,
            ..ChunkConfig::default()
        },
        ..quiet_config()
    };
    let (a, b) = linked_pair(&fixture, config).await;

    let result = a.send(b.address(), vec![0; 5000]).await;
    assert!(matches!(
        result,
        Err(NodeError::Core(Error::FrameTooLarge(_)))
    ));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_connection_notifies_both_sides() {
    let fixture = OverlayFixture::perfect();
    let (a, b) = linked_pair(&fixture, quiet_config()).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.send(b.address(), b"before close".to_vec()).await.unwrap();
    next_message(&mut b_events).await;

    a.close_connection(&b.address()).unwrap();
    let b_address = b.address();
    let a_address = a.address();
    wait_for_event(&mut a_events, |e| {
        *e == NodeEvent::ConnectionClosing {
            peer: b_address,
            initiated_by_remote: false,
        }
    })
    .await;
    wait_for_event(&mut b_events, |e| {
        *e == NodeEvent::ConnectionClosing {
            peer: a_address,
            initiated_by_remote: true,
        }
    })
    .await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_reported_once() {
    let fixture = OverlayFixture::perfect();
    let a = fixture.pending();
    let silent = fixture.pending();
    let silent_address = silent.address();
    let mut config = quiet_config();
    config.static_routes = BTreeMap::from([(silent_address, silent.endpoint())]);
    // The peer's endpoint exists but never runs a node.
    let _silent = silent.build(quiet_config());

    let a = a.start_with(config).await;
    let mut events = a.subscribe();

    let result = a.send(silent_address, b"anyone there".to_vec()).await;
    assert!(matches!(
        result,
        Err(NodeError::Core(Error::HandshakeTimeout { .. }))
    ));

    tokio::time::sleep(Duration::from_secs(600)).await;
    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let NodeEvent::ConnectionFailed { peer, error } = event {
            assert_eq!(peer, silent_address);
            assert!(matches!(error, Error::HandshakeTimeout { .. }));
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    a.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_resets_remote_connection() {
    let fixture = OverlayFixture::perfect();
    let (a, b) = linked_pair(&fixture, quiet_config()).await;
    let mut b_events = b.subscribe();

    a.send(b.address(), b"hello".to_vec()).await.unwrap();
    next_message(&mut b_events).await;

    let a_address = a.address();
    a.shutdown().await.unwrap();
    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, NodeEvent::ConnectionFailed { .. })
    })
    .await;
    assert_eq!(
        event,
        NodeEvent::ConnectionFailed {
            peer: a_address,
            error: Error::ConnectionReset
        }
    );

    b.shutdown().await.unwrap();
}

// ============================================================================
// Super Peers and Relaying
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_startup_fails_without_super_peer() {
    let fixture = OverlayFixture::perfect();
    let offline = fixture.pending();
    let mut config = quiet_config();
    config.super_peers = BTreeMap::from([(offline.address(), offline.endpoint())]);
    config.super_peer_timeout = Some(Duration::from_secs(3));

    let node = fixture.pending().build(config);
    let mut events = node.subscribe();
    let result = node.start().await;
    assert!(matches!(
        result,
        Err(NodeError::Core(Error::SuperPeerUnreachable(_)))
    ));
    assert!(!node.is_running());
    assert!(events.try_recv().is_err(), "no NodeOnline after failed start");
}

#[tokio::test(start_paused = true)]
async fn test_startup_waits_for_super_peer() {
    let fixture = OverlayFixture::perfect();
    let super_peer = fixture.pending();
    let super_address = super_peer.address();
    let mut config = quiet_config();
    config.super_peers = BTreeMap::from([(super_address, super_peer.endpoint())]);
    config.super_peer_timeout = Some(Duration::from_secs(5));

    let super_peer = super_peer.start_with(quiet_config()).await;
    let child = fixture.pending().start_with(config).await;
    assert_eq!(child.registry().super_peer(), Some(super_address));
    assert!(super_peer.registry().is_children(&child.address()));

    child.shutdown().await.unwrap();
    super_peer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_relay_respects_hop_limit() {
    let fixture = OverlayFixture::perfect();
    let super_peer = fixture.pending();
    let super_endpoint = super_peer.endpoint();
    let super_address = super_peer.address();
    let mut child_config = quiet_config();
    child_config.super_peers = BTreeMap::from([(super_address, super_endpoint)]);
    child_config.super_peer_timeout = Some(Duration::from_secs(5));

    let super_peer = super_peer.start_with(NodeConfig {
        hop_limit: 2,
        ..quiet_config()
    })
    .await;
    let child = fixture.pending().start_with(child_config).await;
    let mut child_events = child.subscribe();

    let rogue = fixture.network.bind_any().unwrap();
    let exhausted = PeerAddress::from_bytes([0xEE; 32]);
    let fresh = PeerAddress::from_bytes([0xEF; 32]);
    for (sender, hops) in [(exhausted, 2), (fresh, 1)] {
        let mut envelope = Envelope::new(
            1,
            EnvelopeKind::Application,
            sender,
            child.address(),
            vec![0xAB; 16],
        );
        envelope.hops = hops;
        rogue.send_to(&envelope.encode(), super_endpoint).await.unwrap();
    }

    wait_for_event(&mut child_events, |e| {
        *e == NodeEvent::PeerPathAdded { peer: fresh }
    })
    .await;
    assert!(child.registry().contains(&fresh));
    assert!(!child.registry().contains(&exhausted));

    child.shutdown().await.unwrap();
    super_peer.shutdown().await.unwrap();
}

// ============================================================================
// Intra-Process Discovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_intra_process_networks_isolated() {
    let fixture = OverlayFixture::perfect();
    let config = NodeConfig {
        intra_process_discovery: true,
        ..quiet_config()
    };
    let a = fixture.pending().start_with(config.clone()).await;
    let b = fixture.pending().start_with(config.clone()).await;
    let other = fixture
        .pending()
        .start_with(NodeConfig {
            network_id: 2,
            ..config
        })
        .await;

    let b_address = b.address();
    let registry = std::sync::Arc::clone(a.registry());
    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.contains(&b_address) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!a.registry().contains(&other.address()));
    assert!(!other.registry().contains(&a.address()));

    let mut b_events = b.subscribe();
    a.send(b_address, pattern(10_000)).await.unwrap();
    assert_eq!(next_message(&mut b_events).await.1, pattern(10_000));

    for node in [a, b, other] {
        node.shutdown().await.unwrap();
    }
}
