//! In-process datagram network with fault injection.
//!
//! Real networks drop, reorder and duplicate packets. [`MemoryNetwork`] lets
//! tests exercise the reliability layer against those faults without
//! sockets, and deterministically: every fault decision comes from a seeded
//! RNG.
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.        |
//! | Reordering       | Delay a datagram by `reorder_delay` so later ones    |
//! |                  | overtake it, with probability `reorder_rate`.        |
//! | Duplication      | Deliver a datagram twice.                            |
//! | Latency          | Fixed one-way delay applied to every datagram.       |
//! | Blocking         | Drop everything to or from a blocked address.        |

use crate::transport::{StatsCounters, Transport, TransportError, TransportResult, TransportStats};
use crate::MAX_DATAGRAM_SIZE;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

/// Fault model for a [`MemoryNetwork`].
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is reordered.
    pub reorder_rate: f64,
    /// Delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// One-way latency for every datagram.
    pub latency: Duration,
    /// RNG seed for fault decisions.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            duplicate_rate: 0.0,
            latency: Duration::ZERO,
            seed: 0x5eed,
        }
    }
}

struct NetworkInner {
    endpoints: Mutex<HashMap<SocketAddr, Inbox>>,
    blocked: Mutex<HashSet<SocketAddr>>,
    config: Mutex<SimulatorConfig>,
    rng: Mutex<StdRng>,
    next_port: AtomicU16,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory network.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create a network with the given fault model
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: Mutex::new(HashMap::new()),
                blocked: Mutex::new(HashSet::new()),
                config: Mutex::new(config),
                rng: Mutex::new(rng),
                next_port: AtomicU16::new(20_000),
            }),
        }
    }

    /// Create a fault-free network
    #[must_use]
    pub fn perfect() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Attach an endpoint at `addr`. Port 0 picks a free port.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address is taken
    pub fn bind(&self, addr: SocketAddr) -> TransportResult<MemoryTransport> {
        let mut addr = addr;
        if addr.port() == 0 {
            addr.set_port(self.inner.next_port.fetch_add(1, Ordering::Relaxed));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut endpoints = lock(&self.inner.endpoints);
            if endpoints.contains_key(&addr) {
                return Err(TransportError::BindFailed(format!("{addr} already in use")));
            }
            endpoints.insert(addr, tx);
        }
        Ok(MemoryTransport {
            addr,
            network: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            counters: StatsCounters::default(),
        })
    }

    /// Attach an endpoint on 127.0.0.1 with a fresh port
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if no port is free
    pub fn bind_any(&self) -> TransportResult<MemoryTransport> {
        self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    /// Change the loss rate of the running network
    pub fn set_loss_rate(&self, loss_rate: f64) {
        lock(&self.inner.config).loss_rate = loss_rate;
    }

    /// Drop all traffic to and from `addr`
    pub fn block(&self, addr: SocketAddr) {
        lock(&self.inner.blocked).insert(addr);
    }

    /// Undo [`MemoryNetwork::block`]
    pub fn unblock(&self, addr: SocketAddr) {
        lock(&self.inner.blocked).remove(&addr);
    }
}

/// Delivery plan for one datagram
struct Plan {
    copies: usize,
    delay: Duration,
}

impl NetworkInner {
    fn plan(&self, from: SocketAddr, to: SocketAddr) -> Option<Plan> {
        {
            let blocked = lock(&self.blocked);
            if blocked.contains(&from) || blocked.contains(&to) {
                return None;
            }
        }
        let config = lock(&self.config).clone();
        let mut rng = lock(&self.rng);
        if config.loss_rate > 0.0 && rng.gen_bool(config.loss_rate.min(1.0)) {
            return None;
        }
        let copies = if config.duplicate_rate > 0.0 && rng.gen_bool(config.duplicate_rate.min(1.0))
        {
            2
        } else {
            1
        };
        let mut delay = config.latency;
        if config.reorder_rate > 0.0 && rng.gen_bool(config.reorder_rate.min(1.0)) {
            delay += config.reorder_delay;
        }
        Some(Plan { copies, delay })
    }
}

/// One endpoint attached to a [`MemoryNetwork`]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<NetworkInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    closed: AtomicBool,
    counters: StatsCounters,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_DATAGRAM_SIZE {
            self.counters.record_send_error();
            return Err(TransportError::DatagramTooLarge {
                size: buf.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.counters.record_send(buf.len());

        let inbox = lock(&self.network.endpoints).get(&addr).cloned();
        let (Some(inbox), Some(plan)) = (inbox, self.network.plan(self.addr, addr)) else {
            self.counters.record_drop();
            tracing::trace!("memory network dropped datagram {} -> {}", self.addr, addr);
            return Ok(buf.len());
        };

        for _ in 0..plan.copies {
            let datagram = (buf.to_vec(), self.addr);
            if plan.delay.is_zero() {
                let _ = inbox.send(datagram);
            } else {
                let inbox = inbox.clone();
                let delay = plan.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send(datagram);
                });
            }
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        let (datagram, from) = rx.recv().await.ok_or(TransportError::Closed)?;
        let size = datagram.len().min(buf.len());
        buf[..size].copy_from_slice(&datagram[..size]);
        self.counters.record_recv(size);
        Ok((size, from))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        lock(&self.network.endpoints).remove(&self.addr);
        self.rx.lock().await.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) {
            lock(&self.network.endpoints).remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn recv(t: &MemoryTransport) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 2048];
        match timeout(Duration::from_millis(100), t.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => Some((buf[..n].to_vec(), from)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_perfect_delivery() {
        let net = MemoryNetwork::perfect();
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
        let (data, from) = recv(&b).await.unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let net = MemoryNetwork::perfect();
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let _a = net.bind(addr).unwrap();
        assert!(matches!(net.bind(addr), Err(TransportError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_full_loss() {
        let net = MemoryNetwork::new(SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        });
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        a.send_to(b"lost", b.local_addr().unwrap()).await.unwrap();
        assert!(recv(&b).await.is_none());
        assert_eq!(a.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_duplication() {
        let net = MemoryNetwork::new(SimulatorConfig {
            duplicate_rate: 1.0,
            ..SimulatorConfig::default()
        });
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        a.send_to(b"twice", b.local_addr().unwrap()).await.unwrap();
        assert!(recv(&b).await.is_some());
        assert!(recv(&b).await.is_some());
        assert!(recv(&b).await.is_none());
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let net = MemoryNetwork::perfect();
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        let b_addr = b.local_addr().unwrap();

        net.block(b_addr);
        a.send_to(b"x", b_addr).await.unwrap();
        assert!(recv(&b).await.is_none());

        net.unblock(b_addr);
        a.send_to(b"y", b_addr).await.unwrap();
        assert_eq!(recv(&b).await.unwrap().0, b"y");
    }

    #[tokio::test]
    async fn test_unknown_destination_is_silent() {
        let net = MemoryNetwork::perfect();
        let a = net.bind_any().unwrap();
        let sent = a
            .send_to(b"void", "10.9.9.9:1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(sent, 4);
        assert_eq!(a.stats().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reorder_delays_datagram() {
        let net = MemoryNetwork::new(SimulatorConfig {
            reorder_rate: 1.0,
            reorder_delay: Duration::from_millis(50),
            ..SimulatorConfig::default()
        });
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        a.send_to(b"late", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_close_releases_address() {
        let net = MemoryNetwork::perfect();
        let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let a = net.bind(addr).unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(net.bind(addr).is_ok());
    }
}
