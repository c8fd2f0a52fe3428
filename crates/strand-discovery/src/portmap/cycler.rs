//! Port mapping strategy cycler.

use super::{MappingLease, PortMapping};
use crate::error::DiscoveryError;
use tokio::sync::watch;

/// Resolves once shutdown is requested or the sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs port mapping strategies in order until one holds a mapping.
///
/// ```text
/// strategy[0].map ──ok──► refresh every lifetime/2 ──fail──┐
///        │                                                  │
///       fail                                                ▼
///        └──► unmap, strategy[1].map ... ──► exhausted: log, give up
/// ```
pub struct PortMapper {
    strategies: Vec<Box<dyn PortMapping>>,
    lease: watch::Sender<Option<MappingLease>>,
}

impl PortMapper {
    /// Create a cycler over `strategies`, tried in the given order
    #[must_use]
    pub fn new(strategies: Vec<Box<dyn PortMapping>>) -> Self {
        let (lease, _) = watch::channel(None);
        Self { strategies, lease }
    }

    /// Number of configured strategies
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// True if there is nothing to try
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Observe the active mapping
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<MappingLease>> {
        self.lease.subscribe()
    }

    /// Map `internal_port` until `shutdown` flips to true.
    ///
    /// Returns `Ok(())` after a shutdown. The active strategy is unmapped
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NatMappingExhausted`] once every strategy
    /// failed. The caller should log it and carry on without a mapping.
    pub async fn run(
        mut self,
        internal_port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError> {
        for strategy in &mut self.strategies {
            let name = strategy.name();
            tracing::debug!("Starting port mapping strategy {}", name);

            let mut result = tokio::select! {
                r = strategy.map(internal_port) => r,
                () = stopped(&mut shutdown) => {
                    let _ = strategy.unmap().await;
                    return Ok(());
                }
            };

            loop {
                match result {
                    Ok(lease) => {
                        tracing::info!(
                            "Port mapping via {}: {} -> {} for {:?}",
                            name,
                            lease.external,
                            internal_port,
                            lease.lifetime
                        );
                        self.lease.send_replace(Some(lease));
                        tokio::select! {
                            () = tokio::time::sleep(lease.refresh_after()) => {
                                result = strategy.map(internal_port).await;
                            }
                            () = stopped(&mut shutdown) => {
                                if let Err(e) = strategy.unmap().await {
                                    tracing::debug!("Unmapping via {} failed: {}", name, e);
                                }
                                self.lease.send_replace(None);
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Port mapping via {} failed: {}", name, e);
                        self.lease.send_replace(None);
                        let _ = strategy.unmap().await;
                        break;
                    }
                }
            }
        }

        tracing::warn!(
            "{}; continuing without port mapping",
            DiscoveryError::NatMappingExhausted
        );
        Err(DiscoveryError::NatMappingExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portmap::PortMapError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Scripted strategy: each map() call pops the next outcome
    struct Scripted {
        name: &'static str,
        outcomes: Vec<bool>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PortMapping for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn map(&mut self, _port: u16) -> Result<MappingLease, PortMapError> {
            self.log.lock().unwrap().push(format!("map {}", self.name));
            let ok = if self.outcomes.is_empty() {
                false
            } else {
                self.outcomes.remove(0)
            };
            if ok {
                Ok(MappingLease {
                    external: "203.0.113.1:40000".parse().unwrap(),
                    lifetime: Duration::from_secs(10),
                })
            } else {
                Err(PortMapError::Timeout)
            }
        }

        async fn unmap(&mut self) -> Result<(), PortMapError> {
            self.log.lock().unwrap().push(format!("unmap {}", self.name));
            Ok(())
        }
    }

    fn scripted(
        name: &'static str,
        outcomes: Vec<bool>,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Box<dyn PortMapping> {
        Box::new(Scripted {
            name,
            outcomes,
            log: Arc::clone(log),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_advances_to_next_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mapper = PortMapper::new(vec![
            scripted("a", vec![false], &log),
            scripted("b", vec![true, true], &log),
        ]);
        let leases = mapper.subscribe();
        let (stop, shutdown) = watch::channel(false);

        let task = tokio::spawn(mapper.run(22527, shutdown));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(leases.borrow().is_some());

        stop.send_replace(true);
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["map a", "unmap a", "map b", "unmap b"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_is_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mapper = PortMapper::new(vec![
            scripted("a", vec![false], &log),
            scripted("b", vec![false], &log),
        ]);
        let (_stop, shutdown) = watch::channel(false);
        assert_eq!(
            mapper.run(22527, shutdown).await,
            Err(DiscoveryError::NatMappingExhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_moves_on() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mapper = PortMapper::new(vec![
            scripted("a", vec![true, false], &log),
            scripted("b", vec![true], &log),
        ]);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(mapper.run(22527, shutdown));

        // Lease lifetime is 10s, so the refresh of "a" happens at 5s and fails.
        tokio::time::sleep(Duration::from_secs(6)).await;
        stop.send_replace(true);
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["map a", "map a", "unmap a", "map b", "unmap b"]
        );
    }

    #[tokio::test]
    async fn test_empty_list_exhausted() {
        let mapper = PortMapper::new(Vec::new());
        assert!(mapper.is_empty());
        let (_stop, shutdown) = watch::channel(false);
        assert_eq!(
            mapper.run(1, shutdown).await,
            Err(DiscoveryError::NatMappingExhausted)
        );
    }
}
