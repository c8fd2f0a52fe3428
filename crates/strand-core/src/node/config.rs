//! Node configuration

use crate::chunk::ChunkConfig;
use crate::connection::ConnectionConfig;
use crate::node::error::{NodeError, Result};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use strand_crypto::PeerAddress;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 22527;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Overlay network id; envelopes of other networks are dropped
    pub network_id: u32,

    /// Address the CLI binds its UDP transport to
    pub bind_addr: SocketAddr,

    /// Super peers to register with (address to endpoint)
    pub super_peers: BTreeMap<PeerAddress, SocketAddr>,

    /// Permanent direct paths added at start
    pub static_routes: BTreeMap<PeerAddress, SocketAddr>,

    /// How long start waits for a super peer; `None` does not wait
    pub super_peer_timeout: Option<Duration>,

    /// Interval between hello rounds
    pub hello_interval: Duration,

    /// Direct paths without hello traffic for this long are removed
    pub hello_timeout: Duration,

    /// Relay budget; envelopes that used it up are dropped
    pub hop_limit: u8,

    /// Encrypt application payloads through the crypto service
    pub arming_enabled: bool,

    /// Discover nodes sharing an intra-process hub
    pub intra_process_discovery: bool,

    /// NAT port mapping
    pub port_mapping: PortMappingConfig,

    /// Chunking limits
    pub chunking: ChunkConfig,

    /// Reliable connection parameters; `None` sends chunks unreliably
    pub reliability: Option<ConnectionConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            super_peers: BTreeMap::new(),
            static_routes: BTreeMap::new(),
            super_peer_timeout: Some(Duration::from_secs(10)),
            hello_interval: Duration::from_secs(5),
            hello_timeout: Duration::from_secs(30),
            hop_limit: 8,
            arming_enabled: true,
            intra_process_discovery: true,
            port_mapping: PortMappingConfig::default(),
            chunking: ChunkConfig::default(),
            reliability: Some(ConnectionConfig::default()),
        }
    }
}

impl NodeConfig {
    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| NodeError::InvalidConfig(msg.into());

        self.chunking
            .validate()
            .map_err(|e| invalid(format!("chunking: {e}")))?;
        if let Some(reliability) = &self.reliability {
            reliability
                .validate()
                .map_err(|e| invalid(format!("reliability: {e}")))?;
        }
        if self.hello_interval.is_zero() {
            return Err(invalid("hello_interval must be positive".into()));
        }
        if self.hello_timeout <= self.hello_interval {
            return Err(invalid(format!(
                "hello_timeout {:?} must exceed hello_interval {:?}",
                self.hello_timeout, self.hello_interval
            )));
        }
        if self.hop_limit == 0 {
            return Err(invalid("hop_limit must be positive".into()));
        }
        if self.super_peer_timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("super_peer_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// A port mapping protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMapStrategy {
    /// Port Control Protocol (RFC 6887)
    Pcp,
    /// NAT Port Mapping Protocol (RFC 6886)
    NatPmp,
}

impl PortMapStrategy {
    /// Name used in configuration files
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pcp => "pcp",
            Self::NatPmp => "nat-pmp",
        }
    }
}

impl std::str::FromStr for PortMapStrategy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pcp" => Ok(Self::Pcp),
            "nat-pmp" => Ok(Self::NatPmp),
            other => Err(NodeError::InvalidConfig(
                format!("unknown port mapping strategy '{other}'").into(),
            )),
        }
    }
}

/// NAT port mapping configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingConfig {
    /// Try to map the node's port on the gateway
    pub enabled: bool,

    /// Gateway running the mapping service; mapping is skipped when unknown
    pub gateway: Option<SocketAddr>,

    /// Protocols to try, in order
    pub strategies: Vec<PortMapStrategy>,
}

impl Default for PortMappingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway: None,
            strategies: vec![PortMapStrategy::Pcp, PortMapStrategy::NatPmp],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network_id, 1);
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.hop_limit, 8);
        assert!(config.arming_enabled);
        assert!(config.reliability.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hello_timeout_must_exceed_interval() {
        let config = NodeConfig {
            hello_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
        assert!(err.to_string().contains("hello_timeout"));
    }

    #[test]
    fn test_invalid_chunking_rejected() {
        let mut config = NodeConfig::default();
        config.chunking.max_chunk_payload = 0;
        assert!(config.validate().unwrap_err().to_string().contains("chunking"));
    }

    #[test]
    fn test_zero_hop_limit_rejected() {
        let config = NodeConfig {
            hop_limit: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreliable_config_is_valid() {
        let config = NodeConfig {
            reliability: None,
            super_peer_timeout: None,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_mapping_strategy_order() {
        let config = PortMappingConfig::default();
        assert_eq!(
            config.strategies,
            vec![PortMapStrategy::Pcp, PortMapStrategy::NatPmp]
        );
        for strategy in config.strategies {
            assert_eq!(strategy.name().parse::<PortMapStrategy>().unwrap(), strategy);
        }
        assert!("upnp".parse::<PortMapStrategy>().is_err());
    }
}
