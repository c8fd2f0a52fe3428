//! Configuration file for the strand CLI.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strand_core::node::{NodeConfig, PortMapStrategy, PortMappingConfig};
use strand_core::{ChunkConfig, ConnectionConfig, SequenceWidth};
use strand_crypto::PeerAddress;

/// strand configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity and network
    #[serde(default)]
    pub node: NodeSection,
    /// Super peers, static routes and hello timing
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Chunking, reliability and encryption
    #[serde(default)]
    pub transport: TransportSection,
    /// NAT port mapping
    #[serde(default)]
    pub port_mapping: PortMappingSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Hex secret key file
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
    /// Overlay network id
    #[serde(default = "default_network_id")]
    pub network_id: u32,
    /// UDP bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Discover nodes in the same process
    #[serde(default = "default_true")]
    pub intra_process_discovery: bool,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Super peers as `ADDRESS@HOST:PORT`
    #[serde(default)]
    pub super_peers: Vec<String>,
    /// Static routes as `ADDRESS@HOST:PORT`
    #[serde(default)]
    pub static_routes: Vec<String>,
    /// Seconds to wait for a super peer at startup; 0 does not wait
    #[serde(default = "default_super_peer_timeout")]
    pub super_peer_timeout_secs: u64,
    /// Seconds between hello rounds
    #[serde(default = "default_hello_interval")]
    pub hello_interval_secs: u64,
    /// Seconds without hello traffic before a path is dropped
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,
    /// Relay hop budget
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Encrypt application payloads
    #[serde(default = "default_true")]
    pub arming: bool,
    /// Run a reliable connection per peer
    #[serde(default = "default_true")]
    pub reliable: bool,
    /// Payload bytes per chunk
    #[serde(default = "default_chunk_payload")]
    pub chunk_payload: usize,
    /// Largest message in bytes
    #[serde(default = "default_max_message")]
    pub max_message: usize,
    /// Chunk sequence field width in bytes (1, 2 or 3)
    #[serde(default = "default_sequence_width")]
    pub sequence_width: u8,
    /// Seconds to wait for the rest of a chunked message
    #[serde(default = "default_reassembly_timeout")]
    pub reassembly_timeout_secs: u64,
}

/// Port mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMappingSection {
    /// Map the node's port on the gateway
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Gateway `HOST:PORT`; the port defaults to 5351 when zero
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Protocols to try in order: `pcp`, `nat-pmp`
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default log level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_identity_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("strand/identity.key")
}

fn default_network_id() -> u32 {
    NodeConfig::default().network_id
}

fn default_bind_addr() -> String {
    NodeConfig::default().bind_addr.to_string()
}

fn default_true() -> bool {
    true
}

fn default_strategies() -> Vec<String> {
    PortMappingConfig::default()
        .strategies
        .iter()
        .map(|strategy| strategy.name().to_string())
        .collect()
}

fn default_super_peer_timeout() -> u64 {
    10
}

fn default_hello_interval() -> u64 {
    5
}

fn default_hello_timeout() -> u64 {
    30
}

fn default_hop_limit() -> u8 {
    8
}

fn default_chunk_payload() -> usize {
    ChunkConfig::default().max_chunk_payload
}

fn default_max_message() -> usize {
    ChunkConfig::default().max_content_length
}

fn default_sequence_width() -> u8 {
    2
}

fn default_reassembly_timeout() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            identity_file: default_identity_file(),
            network_id: default_network_id(),
            bind_addr: default_bind_addr(),
            intra_process_discovery: true,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            super_peers: Vec::new(),
            static_routes: Vec::new(),
            super_peer_timeout_secs: default_super_peer_timeout(),
            hello_interval_secs: default_hello_interval(),
            hello_timeout_secs: default_hello_timeout(),
            hop_limit: default_hop_limit(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            arming: true,
            reliable: true,
            chunk_payload: default_chunk_payload(),
            max_message: default_max_message(),
            sequence_width: default_sequence_width(),
            reassembly_timeout_secs: default_reassembly_timeout(),
        }
    }
}

impl Default for PortMappingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway: None,
            strategies: default_strategies(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parse `ADDRESS@HOST:PORT`
///
/// # Errors
///
/// Returns an error if the address is not 64 hex characters or the
/// endpoint does not resolve.
pub fn parse_peer_endpoint(value: &str) -> anyhow::Result<(PeerAddress, SocketAddr)> {
    let (address, endpoint) = value
        .split_once('@')
        .with_context(|| format!("'{value}' is not ADDRESS@HOST:PORT"))?;
    let address: PeerAddress = address
        .parse()
        .with_context(|| format!("invalid peer address in '{value}'"))?;
    let endpoint = endpoint
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve '{endpoint}'"))?
        .next()
        .with_context(|| format!("'{endpoint}' resolved to no address"))?;
    Ok((address, endpoint))
}

fn parse_peer_map(values: &[String]) -> anyhow::Result<BTreeMap<PeerAddress, SocketAddr>> {
    values.iter().map(|v| parse_peer_endpoint(v)).collect()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("strand/config.toml")
    }

    /// Load `path`, falling back to defaults when the default file is missing
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed, or if an
    /// explicitly given file does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if path == Self::default_path() {
            Ok(Self::default())
        } else {
            anyhow::bail!("Config file not found: {}", path.display())
        }
    }

    /// Build the node configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an address, peer entry or limit is invalid.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let bind_addr: SocketAddr = self
            .node
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.node.bind_addr))?;
        let sequence_width = SequenceWidth::from_bytes(self.transport.sequence_width)
            .with_context(|| {
                format!(
                    "sequence_width must be 1, 2 or 3, got {}",
                    self.transport.sequence_width
                )
            })?;
        let gateway = self
            .port_mapping
            .gateway
            .as_deref()
            .map(|gateway| {
                gateway
                    .parse::<SocketAddr>()
                    .with_context(|| format!("invalid port mapping gateway '{gateway}'"))
            })
            .transpose()?;
        let strategies = self
            .port_mapping
            .strategies
            .iter()
            .map(|name| name.parse::<PortMapStrategy>())
            .collect::<Result<Vec<_>, _>>()?;

        let chunking = ChunkConfig {
            max_content_length: self.transport.max_message,
            max_chunk_payload: self.transport.chunk_payload,
            max_chunks: ChunkConfig::default()
                .max_chunks
                .min(sequence_width.max_value()),
            sequence_width,
            timeout: Duration::from_secs(self.transport.reassembly_timeout_secs),
        };
        let discovery = &self.discovery;
        let config = NodeConfig {
            network_id: self.node.network_id,
            bind_addr,
            super_peers: parse_peer_map(&discovery.super_peers)?,
            static_routes: parse_peer_map(&discovery.static_routes)?,
            super_peer_timeout: (discovery.super_peer_timeout_secs > 0)
                .then(|| Duration::from_secs(discovery.super_peer_timeout_secs)),
            hello_interval: Duration::from_secs(discovery.hello_interval_secs),
            hello_timeout: Duration::from_secs(discovery.hello_timeout_secs),
            hop_limit: discovery.hop_limit,
            arming_enabled: self.transport.arming,
            intra_process_discovery: self.node.intra_process_discovery,
            port_mapping: PortMappingConfig {
                enabled: self.port_mapping.enabled,
                gateway,
                strategies,
            },
            chunking,
            reliability: self.transport.reliable.then(ConnectionConfig::default),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        self.to_node_config()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.bind_addr, "0.0.0.0:22527");
        assert_eq!(config.discovery.hop_limit, 8);
        assert!(config.transport.reliable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_peer_endpoint() {
        let (address, endpoint) = parse_peer_endpoint(&format!("{PEER}@127.0.0.1:4000")).unwrap();
        assert_eq!(address, PeerAddress::from_bytes([1; 32]));
        assert_eq!(endpoint, "127.0.0.1:4000".parse().unwrap());

        assert!(parse_peer_endpoint("127.0.0.1:4000").is_err());
        assert!(parse_peer_endpoint("abcd@127.0.0.1:4000").is_err());
    }

    #[test]
    fn test_node_config_mapping() {
        let mut config = Config::default();
        config.discovery.super_peers = vec![format!("{PEER}@10.0.0.1:22527")];
        config.discovery.super_peer_timeout_secs = 0;
        config.transport.reliable = false;
        config.transport.sequence_width = 1;
        config.port_mapping.gateway = Some("192.168.1.1:5351".into());
        config.port_mapping.strategies = vec!["nat-pmp".into()];

        let node = config.to_node_config().unwrap();
        assert_eq!(node.super_peers.len(), 1);
        assert_eq!(node.super_peer_timeout, None);
        assert!(node.reliability.is_none());
        assert_eq!(node.chunking.max_chunks, 255);
        assert_eq!(
            node.port_mapping.gateway,
            Some("192.168.1.1:5351".parse().unwrap())
        );
        assert_eq!(node.port_mapping.strategies, vec![PortMapStrategy::NatPmp]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.sequence_width = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.hello_timeout_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.discovery.static_routes = vec![format!("{PEER}@127.0.0.1:9000")];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.discovery.static_routes, config.discovery.static_routes);
        assert_eq!(loaded.node.network_id, config.node.network_id);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[node]\nnetwork_id = 9\n").unwrap();
        assert_eq!(config.node.network_id, 9);
        assert_eq!(config.discovery.hello_interval_secs, 5);
    }

    #[test]
    fn test_missing_explicit_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_or_default(&dir.path().join("nope.toml")).is_err());
    }
}
