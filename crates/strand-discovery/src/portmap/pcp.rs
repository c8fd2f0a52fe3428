//! PCP (RFC 6887) client, MAP opcode only.
//!
//! Requests and responses are 60 bytes: a 24 byte common header followed by
//! the 36 byte MAP body. Addresses are IPv4-mapped IPv6.
//!
//! ```text
//! request : [ver=2][op=1][reserved 2B][lifetime u32][client ip 16B]
//!           [nonce 12B][proto][reserved 3B][internal u16][external u16][external ip 16B]
//! response: [ver=2][op=129][reserved][result u8][lifetime u32][epoch u32][reserved 12B]
//!           [nonce 12B][proto][reserved 3B][internal u16][external u16][external ip 16B]
//! ```

use super::{MappingLease, PortMapError, PortMapping};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// PCP server port on the gateway
pub const PCP_PORT: u16 = 5351;

/// Length of the mapping nonce
pub const NONCE_LEN: usize = 12;

const VERSION: u8 = 2;
const OP_MAP: u8 = 1;
const RESPONSE_BIT: u8 = 128;
const PROTO_UDP: u8 = 17;
const MESSAGE_LEN: usize = 60;
const DEFAULT_LIFETIME: u32 = 7200;
const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_TRIES: u32 = 4;

fn mapped_v6(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn map_request(
    client: IpAddr,
    nonce: &[u8; NONCE_LEN],
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> [u8; MESSAGE_LEN] {
    let mut buf = [0u8; MESSAGE_LEN];
    buf[0] = VERSION;
    buf[1] = OP_MAP;
    buf[4..8].copy_from_slice(&lifetime.to_be_bytes());
    buf[8..24].copy_from_slice(&mapped_v6(client));
    buf[24..36].copy_from_slice(nonce);
    buf[36] = PROTO_UDP;
    buf[40..42].copy_from_slice(&internal_port.to_be_bytes());
    buf[42..44].copy_from_slice(&external_port.to_be_bytes());
    buf[44..60].copy_from_slice(&mapped_v6(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
    buf
}

/// Parsed MAP response
#[derive(Debug, PartialEq, Eq)]
struct MapResponse {
    lifetime: u32,
    internal: u16,
    external: SocketAddr,
}

fn parse_map_response(
    buf: &[u8],
    nonce: &[u8; NONCE_LEN],
) -> Result<MapResponse, PortMapError> {
    if buf.len() < MESSAGE_LEN {
        return Err(PortMapError::Malformed("response too short"));
    }
    if buf[0] != VERSION {
        return Err(PortMapError::Malformed("unsupported version"));
    }
    if buf[1] != OP_MAP | RESPONSE_BIT {
        return Err(PortMapError::Malformed("unexpected opcode"));
    }
    if buf[3] != 0 {
        return Err(PortMapError::Rejected(u16::from(buf[3])));
    }
    if &buf[24..36] != nonce {
        return Err(PortMapError::Malformed("nonce mismatch"));
    }

    let lifetime = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let internal = u16::from_be_bytes([buf[40], buf[41]]);
    let port = u16::from_be_bytes([buf[42], buf[43]]);
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[44..60]);
    let v6 = Ipv6Addr::from(octets);
    let ip = v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4);

    Ok(MapResponse {
        lifetime,
        internal,
        external: SocketAddr::new(ip, port),
    })
}

/// PCP strategy talking to a configured gateway
pub struct PcpMapping {
    gateway: SocketAddr,
    nonce: [u8; NONCE_LEN],
    lifetime: u32,
    mapped: Option<(u16, u16)>,
}

impl PcpMapping {
    /// Strategy for the gateway at `gateway` (port 5351 is added if zero).
    ///
    /// The gateway matches renewals and deletions to the mapping by `nonce`,
    /// so it must stay the same for the life of the node.
    #[must_use]
    pub fn new(gateway: SocketAddr, nonce: [u8; NONCE_LEN]) -> Self {
        let gateway = if gateway.port() == 0 {
            SocketAddr::new(gateway.ip(), PCP_PORT)
        } else {
            gateway
        };
        Self {
            gateway,
            nonce,
            lifetime: DEFAULT_LIFETIME,
            mapped: None,
        }
    }

    /// Gateway address
    #[must_use]
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Send a MAP request and wait for the matching response.
    async fn exchange(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<MapResponse, PortMapError> {
        let unspecified = match self.gateway {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        socket.connect(self.gateway).await?;
        // The gateway checks the client address against the packet source.
        let client = socket.local_addr()?.ip();
        let request = map_request(client, &self.nonce, internal_port, external_port, lifetime);

        let mut timeout = INITIAL_TIMEOUT;
        let mut buf = [0u8; 1100];
        for attempt in 1..=MAX_TRIES {
            socket.send(&request).await?;
            match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => return parse_map_response(&buf[..n], &self.nonce),
                Ok(Err(e)) => return Err(PortMapError::Io(e)),
                Err(_) => {
                    tracing::trace!(
                        "PCP request to {} timed out (attempt {}/{})",
                        self.gateway,
                        attempt,
                        MAX_TRIES
                    );
                    timeout *= 2;
                }
            }
        }
        Err(PortMapError::Timeout)
    }
}

#[async_trait]
impl PortMapping for PcpMapping {
    fn name(&self) -> &'static str {
        "pcp"
    }

    async fn map(&mut self, internal_port: u16) -> Result<MappingLease, PortMapError> {
        let suggested = self.mapped.map_or(internal_port, |(_, external)| external);
        let response = self.exchange(internal_port, suggested, self.lifetime).await?;
        if response.internal != internal_port {
            return Err(PortMapError::Malformed("internal port mismatch"));
        }
        if response.lifetime == 0 {
            return Err(PortMapError::Malformed("zero lifetime"));
        }
        self.mapped = Some((response.internal, response.external.port()));

        Ok(MappingLease {
            external: response.external,
            lifetime: Duration::from_secs(u64::from(response.lifetime)),
        })
    }

    async fn unmap(&mut self) -> Result<(), PortMapError> {
        let Some((internal, _)) = self.mapped.take() else {
            return Ok(());
        };
        self.exchange(internal, 0, 0).await.map(|_| ())
    }
}
