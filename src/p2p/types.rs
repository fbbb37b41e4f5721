//! Peer identity and addressing primitives
//!
//! `PeerId` is the base58 form of a SHA-256 multihash over the node public key.
//! `Multiaddr` is a small textual multiaddress (`/ip4/1.2.3.4/tcp/9000/p2p/<id>`)
//! covering the components the crawler needs to dial.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::CrawlerError;

/// Multihash code for sha2-256 followed by the digest length
const SHA256_MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

/// Stable, opaque node identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Derive the peer id from a raw public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut multihash = Vec::with_capacity(34);
        multihash.extend_from_slice(&SHA256_MULTIHASH_PREFIX);
        multihash.extend_from_slice(&digest);
        PeerId(bs58::encode(multihash).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CrawlerError::Decode("empty peer id".to_string()));
        }
        bs58::decode(s)
            .into_vec()
            .map_err(|e| CrawlerError::Decode(format!("invalid peer id {}: {}", s, e)))?;
        Ok(PeerId(s.to_string()))
    }
}

impl TryFrom<String> for PeerId {
    type Error = CrawlerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

/// One component of a multiaddress
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Tcp(u16),
    Udp(u16),
    P2p(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Multiaddr(Vec<Protocol>);

impl Multiaddr {
    pub fn from_socket(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        };
        Multiaddr(vec![ip, Protocol::Tcp(addr.port())])
    }

    pub fn with_peer_id(mut self, id: PeerId) -> Self {
        self.0.push(Protocol::P2p(id));
        self
    }

    pub fn components(&self) -> &[Protocol] {
        &self.0
    }

    /// Split into the transport part and the trailing `/p2p/<id>` component.
    ///
    /// The transport part is `None` when nothing but the peer id is present,
    /// because a bare `/p2p/<id>` cannot be dialed.
    pub fn split_peer_id(&self) -> (Option<Multiaddr>, Option<PeerId>) {
        let mut parts = self.0.clone();
        let id = match parts.last() {
            Some(Protocol::P2p(id)) => {
                let id = id.clone();
                parts.pop();
                Some(id)
            }
            _ => None,
        };
        let transport = if parts.is_empty() {
            None
        } else {
            Some(Multiaddr(parts))
        };
        (transport, id)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.0.iter().find_map(|p| match p {
            Protocol::Ip4(v4) => Some(IpAddr::V4(*v4)),
            Protocol::Ip6(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        })
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.0.iter().find_map(|p| match p {
            Protocol::Tcp(port) => Some(*port),
            _ => None,
        })
    }

    /// Resolve to a dialable TCP socket address, if the address carries one
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.tcp_port()?))
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.0 {
            match p {
                Protocol::Ip4(ip) => write!(f, "/ip4/{}", ip)?,
                Protocol::Ip6(ip) => write!(f, "/ip6/{}", ip)?,
                Protocol::Dns(host) => write!(f, "/dns/{}", host)?,
                Protocol::Tcp(port) => write!(f, "/tcp/{}", port)?,
                Protocol::Udp(port) => write!(f, "/udp/{}", port)?,
                Protocol::P2p(id) => write!(f, "/p2p/{}", id)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| CrawlerError::Decode(format!("invalid multiaddr {}: {}", s, why));

        let rest = s.strip_prefix('/').ok_or_else(|| bad("must start with '/'"))?;
        let mut parts = rest.split('/');
        let mut out = Vec::new();

        while let Some(name) = parts.next() {
            let value = parts.next().ok_or_else(|| bad("missing component value"))?;
            let proto = match name {
                "ip4" => Protocol::Ip4(value.parse().map_err(|_| bad("bad ip4"))?),
                "ip6" => Protocol::Ip6(value.parse().map_err(|_| bad("bad ip6"))?),
                "dns" | "dns4" | "dns6" => Protocol::Dns(value.to_string()),
                "tcp" => Protocol::Tcp(value.parse().map_err(|_| bad("bad tcp port"))?),
                "udp" => Protocol::Udp(value.parse().map_err(|_| bad("bad udp port"))?),
                "p2p" | "ipfs" => Protocol::P2p(value.parse()?),
                other => return Err(bad(&format!("unsupported protocol '{}'", other))),
            };
            out.push(proto);
        }

        if out.is_empty() {
            return Err(bad("no components"));
        }
        Ok(Multiaddr(out))
    }
}

impl TryFrom<String> for Multiaddr {
    type Error = CrawlerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Multiaddr> for String {
    fn from(addr: Multiaddr) -> Self {
        addr.to_string()
    }
}

/// Peer id plus the transport addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// Build a dialable address set, dropping `/p2p/<id>` suffixes and
    /// addresses that have no transport part at all.
    pub fn dialable(id: PeerId, addrs: &[Multiaddr]) -> Self {
        let addrs = addrs
            .iter()
            .filter_map(|m| m.split_peer_id().0)
            .collect();
        AddrInfo { id, addrs }
    }
}

/// 4-byte identifier of the network/fork a node follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ForkDigest(pub [u8; 4]);

impl fmt::Display for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for ForkDigest {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches("0x");
        let bytes = hex::decode(trimmed)
            .map_err(|e| CrawlerError::Decode(format!("invalid fork digest {}: {}", s, e)))?;
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| CrawlerError::Decode(format!("fork digest {} must be 4 bytes", s)))?;
        Ok(ForkDigest(arr))
    }
}

impl TryFrom<String> for ForkDigest {
    type Error = CrawlerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ForkDigest> for String {
    fn from(d: ForkDigest) -> Self {
        d.to_string()
    }
}
