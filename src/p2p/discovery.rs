//! Discovery Adapter - turns discovered node records into peer-store updates
//!
//! Invoked once per record handed over by the discovery service. The only
//! network I/O is the optional geolocation lookup, and that is best-effort.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{CrawlerError, Result};
use crate::metrics::CrawlerMetrics;
use crate::p2p::geo::{is_routable, GeoLocator};
use crate::p2p::peer_store::PeerRecordStore;
use crate::p2p::types::{ForkDigest, Multiaddr, PeerId};

/// Network fields advertised under the `eth2` key of a node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eth2Data {
    pub fork_digest: ForkDigest,
    #[serde(default)]
    pub next_fork_version: [u8; 4],
    #[serde(default)]
    pub next_fork_epoch: u64,
}

/// Decoded discovery record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub seq: u64,
    pub public_key: Vec<u8>,
    pub ip: Option<IpAddr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub eth2: Option<Eth2Data>,
}

impl NodeRecord {
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    /// Discovery node id: hex SHA-256 of the public key
    pub fn node_id(&self) -> String {
        hex::encode(Sha256::digest(&self.public_key))
    }

    /// TCP transport address advertised by the record
    pub fn tcp_multiaddr(&self) -> Result<Multiaddr> {
        match (self.ip, self.tcp_port) {
            (Some(ip), Some(port)) => Ok(Multiaddr::from_socket((ip, port).into())),
            _ => Err(CrawlerError::Decode(format!(
                "node record {} has no ip/tcp endpoint",
                self.node_id()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    MissingForkDigest,
    DigestMismatch(ForkDigest),
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterReason::MissingForkDigest => write!(f, "record carries no fork digest"),
            FilterReason::DigestMismatch(digest) => write!(f, "fork digest {} does not match", digest),
        }
    }
}

/// Result of handling one record; `Filtered` is a normal negative outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Record or address set changed
    Updated(PeerId),
    /// Nothing new about this peer
    Unchanged(PeerId),
    Filtered(FilterReason),
    /// Adding to the peer store is disabled
    Ignored,
}

impl DiscoveryOutcome {
    /// Collapse into the peer that was accepted. Filtered and ignored records
    /// become errors for callers that only care about accepted peers.
    pub fn into_result(self) -> Result<PeerId> {
        match self {
            DiscoveryOutcome::Updated(peer) | DiscoveryOutcome::Unchanged(peer) => Ok(peer),
            DiscoveryOutcome::Filtered(reason) => Err(CrawlerError::Filtered(reason.to_string())),
            DiscoveryOutcome::Ignored => Err(CrawlerError::InvalidState(
                "adding discovered peers is disabled".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub add: bool,
    /// Presence enables filtering
    pub filter_digest: Option<ForkDigest>,
    pub address_ttl: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            add: true,
            filter_digest: None,
            address_ttl: Duration::from_secs(3600),
        }
    }
}

pub struct DiscoveryAdapter {
    store: Arc<PeerRecordStore>,
    locator: Arc<dyn GeoLocator>,
    metrics: Arc<CrawlerMetrics>,
    settings: DiscoverySettings,
}

impl DiscoveryAdapter {
    pub fn new(
        store: Arc<PeerRecordStore>,
        locator: Arc<dyn GeoLocator>,
        metrics: Arc<CrawlerMetrics>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            store,
            locator,
            metrics,
            settings,
        }
    }

    pub async fn handle(&self, record: &NodeRecord) -> Result<DiscoveryOutcome> {
        let peer_id = record.peer_id();

        if !self.settings.add {
            return Ok(DiscoveryOutcome::Ignored);
        }

        if let Some(filter) = self.settings.filter_digest {
            let reason = match &record.eth2 {
                None => Some(FilterReason::MissingForkDigest),
                Some(eth2) if eth2.fork_digest != filter => {
                    Some(FilterReason::DigestMismatch(eth2.fork_digest))
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                debug!(peer = %peer_id, ?reason, "[DISCOVERY] Record filtered");
                self.metrics.filtered_records.inc();
                return Ok(DiscoveryOutcome::Filtered(reason));
            }
        }

        let addr = record.tcp_multiaddr()?;
        let node_id = record.node_id();

        let enr_updated = self
            .store
            .update_enr(&peer_id, record.seq, &record.public_key, &node_id);
        let addr_added = self
            .store
            .add_address(&peer_id, addr.clone(), self.settings.address_ttl);

        let ip = record.ip;
        let fork_digest = record.eth2.as_ref().map(|e| e.fork_digest);
        let needs_geo = self.store.upsert(&peer_id, |r| {
            if let Some(ip) = ip {
                r.ip = Some(ip.to_string());
            }
            if fork_digest.is_some() {
                r.fork_digest = fork_digest;
            }
            r.geo.is_none()
        });

        if needs_geo {
            if let Some(ip) = ip.filter(is_routable) {
                match self.locator.locate(ip).await {
                    Ok(geo) => self.store.upsert(&peer_id, |r| r.geo = Some(geo)),
                    Err(e) => warn!(
                        "[DISCOVERY] Could not get location for {} via {}: {}",
                        ip,
                        self.locator.name(),
                        e
                    ),
                }
            }
        }

        if enr_updated || addr_added {
            self.metrics.discovered_peers.inc();
            info!(
                peer = %peer_id,
                node_id = %node_id,
                addr = %addr,
                seq = record.seq,
                "[DISCOVERY] Updated node record"
            );
            Ok(DiscoveryOutcome::Updated(peer_id))
        } else {
            Ok(DiscoveryOutcome::Unchanged(peer_id))
        }
    }
}
