//! Peer Record Store - single source of truth about every known peer
//!
//! Records are keyed by [`PeerId`] and never deleted during a crawl session.
//! Locking is per peer: the map shard is only held long enough to find or
//! insert the peer's entry, every mutation then runs under that peer's own
//! mutex. Discovery, dialing and RPC enrichment for different peers therefore
//! never contend, while updates to the same peer are serialized in the order
//! they arrive.
//!
//! Reads hand out owned copies; nothing outside this module touches the
//! shared records directly.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::p2p::geo::GeoLocation;
use crate::p2p::types::{AddrInfo, ForkDigest, Multiaddr, PeerId};
use crate::rpc::methods::{MetaData, Status};

/// Keep at most this many connection timestamps per peer
const MAX_CONNECTION_TIMES: usize = 64;

/// Advertised address with its own expiry (unix millis)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub addr: Multiaddr,
    pub expires_at_ms: i64,
}

impl AddressEntry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Everything the crawler knows about one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,

    /// Public key (hex), filled from the node record
    #[serde(default)]
    pub public_key: Option<String>,

    /// Discovery node identifier (hex)
    #[serde(default)]
    pub node_id: Option<String>,

    /// Sequence number of the last accepted node record
    #[serde(default)]
    pub enr_seq: Option<u64>,

    #[serde(default)]
    pub addresses: Vec<AddressEntry>,

    /// IP taken from the node record or the live connection
    #[serde(default)]
    pub ip: Option<String>,

    // ========================================================================
    // CLIENT METADATA (filled by the status RPC / identify)
    // ========================================================================
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub client_os: Option<String>,

    /// Last fork digest seen in the node record or status
    #[serde(default)]
    pub fork_digest: Option<ForkDigest>,
    #[serde(default)]
    pub head_slot: Option<u64>,
    #[serde(default)]
    pub finalized_epoch: Option<u64>,
    #[serde(default)]
    pub metadata_seq: Option<u64>,
    #[serde(default)]
    pub attnets: Option<[u8; 8]>,
    #[serde(default)]
    pub latency_ms: Option<u32>,

    // ========================================================================
    // CONNECTION HISTORY
    // ========================================================================
    #[serde(default)]
    pub attempts: u64,
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub last_attempt: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub connection_times: Vec<i64>,
    #[serde(default)]
    pub metadata_requested: bool,
    #[serde(default)]
    pub metadata_succeeded: bool,

    /// Seconds after `last_attempt` before the peer is dialed again
    #[serde(default)]
    pub penalty_secs: u64,
    /// Never dialed again until a newer node record arrives
    #[serde(default)]
    pub deprecated: bool,

    /// Best-effort location, never authoritative
    #[serde(default)]
    pub geo: Option<GeoLocation>,

    pub first_seen: i64,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            public_key: None,
            node_id: None,
            enr_seq: None,
            addresses: Vec::new(),
            ip: None,
            user_agent: None,
            client_name: None,
            client_version: None,
            client_os: None,
            fork_digest: None,
            head_slot: None,
            finalized_epoch: None,
            metadata_seq: None,
            attnets: None,
            latency_ms: None,
            attempts: 0,
            successes: 0,
            last_attempt: None,
            last_error: None,
            connection_times: Vec::new(),
            metadata_requested: false,
            metadata_succeeded: false,
            penalty_secs: 0,
            deprecated: false,
            geo: None,
            first_seen: Utc::now().timestamp(),
        }
    }

    /// Fraction of connection attempts that succeeded
    pub fn success_ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// True while the peer must not be dialed: deprecated, or still inside
    /// the penalty window that follows its last attempt
    pub fn is_waiting(&self, now_secs: i64) -> bool {
        if self.deprecated {
            return true;
        }
        match self.last_attempt {
            Some(last) if self.penalty_secs > 0 => {
                let until = last.saturating_add(self.penalty_secs.min(i64::MAX as u64) as i64);
                now_secs < until
            }
            _ => false,
        }
    }

    /// Addresses that have not expired yet
    pub fn live_addresses(&self) -> Vec<Multiaddr> {
        let now = Utc::now().timestamp_millis();
        self.addresses
            .iter()
            .filter(|a| a.is_live(now))
            .map(|a| a.addr.clone())
            .collect()
    }

    fn prune_expired(&mut self, now_ms: i64) {
        self.addresses.retain(|a| a.is_live(now_ms));
    }
}

/// Concurrent peer registry
#[derive(Default)]
pub struct PeerRecordStore {
    peers: DashMap<PeerId, Arc<Mutex<PeerRecord>>>,
}

impl PeerRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the per-peer slot. The shard lock is released before
    /// the caller locks the record.
    fn slot(&self, peer: &PeerId) -> Arc<Mutex<PeerRecord>> {
        if let Some(existing) = self.peers.get(peer) {
            return Arc::clone(existing.value());
        }
        let slot = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| {
                debug!(peer = %peer, "[PEER STORE] New peer record");
                Arc::new(Mutex::new(PeerRecord::new(peer.clone())))
            });
        Arc::clone(slot.value())
    }

    /// Copy of a peer's record with expired addresses pruned
    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        let slot = self.peers.get(peer).map(|s| Arc::clone(s.value()))?;
        let mut record = slot.lock();
        record.prune_expired(Utc::now().timestamp_millis());
        Some(record.clone())
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Apply a field-level mutation under the peer's lock, creating the
    /// record first if needed
    pub fn upsert<R>(&self, peer: &PeerId, mutate: impl FnOnce(&mut PeerRecord) -> R) -> R {
        let slot = self.slot(peer);
        let mut record = slot.lock();
        mutate(&mut record)
    }

    /// Add or refresh an address. Returns true when the live address set changed.
    pub fn add_address(&self, peer: &PeerId, addr: Multiaddr, ttl: Duration) -> bool {
        let now = Utc::now().timestamp_millis();
        let expires_at_ms = now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);

        self.upsert(peer, |record| {
            record.prune_expired(now);
            if let Some(entry) = record.addresses.iter_mut().find(|a| a.addr == addr) {
                entry.expires_at_ms = entry.expires_at_ms.max(expires_at_ms);
                false
            } else {
                record.addresses.push(AddressEntry {
                    addr,
                    expires_at_ms,
                });
                true
            }
        })
    }

    /// Accept a node record only if it is newer than the one we hold.
    /// Returns true when the record was new or had a higher sequence number.
    pub fn update_enr(&self, peer: &PeerId, seq: u64, public_key: &[u8], node_id: &str) -> bool {
        self.upsert(peer, |record| {
            let newer = record.enr_seq.map_or(true, |current| seq > current);
            if newer {
                if record.deprecated {
                    debug!(peer = %peer, seq, "[PEER STORE] Newer node record lifts deprecation");
                }
                record.deprecated = false;
                record.enr_seq = Some(seq);
                record.public_key = Some(hex::encode(public_key));
                record.node_id = Some(node_id.to_string());
            }
            newer
        })
    }

    /// Count one connection attempt and, on success, one success
    pub fn record_attempt(&self, peer: &PeerId, success: bool, error: Option<&str>) {
        let now = Utc::now().timestamp();
        self.upsert(peer, |record| {
            record.attempts += 1;
            record.last_attempt = Some(now);
            if success {
                record.successes += 1;
                record.last_error = None;
                record.penalty_secs = 0;
                record.deprecated = false;
                record.connection_times.push(now);
                if record.connection_times.len() > MAX_CONNECTION_TIMES {
                    record.connection_times.remove(0);
                }
            } else {
                record.last_error = Some(error.unwrap_or("unknown").to_string());
            }
        });
    }

    /// Extend the peer's wait window by `step`. Returns the new window.
    pub fn penalize(&self, peer: &PeerId, step: Duration) -> Duration {
        self.upsert(peer, |record| {
            record.penalty_secs = record.penalty_secs.saturating_add(step.as_secs());
            Duration::from_secs(record.penalty_secs)
        })
    }

    pub fn deprecate(&self, peer: &PeerId) {
        self.upsert(peer, |record| record.deprecated = true);
    }

    /// Peers without a record are always eligible
    pub fn dial_eligible(&self, peer: &PeerId, now_secs: i64) -> bool {
        match self.peers.get(peer).map(|s| Arc::clone(s.value())) {
            Some(slot) => !slot.lock().is_waiting(now_secs),
            None => true,
        }
    }

    /// Store the outcome of a status exchange
    pub fn record_status(&self, peer: &PeerId, status: &Status, latency: Duration) {
        self.upsert(peer, |record| {
            record.fork_digest = Some(status.fork_digest);
            record.head_slot = Some(status.head_slot);
            record.finalized_epoch = Some(status.finalized_epoch);
            record.latency_ms = Some(latency.as_millis().min(u32::MAX as u128) as u32);
        });
    }

    /// Store the outcome of a metadata exchange
    pub fn record_metadata(&self, peer: &PeerId, metadata: Option<&MetaData>) {
        self.upsert(peer, |record| {
            record.metadata_requested = true;
            if let Some(meta) = metadata {
                record.metadata_succeeded = true;
                record.metadata_seq = Some(meta.seq_number);
                record.attnets = Some(meta.attnets);
            }
        });
    }

    /// Store client identification parsed from the user agent
    pub fn record_client(&self, peer: &PeerId, user_agent: &str) {
        let client = crate::p2p::client_type::parse_user_agent(user_agent);
        self.upsert(peer, |record| {
            record.user_agent = Some(user_agent.to_string());
            record.client_name = Some(client.name);
            record.client_version = Some(client.version);
            record.client_os = Some(client.os);
        });
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Copies of every record
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let slots: Vec<_> = self.peers.iter().map(|e| Arc::clone(e.value())).collect();
        let now = Utc::now().timestamp_millis();
        slots
            .into_iter()
            .map(|slot| {
                let mut record = slot.lock();
                record.prune_expired(now);
                record.clone()
            })
            .collect()
    }

    /// Dialable view of every peer with at least one live address
    pub fn addr_infos(&self) -> Vec<AddrInfo> {
        self.snapshot()
            .into_iter()
            .filter(|r| !r.addresses.is_empty())
            .map(|r| {
                let addrs: Vec<Multiaddr> = r.addresses.into_iter().map(|a| a.addr).collect();
                AddrInfo::dialable(r.peer_id, &addrs)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Write every record into a sled tree (session export)
    pub fn persist(&self, tree: &sled::Tree) -> Result<usize> {
        let records = self.snapshot();
        for record in &records {
            let val = serde_json::to_vec(record)?;
            tree.insert(record.peer_id.as_str().as_bytes(), val)?;
        }
        tree.flush()?;
        info!("[PEER STORE] Persisted {} peer records", records.len());
        Ok(records.len())
    }

    /// Load records written by [`persist`](Self::persist). Existing records are
    /// replaced by the stored copy.
    pub fn restore(&self, tree: &sled::Tree) -> Result<usize> {
        let mut restored = 0;
        for item in tree.iter() {
            let (key, val) = item?;
            match serde_json::from_slice::<PeerRecord>(&val) {
                Ok(record) => {
                    self.peers
                        .insert(record.peer_id.clone(), Arc::new(Mutex::new(record)));
                    restored += 1;
                }
                Err(e) => warn!(
                    "[PEER STORE] Skipping unreadable record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        if restored > 0 {
            info!("[PEER STORE] Restored {} peer records", restored);
        }
        Ok(restored)
    }
}
