//! Peer-to-peer side of the crawler
//!
//! Discovery records flow into the [`peer_store::PeerRecordStore`]; the
//! [`connection_manager::ConnectionManager`] keeps dialing what the store
//! and the host know about, and fills in status, metadata and client info
//! for every peer that answers.

pub mod client_type;
pub mod connection_manager;
pub mod dial_tracker;
pub mod discovery;
pub mod geo;
pub mod host;
pub mod peer_store;
pub mod tcp_host;
pub mod test_utils;
pub mod types;

pub use connection_manager::{ConnectionManager, ConnectionManagerHandle, ConnectionSettings};
pub use discovery::{DiscoveryAdapter, DiscoveryOutcome, DiscoverySettings, NodeRecord};
pub use host::NetworkHost;
pub use peer_store::{PeerRecord, PeerRecordStore};
pub use tcp_host::TcpHost;
pub use types::{AddrInfo, ForkDigest, Multiaddr, PeerId};
