//! Crawler configuration
//!
//! Loaded from a TOML file, then overridden by `CRAWLER_*` environment
//! variables. Every field has a default so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{CrawlerError, Result};
use crate::p2p::connection_manager::ConnectionSettings;
use crate::p2p::discovery::{DiscoverySettings, Eth2Data, NodeRecord};
use crate::p2p::types::ForkDigest;

/// Mainnet (Capella) fork digest
pub const DEFAULT_FORK_DIGEST: &str = "0xbba4da96";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub network: NetworkSection,
    pub connection: ConnectionSection,
    pub discovery: DiscoverySection,
    pub ingestion: IngestionSection,
    pub geoip: GeoIpSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub listen_addr: String,
    /// Digest advertised in our own status
    pub local_fork_digest: String,
    pub agent_version: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            local_fork_digest: DEFAULT_FORK_DIGEST.to_string(),
            agent_version: format!("beacon-crawler/v{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub max_retries: u32,
    pub dial_timeout_secs: u64,
    pub rescan_interval_secs: u64,
    pub max_concurrent_dials: usize,
    pub request_status: bool,
    pub rpc_timeout_secs: u64,
    /// Pause before the second attempt; grows linearly with each retry
    pub retry_backoff_ms: u64,
    /// Added to a peer's wait window each time it times out every retry
    pub failure_penalty_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dial_timeout_secs: 15,
            rescan_interval_secs: 600,
            max_concurrent_dials: 8,
            request_status: true,
            rpc_timeout_secs: 7,
            retry_backoff_ms: 1000,
            failure_penalty_secs: 3600,
        }
    }
}

/// Static node record used to seed discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapNode {
    /// Hex-encoded public key
    pub public_key: String,
    pub ip: IpAddr,
    pub tcp_port: u16,
    #[serde(default)]
    pub udp_port: Option<u16>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub fork_digest: Option<ForkDigest>,
}

impl BootstrapNode {
    pub fn to_node_record(&self) -> Result<NodeRecord> {
        let public_key = hex::decode(self.public_key.trim_start_matches("0x"))
            .map_err(|e| CrawlerError::Config(format!("bootstrap public key {}: {}", self.public_key, e)))?;
        Ok(NodeRecord {
            seq: self.seq,
            public_key,
            ip: Some(self.ip),
            tcp_port: Some(self.tcp_port),
            udp_port: self.udp_port,
            eth2: self.fork_digest.map(|fork_digest| Eth2Data {
                fork_digest,
                next_fork_version: [0; 4],
                next_fork_epoch: u64::MAX,
            }),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub add: bool,
    /// Presence enables filtering
    pub filter_digest: Option<String>,
    pub address_ttl_secs: u64,
    pub bootstrap_nodes: Vec<BootstrapNode>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            add: true,
            filter_digest: None,
            address_ttl_secs: 3600,
            bootstrap_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub name: String,
    /// Empty keeps the generation in memory
    pub path: String,
    pub spec: String,
}

impl GenerationSection {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: String::new(),
            spec: "mainnet".to_string(),
        }
    }
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self::named("default")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSection {
    pub state_endpoint: String,
    pub fetch_timeout_secs: u64,
    /// Topics recorded at startup; names ending in `beacon_block` get a queue
    pub topics: Vec<String>,
    pub blocks_db: GenerationSection,
    pub states_db: GenerationSection,
}

impl Default for IngestionSection {
    fn default() -> Self {
        Self {
            state_endpoint: "http://localhost:3500/eth/v1/debug/beacon/states/".to_string(),
            fetch_timeout_secs: 30,
            topics: Vec::new(),
            blocks_db: GenerationSection::named("blocks"),
            states_db: GenerationSection::named("states"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpSection {
    /// MaxMind GeoLite2-City database
    pub db_path: Option<String>,
    pub use_ip_api: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Session persistence for peer records; empty disables it
    pub peer_db_path: String,
}

impl CrawlerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CrawlerError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CrawlerError::Config(format!("failed to parse config: {}", e)))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CRAWLER_LISTEN_ADDR") {
            self.network.listen_addr = val.trim().to_string();
        }

        if let Ok(val) = env::var("CRAWLER_FORK_DIGEST") {
            self.network.local_fork_digest = val.trim().to_string();
        }

        if let Ok(val) = env::var("CRAWLER_STATE_ENDPOINT") {
            self.ingestion.state_endpoint = val.trim().to_string();
        }

        if let Ok(val) = env::var("CRAWLER_GEOIP_DB") {
            let val = val.trim();
            self.geoip.db_path = (!val.is_empty()).then(|| val.to_string());
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.listen_addr()?;
        self.local_fork_digest()?;
        self.filter_digest()?;

        let c = &self.connection;
        if c.max_retries == 0 {
            return Err("connection.max_retries must be at least 1".to_string());
        }
        if c.dial_timeout_secs == 0 || c.rpc_timeout_secs == 0 {
            return Err("connection timeouts must be greater than zero".to_string());
        }
        if c.rescan_interval_secs == 0 {
            return Err("connection.rescan_interval_secs must be greater than zero".to_string());
        }
        if c.max_concurrent_dials == 0 {
            return Err("connection.max_concurrent_dials must be at least 1".to_string());
        }

        if self.ingestion.fetch_timeout_secs == 0 {
            return Err("ingestion.fetch_timeout_secs must be greater than zero".to_string());
        }
        if self.ingestion.blocks_db.name.is_empty() || self.ingestion.states_db.name.is_empty() {
            return Err("ingestion generation names cannot be empty".to_string());
        }

        for node in &self.discovery.bootstrap_nodes {
            node.to_node_record().map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, String> {
        self.network
            .listen_addr
            .parse()
            .map_err(|e| format!("invalid listen_addr {}: {}", self.network.listen_addr, e))
    }

    pub fn local_fork_digest(&self) -> std::result::Result<ForkDigest, String> {
        self.network
            .local_fork_digest
            .parse()
            .map_err(|e: CrawlerError| e.to_string())
    }

    pub fn filter_digest(&self) -> std::result::Result<Option<ForkDigest>, String> {
        self.discovery
            .filter_digest
            .as_deref()
            .map(|d| d.parse().map_err(|e: CrawlerError| e.to_string()))
            .transpose()
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let c = &self.connection;
        ConnectionSettings {
            max_retries: c.max_retries,
            dial_timeout: Duration::from_secs(c.dial_timeout_secs),
            rescan_interval: Duration::from_secs(c.rescan_interval_secs),
            max_concurrent_dials: c.max_concurrent_dials,
            request_status: c.request_status,
            rpc_timeout: Duration::from_secs(c.rpc_timeout_secs),
            retry_backoff: Duration::from_millis(c.retry_backoff_ms),
            failure_penalty: Duration::from_secs(c.failure_penalty_secs),
        }
    }

    /// Invalid filter digests are rejected by `validate`; here they disable filtering
    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            add: self.discovery.add,
            filter_digest: self.filter_digest().ok().flatten(),
            address_ttl: Duration::from_secs(self.discovery.address_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = CrawlerConfig::from_toml("").unwrap();
        assert!(config.validate().is_ok());

        let settings = config.connection_settings();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.dial_timeout, Duration::from_secs(15));
        assert_eq!(settings.rescan_interval, Duration::from_secs(600));
        assert!(settings.request_status);
        assert_eq!(settings.retry_backoff, Duration::from_secs(1));
        assert_eq!(settings.failure_penalty, Duration::from_secs(3600));
        assert!(config.discovery_settings().filter_digest.is_none());
        assert_eq!(
            config.ingestion.state_endpoint,
            "http://localhost:3500/eth/v1/debug/beacon/states/"
        );
    }

    #[test]
    fn test_partial_sections() {
        let config = CrawlerConfig::from_toml(
            r#"
            [connection]
            max_retries = 5

            [discovery]
            filter_digest = "0xb5303f2a"

            [[discovery.bootstrap_nodes]]
            public_key = "02aabbcc"
            ip = "10.1.2.3"
            tcp_port = 9000
            fork_digest = "0xb5303f2a"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.max_retries, 5);
        assert_eq!(config.connection.max_concurrent_dials, 8);
        assert_eq!(
            config.discovery_settings().filter_digest,
            Some(ForkDigest([0xb5, 0x30, 0x3f, 0x2a]))
        );

        let record = config.discovery.bootstrap_nodes[0].to_node_record().unwrap();
        assert_eq!(record.public_key, vec![0x02, 0xaa, 0xbb, 0xcc]);
        assert_eq!(record.tcp_port, Some(9000));
        assert_eq!(record.eth2.unwrap().fork_digest, ForkDigest([0xb5, 0x30, 0x3f, 0x2a]));
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = CrawlerConfig::default();
        config.connection.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_digest() {
        let mut config = CrawlerConfig::default();
        config.discovery.filter_digest = Some("0xb530".to_string());
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.network.local_fork_digest = "nothex".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let mut config = CrawlerConfig::default();
        config.network.listen_addr = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(
            CrawlerConfig::from_toml("[connection\nmax_retries = 1"),
            Err(CrawlerError::Config(_))
        ));
    }
}
