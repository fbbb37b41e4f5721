//! Crawler - owns every component and exposes the operator commands
//!
//! Nothing here is global: a process builds one [`Crawler`] from its config
//! and a network host, and tests build as many as they like.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CrawlerConfig;
use crate::error::{CrawlerError, Result};
use crate::gossip::topics::{self, GossipTopics};
use crate::gossip::{IngestionPipeline, IngestionStats, StateFetcher};
use crate::metrics::{CrawlerMetrics, MetricsSnapshot};
use crate::p2p::connection_manager::{ConnectionManager, ConnectionManagerHandle, ConnectionManagerStats};
use crate::p2p::dial_tracker::DialTracker;
use crate::p2p::discovery::{DiscoveryAdapter, DiscoveryOutcome, NodeRecord};
use crate::p2p::geo::GeoLocator;
use crate::p2p::host::NetworkHost;
use crate::p2p::peer_store::{PeerRecord, PeerRecordStore};
use crate::p2p::types::PeerId;
use crate::rpc::server::LocalNode;
use crate::storage::generation::GenerationInfo;
use crate::storage::{Generations, StoreKind};

const PEER_TREE: &str = "peers";

pub struct Crawler {
    config: CrawlerConfig,
    host: Arc<dyn NetworkHost>,
    store: Arc<PeerRecordStore>,
    metrics: Arc<CrawlerMetrics>,
    tracker: Arc<DialTracker>,
    topics: Arc<GossipTopics>,
    generations: Arc<Generations>,
    local: Arc<LocalNode>,
    discovery: DiscoveryAdapter,
    ingestion: IngestionPipeline,
    conn_mgr: Mutex<Option<ConnectionManagerHandle>>,
    peer_db: Option<sled::Tree>,
}

impl Crawler {
    pub fn new(
        config: CrawlerConfig,
        host: Arc<dyn NetworkHost>,
        fetcher: Arc<dyn StateFetcher>,
        locator: Arc<dyn GeoLocator>,
    ) -> Result<Self> {
        config.validate().map_err(CrawlerError::Config)?;
        let digest = config.local_fork_digest().map_err(CrawlerError::Config)?;

        let store = Arc::new(PeerRecordStore::new());
        let metrics = Arc::new(CrawlerMetrics::new()?);
        let tracker = Arc::new(DialTracker::new());
        let topics = Arc::new(GossipTopics::new());
        let generations = Arc::new(Generations::new());
        let local = Arc::new(LocalNode::new(digest));

        let ing = &config.ingestion;
        generations
            .blocks
            .create(&ing.blocks_db.name, &ing.blocks_db.path, &ing.blocks_db.spec)?;
        generations
            .states
            .create(&ing.states_db.name, &ing.states_db.path, &ing.states_db.spec)?;

        for topic in &ing.topics {
            let notify = topics::topic_kind(topic) == topics::BEACON_BLOCK;
            topics.record(topic, notify)?;
        }

        let peer_db = if config.storage.peer_db_path.is_empty() {
            None
        } else {
            let db = sled::open(&config.storage.peer_db_path)?;
            let tree = db.open_tree(PEER_TREE)?;
            store.restore(&tree)?;
            Some(tree)
        };

        let discovery = DiscoveryAdapter::new(
            Arc::clone(&store),
            locator,
            Arc::clone(&metrics),
            config.discovery_settings(),
        );
        let ingestion = IngestionPipeline::new(
            Arc::clone(&topics),
            Arc::clone(&generations),
            fetcher,
            Arc::clone(&local),
            Arc::clone(&metrics),
        );

        info!(
            peer = %host.local_peer_id(),
            fork_digest = %digest,
            topics = ing.topics.len(),
            "[CRAWLER] Initialized"
        );

        Ok(Self {
            config,
            host,
            store,
            metrics,
            tracker,
            topics,
            generations,
            local,
            discovery,
            ingestion,
            conn_mgr: Mutex::new(None),
            peer_db,
        })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PeerRecordStore> {
        &self.store
    }

    pub fn topics(&self) -> &Arc<GossipTopics> {
        &self.topics
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn metrics(&self) -> &Arc<CrawlerMetrics> {
        &self.metrics
    }

    pub fn dial_tracker(&self) -> &Arc<DialTracker> {
        &self.tracker
    }

    pub fn generations(&self) -> &Arc<Generations> {
        &self.generations
    }

    // ---- generations ----

    pub fn create_generation(&self, kind: StoreKind, name: &str, path: &str, spec: &str) -> Result<GenerationInfo> {
        let generation = self.generations.registry(kind).create(name, path, spec)?;
        Ok(generation.info().clone())
    }

    pub fn switch_generation(&self, kind: StoreKind, name: &str) -> Result<()> {
        self.generations.registry(kind).switch_current(name)
    }

    pub fn remove_generation(&self, kind: StoreKind, name: &str) -> Result<()> {
        self.generations.registry(kind).remove(name)
    }

    pub fn list_generations(&self, kind: StoreKind) -> Vec<String> {
        self.generations.registry(kind).list()
    }

    pub fn current_generation(&self, kind: StoreKind) -> Option<String> {
        self.generations.registry(kind).current_name()
    }

    // ---- connection manager ----

    pub fn start_connection_manager(&self) -> Result<()> {
        let mut slot = self.conn_mgr.lock();
        if slot.is_some() {
            return Err(CrawlerError::AlreadyExists("connection manager is running".to_string()));
        }
        let manager = ConnectionManager::new(
            Arc::clone(&self.host),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            Arc::clone(&self.tracker),
            Arc::clone(&self.local),
            self.config.connection_settings(),
        );
        *slot = Some(manager.start());
        Ok(())
    }

    pub async fn stop_connection_manager(&self) -> Result<ConnectionManagerStats> {
        let handle = self
            .conn_mgr
            .lock()
            .take()
            .ok_or_else(|| CrawlerError::InvalidState("connection manager is not running".to_string()))?;
        let stats = handle.stats();
        handle.shutdown().await;
        Ok(stats)
    }

    pub fn connection_stats(&self) -> Option<ConnectionManagerStats> {
        self.conn_mgr.lock().as_ref().map(|h| h.stats())
    }

    // ---- ingestion ----

    pub fn start_ingestion(&self, topic: &str) -> Result<()> {
        self.ingestion.start(topic)
    }

    pub async fn stop_ingestion(&self, topic: &str) -> Result<IngestionStats> {
        self.ingestion.stop(topic).await
    }

    pub fn ingestion_stats(&self, topic: &str) -> Option<IngestionStats> {
        self.ingestion.stats(topic)
    }

    // ---- peers & discovery ----

    pub fn peer(&self, peer: &PeerId) -> Result<PeerRecord> {
        self.store
            .get(peer)
            .ok_or_else(|| CrawlerError::NotFound(format!("peer {}", peer)))
    }

    pub async fn handle_node_record(&self, record: &NodeRecord) -> Result<DiscoveryOutcome> {
        let outcome = self.discovery.handle(record).await?;
        self.metrics.known_peers.set(self.store.len() as i64);
        Ok(outcome)
    }

    /// Feed the configured bootstrap nodes through discovery. Bad records are
    /// logged and skipped.
    pub async fn bootstrap(&self) -> usize {
        let mut updated = 0;
        for node in &self.config.discovery.bootstrap_nodes {
            let result = match node.to_node_record() {
                Ok(record) => self.handle_node_record(&record).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(DiscoveryOutcome::Updated(_)) => updated += 1,
                Ok(outcome) => {
                    if let Err(e) = outcome.into_result() {
                        warn!(ip = %node.ip, kind = e.kind(), "[DISCOVERY] Bootstrap node not added: {}", e);
                    }
                }
                Err(e) => warn!(ip = %node.ip, "[DISCOVERY] Bootstrap node skipped: {}", e),
            }
        }
        info!("[DISCOVERY] Bootstrap added {} peers", updated);
        updated
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.known_peers.set(self.store.len() as i64);
        MetricsSnapshot::collect(&self.store)
    }

    /// Persist the peer records to the session database, if configured
    pub fn persist_session(&self) -> Result<usize> {
        match &self.peer_db {
            Some(tree) => self.store.persist(tree),
            None => Ok(0),
        }
    }

    /// Stop the connection manager and all ingestion loops, then flush storage
    pub async fn shutdown(&self) -> Result<()> {
        info!("[CRAWLER] Shutting down");
        if let Err(e) = self.stop_connection_manager().await {
            if !matches!(e, CrawlerError::InvalidState(_)) {
                return Err(e);
            }
        }
        self.ingestion.stop_all().await;
        self.generations.blocks.flush_all();
        self.generations.states.flush_all();
        self.persist_session()?;
        info!("[CRAWLER] Shutdown complete");
        Ok(())
    }
}
