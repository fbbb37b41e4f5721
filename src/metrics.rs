//! Crawler metrics
//!
//! The Prometheus registry is owned by [`CrawlerMetrics`] and handed to each
//! component that counts something. Serving the exposition text is left to
//! an external exporter; [`CrawlerMetrics::encode_text`] renders it.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::p2p::peer_store::PeerRecordStore;

pub struct CrawlerMetrics {
    registry: Registry,
    pub dial_attempts: IntCounter,
    pub dial_successes: IntCounter,
    pub discovered_peers: IntCounter,
    pub filtered_records: IntCounter,
    pub ingested_blocks: IntCounter,
    pub ingested_states: IntCounter,
    pub ingestion_skipped: IntCounter,
    pub rpc_requests: IntCounterVec,
    pub known_peers: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl CrawlerMetrics {
    /// Fresh registry with every crawler metric registered once
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rpc_requests = IntCounterVec::new(
            Opts::new("crawler_rpc_requests_total", "RPC requests by method and outcome"),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(rpc_requests.clone()))?;

        let known_peers = IntGauge::new("crawler_known_peers", "Peers in the record store")?;
        registry.register(Box::new(known_peers.clone()))?;

        Ok(Self {
            dial_attempts: counter(&registry, "crawler_dial_attempts_total", "Dial attempts")?,
            dial_successes: counter(&registry, "crawler_dial_success_total", "Successful dials")?,
            discovered_peers: counter(
                &registry,
                "crawler_discovered_peers_total",
                "Node records that changed the peer store",
            )?,
            filtered_records: counter(
                &registry,
                "crawler_filtered_records_total",
                "Node records rejected by the fork digest filter",
            )?,
            ingested_blocks: counter(&registry, "crawler_ingested_blocks_total", "Blocks committed")?,
            ingested_states: counter(&registry, "crawler_ingested_states_total", "States committed")?,
            ingestion_skipped: counter(
                &registry,
                "crawler_ingestion_skipped_total",
                "Gossip messages skipped by ingestion",
            )?,
            rpc_requests,
            known_peers,
            registry,
        })
    }

    pub fn rpc_outcome(&self, method: &str, outcome: &str) {
        self.rpc_requests.with_label_values(&[method, outcome]).inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerRatio {
    pub peer_id: String,
    pub attempts: u64,
    pub successes: u64,
    pub success_ratio: f64,
}

/// Point-in-time summary of the peer store for exporters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: i64,
    pub total_peers: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub clients: BTreeMap<String, usize>,
    pub countries: BTreeMap<String, usize>,
    pub peers: Vec<PeerRatio>,
}

impl MetricsSnapshot {
    pub fn collect(store: &PeerRecordStore) -> Self {
        let records = store.snapshot();
        let mut clients = BTreeMap::new();
        let mut countries = BTreeMap::new();
        let mut peers = Vec::with_capacity(records.len());

        for r in &records {
            let client = r.client_name.clone().unwrap_or_else(|| "Unknown".to_string());
            *clients.entry(client).or_insert(0) += 1;
            if let Some(geo) = &r.geo {
                *countries.entry(geo.country.clone()).or_insert(0) += 1;
            }
            peers.push(PeerRatio {
                peer_id: r.peer_id.to_string(),
                attempts: r.attempts,
                successes: r.successes,
                success_ratio: r.success_ratio(),
            });
        }
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        Self {
            timestamp: chrono::Utc::now().timestamp(),
            total_peers: records.len(),
            attempted: records.iter().filter(|r| r.attempts > 0).count(),
            succeeded: records.iter().filter(|r| r.successes > 0).count(),
            total_attempts: records.iter().map(|r| r.attempts).sum(),
            total_successes: records.iter().map(|r| r.successes).sum(),
            clients,
            countries,
            peers,
        }
    }
}
