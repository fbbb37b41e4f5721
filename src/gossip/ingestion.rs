//! Gossip Ingestion Pipeline
//!
//! One consumer task per topic waits on the topic's notification queue. Each
//! signal makes it read the latest block from the message log, fetch the
//! matching full state from the companion node and commit both into the
//! current generations. A message that cannot be read, fetched or decoded is
//! logged, counted as skipped and dropped; the loop keeps going.

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrawlerError, Result};
use crate::gossip::block::{BlockHeaderView, StateSnapshot};
use crate::gossip::state_fetcher::StateFetcher;
use crate::gossip::topics::GossipTopics;
use crate::metrics::CrawlerMetrics;
use crate::rpc::server::LocalNode;
use crate::storage::generation::Generations;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionStats {
    /// Signals that got as far as committing
    pub processed: u64,
    pub skipped: u64,
    /// New blocks written (re-reading a message does not count again)
    pub blocks_stored: u64,
    pub states_stored: u64,
    pub last_slot: Option<u64>,
    pub last_error: Option<String>,
}

struct Shared {
    topics: Arc<GossipTopics>,
    generations: Arc<Generations>,
    fetcher: Arc<dyn StateFetcher>,
    local: Arc<LocalNode>,
    metrics: Arc<CrawlerMetrics>,
}

struct Consumer {
    stop: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<Mutex<IngestionStats>>,
}

pub struct IngestionPipeline {
    shared: Arc<Shared>,
    consumers: Mutex<HashMap<String, Consumer>>,
}

impl IngestionPipeline {
    pub fn new(
        topics: Arc<GossipTopics>,
        generations: Arc<Generations>,
        fetcher: Arc<dyn StateFetcher>,
        local: Arc<LocalNode>,
        metrics: Arc<CrawlerMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics,
                generations,
                fetcher,
                local,
                metrics,
            }),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the consumer for `topic`. The topic must already be recorded with
    /// a notification queue, and must not have a consumer yet.
    pub fn start(&self, topic: &str) -> Result<()> {
        let mut consumers = self.consumers.lock();
        if consumers.contains_key(topic) {
            return Err(CrawlerError::AlreadyExists(format!("ingestion for topic {} is running", topic)));
        }
        let receiver = self.shared.topics.take_receiver(topic)?;

        let stop = CancellationToken::new();
        let stats = Arc::new(Mutex::new(IngestionStats::default()));
        let task = tokio::spawn(consume(
            Arc::clone(&self.shared),
            topic.to_string(),
            receiver,
            stop.clone(),
            Arc::clone(&stats),
        ));
        consumers.insert(topic.to_string(), Consumer { stop, task, stats });

        info!(
            topic,
            endpoint = self.shared.fetcher.endpoint(),
            "[INGEST] Gossip import launched"
        );
        Ok(())
    }

    /// Stop the consumer and wait for it to exit
    pub async fn stop(&self, topic: &str) -> Result<IngestionStats> {
        let consumer = self
            .consumers
            .lock()
            .remove(topic)
            .ok_or_else(|| CrawlerError::NotFound(format!("no ingestion running for topic {}", topic)))?;

        consumer.stop.cancel();
        if let Err(e) = consumer.task.await {
            warn!(topic, "[INGEST] Consumer ended abnormally: {}", e);
        }
        let stats = consumer.stats.lock().clone();
        info!(
            topic,
            processed = stats.processed,
            skipped = stats.skipped,
            "[INGEST] Gossip import stopped"
        );
        Ok(stats)
    }

    /// Stop every consumer concurrently
    pub async fn stop_all(&self) -> Vec<(String, IngestionStats)> {
        let topics = self.active_topics();
        let results = join_all(topics.iter().map(|t| self.stop(t))).await;
        topics
            .into_iter()
            .zip(results)
            .filter_map(|(topic, res)| res.ok().map(|stats| (topic, stats)))
            .collect()
    }

    pub fn stats(&self, topic: &str) -> Option<IngestionStats> {
        self.consumers
            .lock()
            .get(topic)
            .map(|c| c.stats.lock().clone())
    }

    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.consumers.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}

async fn consume(
    shared: Arc<Shared>,
    topic: String,
    mut receiver: mpsc::Receiver<()>,
    stop: CancellationToken,
    stats: Arc<Mutex<IngestionStats>>,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            signal = receiver.recv() => signal,
        };
        if signal.is_none() {
            break;
        }

        match process_latest(&shared, &topic).await {
            Ok(committed) => {
                let mut s = stats.lock();
                s.processed += 1;
                s.last_slot = Some(committed.slot);
                s.blocks_stored += committed.block_new as u64;
                s.states_stored += committed.state_new as u64;
                if let Some(e) = committed.error {
                    s.last_error = Some(e);
                }
            }
            Err(e) => {
                shared.metrics.ingestion_skipped.inc();
                warn!(topic = %topic, reason = e.kind(), "[INGEST] Skipping gossip message: {}", e);
                let mut s = stats.lock();
                s.skipped += 1;
                s.last_error = Some(e.to_string());
            }
        }
    }

    shared.topics.return_receiver(&topic, receiver);
    debug!(topic = %topic, "[INGEST] Consumer exited");
}

struct Committed {
    slot: u64,
    block_new: bool,
    state_new: bool,
    /// A commit that failed after the other succeeded
    error: Option<String>,
}

async fn process_latest(shared: &Shared, topic: &str) -> Result<Committed> {
    let message = shared.topics.read_latest(topic)?;
    let header = BlockHeaderView::from_ssz(&message.data)?;
    debug!(
        topic,
        seq = message.seq,
        slot = header.slot,
        state_root = %hex::encode(header.state_root),
        "[INGEST] New beacon block"
    );

    let raw = shared.fetcher.fetch(header.slot).await?;
    let state = StateSnapshot::decode(raw)?;
    if state.slot != header.slot {
        debug!(
            block_slot = header.slot,
            state_slot = state.slot,
            "[INGEST] Companion node returned a state for another slot"
        );
    }

    // Current generations are read once, here, for this message only
    let states_db = shared.generations.states.current()?;
    let blocks_db = shared.generations.blocks.current()?;

    let mut error = None;
    let state_new = match states_db.store(&header.state_root, header.slot, &state.raw) {
        Ok(new) => {
            if new {
                shared.metrics.ingested_states.inc();
            }
            new
        }
        Err(e) => {
            warn!(slot = header.slot, db = states_db.name(), "[INGEST] State commit failed: {}", e);
            error = Some(e.to_string());
            false
        }
    };
    let block_new = match blocks_db.store(&header.block_key, header.slot, &message.data) {
        Ok(new) => {
            if new {
                shared.metrics.ingested_blocks.inc();
            }
            new
        }
        Err(e) => {
            warn!(slot = header.slot, db = blocks_db.name(), "[INGEST] Block commit failed: {}", e);
            error = Some(e.to_string());
            false
        }
    };

    shared.local.update_head(
        header.slot,
        header.block_key,
        state.finalized_epoch,
        state.finalized_root,
    );

    info!(
        slot = header.slot,
        blocks_db = blocks_db.name(),
        states_db = states_db.name(),
        "[INGEST] Block and state imported"
    );

    Ok(Committed {
        slot: header.slot,
        block_new,
        state_new,
        error,
    })
}
