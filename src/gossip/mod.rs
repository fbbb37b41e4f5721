//! Gossip message logs and the block/state ingestion built on them

pub mod block;
pub mod ingestion;
pub mod state_fetcher;
pub mod topics;

pub use ingestion::{IngestionPipeline, IngestionStats};
pub use state_fetcher::{HttpStateFetcher, StateFetcher};
pub use topics::{GossipMessage, GossipTopics, MessageLog};
