//! Beacon-chain network crawler
//!
//! Learns peers from discovery records, keeps dialing them to measure
//! reachability and client mix, and ingests gossiped blocks together with
//! the matching states fetched from a companion beacon node.

pub mod config;
pub mod crawler;
pub mod error;
pub mod gossip;
pub mod metrics;
pub mod p2p;
pub mod rpc;
pub mod storage;

pub use config::CrawlerConfig;
pub use crawler::Crawler;
pub use error::{CrawlerError, Result};
