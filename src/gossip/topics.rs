//! Per-topic message logs and notification queues
//!
//! Received gossip is appended to the topic's [`MessageLog`]; the notification
//! queue only carries a wake-up signal. Consumers read the latest message from
//! the log themselves, so any number of readers can look at the same message
//! without taking it away from anyone.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{CrawlerError, Result};
use crate::p2p::types::{ForkDigest, PeerId};

/// Pending signals per topic; further signals are coalesced
pub const NOTIFICATION_QUEUE_SIZE: usize = 64;

/// Messages retained per topic log
pub const DEFAULT_LOG_RETENTION: usize = 1024;

pub const BEACON_BLOCK: &str = "beacon_block";
pub const SSZ_SNAPPY: &str = "ssz_snappy";

/// Full gossip topic name, `/eth2/{digest}/{name}/{encoding}`
pub fn eth2_topic(digest: &ForkDigest, name: &str) -> String {
    format!("/eth2/{}/{}/{}", hex::encode(digest.0), name, SSZ_SNAPPY)
}

/// The `{name}` segment of a full topic, or the input if it is not an eth2 topic
pub fn topic_kind(topic: &str) -> &str {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["", "eth2", _digest, name, _encoding] => *name,
        _ => topic,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GossipMessage {
    /// Position in the topic log, starting at 1
    pub seq: u64,
    pub topic: String,
    pub from: PeerId,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub received_at: i64,
}

/// Append-only log with bounded retention
pub struct MessageLog {
    topic: String,
    retention: usize,
    inner: RwLock<LogInner>,
}

struct LogInner {
    messages: VecDeque<Arc<GossipMessage>>,
    appended: u64,
}

impl MessageLog {
    pub fn new(topic: &str, retention: usize) -> Self {
        Self {
            topic: topic.to_string(),
            retention: retention.max(1),
            inner: RwLock::new(LogInner {
                messages: VecDeque::new(),
                appended: 0,
            }),
        }
    }

    pub fn append(&self, from: PeerId, data: Vec<u8>) -> Arc<GossipMessage> {
        let mut inner = self.inner.write();
        inner.appended += 1;
        let message = Arc::new(GossipMessage {
            seq: inner.appended,
            topic: self.topic.clone(),
            from,
            data,
            received_at: Utc::now().timestamp_millis(),
        });
        inner.messages.push_back(Arc::clone(&message));
        if inner.messages.len() > self.retention {
            inner.messages.pop_front();
        }
        message
    }

    pub fn latest(&self) -> Option<Arc<GossipMessage>> {
        self.inner.read().messages.back().cloned()
    }

    /// Total messages ever appended
    pub fn appended(&self) -> u64 {
        self.inner.read().appended
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }
}

struct TopicEntry {
    log: Arc<MessageLog>,
    notify: Option<mpsc::Sender<()>>,
    /// Held here until the single consumer takes it
    receiver: Mutex<Option<mpsc::Receiver<()>>>,
}

/// Every recorded topic of the crawler
pub struct GossipTopics {
    topics: DashMap<String, Arc<TopicEntry>>,
    retention: usize,
}

impl GossipTopics {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_LOG_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            topics: DashMap::new(),
            retention,
        }
    }

    /// Start recording `topic`. With `notify` the topic also gets a
    /// notification queue that one consumer can take.
    pub fn record(&self, topic: &str, notify: bool) -> Result<()> {
        if self.topics.contains_key(topic) {
            return Err(CrawlerError::AlreadyExists(format!("topic {} is already recorded", topic)));
        }
        let (tx, rx) = if notify {
            let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_SIZE);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let entry = Arc::new(TopicEntry {
            log: Arc::new(MessageLog::new(topic, self.retention)),
            notify: tx,
            receiver: Mutex::new(rx),
        });
        match self.topics.entry(topic.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CrawlerError::AlreadyExists(format!("topic {} is already recorded", topic)))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                info!(topic, notify, "[GOSSIP] Recording topic");
                Ok(())
            }
        }
    }

    fn entry(&self, topic: &str) -> Result<Arc<TopicEntry>> {
        self.topics
            .get(topic)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CrawlerError::NotFound(format!("topic {}", topic)))
    }

    /// Append a received message and signal the consumer
    pub fn deliver(&self, topic: &str, from: PeerId, data: Vec<u8>) -> Result<u64> {
        let entry = self.entry(topic)?;
        let message = entry.log.append(from, data);
        if let Some(tx) = &entry.notify {
            // A full queue already guarantees a wake-up
            if tx.try_send(()).is_err() {
                debug!(topic, seq = message.seq, "[GOSSIP] Notification coalesced");
            }
        }
        Ok(message.seq)
    }

    /// Signal the consumer again without appending, so it re-reads the
    /// latest message
    pub fn notify(&self, topic: &str) -> Result<()> {
        let entry = self.entry(topic)?;
        match &entry.notify {
            Some(tx) => {
                let _ = tx.try_send(());
                Ok(())
            }
            None => Err(CrawlerError::InvalidState(format!(
                "topic {} has no notification queue",
                topic
            ))),
        }
    }

    pub fn read_latest(&self, topic: &str) -> Result<Arc<GossipMessage>> {
        self.entry(topic)?
            .log
            .latest()
            .ok_or_else(|| CrawlerError::NotFound(format!("no message on topic {}", topic)))
    }

    pub fn log(&self, topic: &str) -> Result<Arc<MessageLog>> {
        Ok(Arc::clone(&self.entry(topic)?.log))
    }

    pub fn has_queue(&self, topic: &str) -> bool {
        self.entry(topic).map_or(false, |e| e.notify.is_some())
    }

    /// Hand the notification queue to the single consumer of `topic`
    pub fn take_receiver(&self, topic: &str) -> Result<mpsc::Receiver<()>> {
        let entry = self.entry(topic)?;
        if entry.notify.is_none() {
            return Err(CrawlerError::InvalidState(format!(
                "topic {} has no notification queue",
                topic
            )));
        }
        let taken = entry.receiver.lock().take();
        taken.ok_or_else(|| CrawlerError::AlreadyExists(format!("topic {} already has a consumer", topic)))
    }

    /// Give the queue back after the consumer exits
    pub fn return_receiver(&self, topic: &str, receiver: mpsc::Receiver<()>) {
        if let Ok(entry) = self.entry(topic) {
            *entry.receiver.lock() = Some(receiver);
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for GossipTopics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key(b"gossiper")
    }

    #[test]
    fn test_topic_names() {
        let topic = eth2_topic(&ForkDigest([0xb5, 0x30, 0x3f, 0x2a]), BEACON_BLOCK);
        assert_eq!(topic, "/eth2/b5303f2a/beacon_block/ssz_snappy");
        assert_eq!(topic_kind(&topic), BEACON_BLOCK);
        assert_eq!(topic_kind("custom"), "custom");
    }

    #[test]
    fn test_read_latest_does_not_consume() {
        let topics = GossipTopics::new();
        topics.record("t", true).unwrap();
        topics.deliver("t", peer(), vec![1]).unwrap();
        topics.deliver("t", peer(), vec![2]).unwrap();

        assert_eq!(topics.read_latest("t").unwrap().data, vec![2]);
        assert_eq!(topics.read_latest("t").unwrap().seq, 2);
    }

    #[test]
    fn test_single_consumer() {
        let topics = GossipTopics::new();
        topics.record("t", true).unwrap();
        let rx = topics.take_receiver("t").unwrap();
        assert!(matches!(topics.take_receiver("t"), Err(CrawlerError::AlreadyExists(_))));

        topics.return_receiver("t", rx);
        assert!(topics.take_receiver("t").is_ok());
    }

    #[test]
    fn test_queue_preconditions() {
        let topics = GossipTopics::new();
        topics.record("quiet", false).unwrap();
        assert!(matches!(topics.take_receiver("quiet"), Err(CrawlerError::InvalidState(_))));
        assert!(matches!(topics.take_receiver("missing"), Err(CrawlerError::NotFound(_))));
        assert!(matches!(topics.record("quiet", true), Err(CrawlerError::AlreadyExists(_))));
    }

    #[test]
    fn test_full_queue_coalesces() {
        let topics = GossipTopics::new();
        topics.record("t", true).unwrap();
        for i in 0..(NOTIFICATION_QUEUE_SIZE + 10) {
            topics.deliver("t", peer(), vec![i as u8]).unwrap();
        }
        let mut rx = topics.take_receiver("t").unwrap();
        let mut signals = 0;
        while rx.try_recv().is_ok() {
            signals += 1;
        }
        assert_eq!(signals, NOTIFICATION_QUEUE_SIZE);
        assert_eq!(topics.log("t").unwrap().appended(), (NOTIFICATION_QUEUE_SIZE + 10) as u64);
    }

    #[test]
    fn test_log_retention() {
        let log = MessageLog::new("t", 3);
        for i in 0..5u8 {
            log.append(peer(), vec![i]);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.latest().unwrap().seq, 5);
    }
}
