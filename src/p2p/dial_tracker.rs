//! Dial failure tracking
//!
//! Keeps the most recent dial failures with their reason and address so an
//! operator can see why peers refuse to connect without trawling the logs.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

use crate::p2p::types::{Multiaddr, PeerId};

/// Maximum number of dial failures to keep in memory
const MAX_DIAL_FAILURES: usize = 100;

/// A single dial failure event
#[derive(Debug, Clone, Serialize)]
pub struct DialFailure {
    pub peer: PeerId,
    pub addr: Option<String>,
    pub reason: String,
    pub timestamp_unix: u64,
    /// 1-based attempt number within the crawl cycle
    pub attempt: u32,
}

#[derive(Default)]
pub struct DialTracker {
    failures: Mutex<VecDeque<DialFailure>>,
}

impl DialTracker {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::with_capacity(MAX_DIAL_FAILURES)),
        }
    }

    pub fn record(&self, peer: &PeerId, addr: Option<&Multiaddr>, reason: &str, attempt: u32) {
        let failure = DialFailure {
            peer: peer.clone(),
            addr: addr.map(|a| a.to_string()),
            reason: reason.to_string(),
            timestamp_unix: chrono::Utc::now().timestamp().max(0) as u64,
            attempt,
        };

        let mut failures = self.failures.lock();
        failures.push_back(failure);
        if failures.len() > MAX_DIAL_FAILURES {
            failures.pop_front();
        }
    }

    /// All recorded failures, most recent first
    pub fn get_failures(&self) -> Vec<DialFailure> {
        self.failures.lock().iter().rev().cloned().collect()
    }

    pub fn get_failures_for_peer(&self, peer: &PeerId) -> Vec<DialFailure> {
        self.failures
            .lock()
            .iter()
            .filter(|f| &f.peer == peer)
            .rev()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.lock().is_empty()
    }
}
