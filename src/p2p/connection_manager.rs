//! Connection Manager - randomized crawl over every known peer
//!
//! Each cycle snapshots the known peers once, then picks untried peers at
//! random and dials each of them up to `max_retries` times. A cycle ends when
//! the rescan interval elapses; in-flight dial loops are asked to stop after
//! their current attempt and the next cycle starts from a fresh snapshot.
//!
//! Retries of one peer are spaced by a growing backoff. A peer that times out
//! on every retry earns a penalty window and is left out of snapshots until
//! it elapses; a peer whose failure says it can never be reached is deprecated.
//! The crawler's own peer id is never part of a snapshot.
//!
//! Peers that answer are enriched with their client identity and a status
//! exchange. Nothing in here is fatal: failures are counted and the loop moves
//! on until the handle is shut down.

use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::CrawlerError;
use crate::metrics::CrawlerMetrics;
use crate::p2p::dial_tracker::DialTracker;
use crate::p2p::host::NetworkHost;
use crate::p2p::peer_store::PeerRecordStore;
use crate::p2p::types::{AddrInfo, PeerId};
use crate::rpc::methods;
use crate::rpc::server::LocalNode;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Dial attempts per peer per cycle
    pub max_retries: u32,
    pub dial_timeout: Duration,
    pub rescan_interval: Duration,
    pub max_concurrent_dials: usize,
    /// Run the status and metadata exchange after a successful dial
    pub request_status: bool,
    pub rpc_timeout: Duration,
    /// Delay before retry `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
    pub failure_penalty: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dial_timeout: Duration::from_secs(15),
            rescan_interval: Duration::from_secs(600),
            max_concurrent_dials: 8,
            request_status: true,
            rpc_timeout: Duration::from_secs(7),
            retry_backoff: Duration::from_secs(1),
            failure_penalty: Duration::from_secs(3600),
        }
    }
}

/// Running totals since the manager was created
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionManagerStats {
    pub cycles: u64,
    pub selected: u64,
    pub attempts: u64,
    pub successes: u64,
    /// Peers abandoned for the cycle after using up every retry
    pub exhausted: u64,
    /// Peers left out of a snapshot because they were waiting or deprecated
    pub deferred: u64,
    pub deprecated: u64,
}

/// What a failed dial says about the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialFailure {
    /// Worth retrying next cycle
    Transient,
    /// Retry only after the penalty window
    Penalized,
    /// Unreachable or not the peer we expected
    Deprecated,
}

impl DialFailure {
    pub fn classify(err: &CrawlerError) -> Self {
        match err {
            CrawlerError::Timeout(_) => DialFailure::Penalized,
            // peer id mismatch, dial to self, foreign stream header
            CrawlerError::Protocol(_) => DialFailure::Deprecated,
            CrawlerError::Io(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("no route to host") || msg.contains("network is unreachable") {
                    DialFailure::Deprecated
                } else {
                    match err.kind() {
                        "connection_refused" | "connection_reset" | "unexpected_eof" => DialFailure::Transient,
                        _ => DialFailure::Penalized,
                    }
                }
            }
            _ => DialFailure::Penalized,
        }
    }
}

/// Uniform random selection over one cycle's snapshot, never returning the
/// same peer twice
pub struct CycleSelector {
    snapshot: Vec<AddrInfo>,
    tried: HashSet<PeerId>,
}

impl CycleSelector {
    pub fn new(snapshot: Vec<AddrInfo>) -> Self {
        Self {
            snapshot,
            tried: HashSet::new(),
        }
    }

    /// Next untried peer, or `None` once every peer of the snapshot was tried
    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<AddrInfo> {
        if self.tried.len() >= self.snapshot.len() {
            return None;
        }
        let candidates: Vec<&AddrInfo> = self
            .snapshot
            .iter()
            .filter(|info| !self.tried.contains(&info.id))
            .collect();
        let picked = (*candidates.choose(rng)?).clone();
        self.tried.insert(picked.id.clone());
        Some(picked)
    }

    pub fn tried(&self) -> usize {
        self.tried.len()
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }
}

struct Shared {
    host: Arc<dyn NetworkHost>,
    store: Arc<PeerRecordStore>,
    metrics: Arc<CrawlerMetrics>,
    tracker: Arc<DialTracker>,
    local: Arc<LocalNode>,
    settings: ConnectionSettings,
    stats: Mutex<ConnectionManagerStats>,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        host: Arc<dyn NetworkHost>,
        store: Arc<PeerRecordStore>,
        metrics: Arc<CrawlerMetrics>,
        tracker: Arc<DialTracker>,
        local: Arc<LocalNode>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                host,
                store,
                metrics,
                tracker,
                local,
                settings,
                stats: Mutex::new(ConnectionManagerStats::default()),
            }),
        }
    }

    /// Spawn the crawl loop
    pub fn start(&self) -> ConnectionManagerHandle {
        let cancel = CancellationToken::new();
        let dials = TaskTracker::new();
        let task = tokio::spawn(run(
            Arc::clone(&self.shared),
            cancel.clone(),
            dials.clone(),
        ));
        info!(
            max_retries = self.shared.settings.max_retries,
            rescan_secs = self.shared.settings.rescan_interval.as_secs(),
            "[CONN_MGR] Connection manager started"
        );
        ConnectionManagerHandle {
            cancel,
            dials,
            task,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> ConnectionManagerStats {
        self.shared.stats.lock().clone()
    }
}

pub struct ConnectionManagerHandle {
    cancel: CancellationToken,
    dials: TaskTracker,
    task: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl ConnectionManagerHandle {
    pub fn stats(&self) -> ConnectionManagerStats {
        self.shared.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop starting new dials and wait until every in-flight dial loop has
    /// returned
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("[CONN_MGR] Crawl loop ended abnormally: {}", e);
        }
        self.dials.close();
        self.dials.wait().await;
        info!("[CONN_MGR] Connection manager stopped");
    }
}

enum Wake {
    Cancelled,
    CycleElapsed,
    Slot(OwnedSemaphorePermit),
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken, dials: TaskTracker) {
    let slots = Arc::new(Semaphore::new(shared.settings.max_concurrent_dials.max(1)));

    while !cancel.is_cancelled() {
        let cycle = cancel.child_token();
        let mut selector = CycleSelector::new(shared.snapshot());
        let cycle_no = {
            let mut stats = shared.stats.lock();
            stats.cycles += 1;
            stats.cycles
        };
        shared.metrics.known_peers.set(shared.store.len() as i64);
        info!(
            cycle = cycle_no,
            peers = selector.snapshot_len(),
            "[CONN_MGR] Starting crawl cycle"
        );

        let deadline = tokio::time::sleep(shared.settings.rescan_interval);
        tokio::pin!(deadline);

        loop {
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = &mut deadline => Wake::CycleElapsed,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(p) => Wake::Slot(p),
                    Err(_) => Wake::Cancelled,
                },
            };

            let permit = match wake {
                Wake::Cancelled => {
                    cycle.cancel();
                    return;
                }
                Wake::CycleElapsed => {
                    cycle.cancel();
                    break;
                }
                Wake::Slot(permit) => permit,
            };

            let next = selector.next(&mut rand::thread_rng());
            let info = match next {
                Some(info) => info,
                None => {
                    drop(permit);
                    debug!(
                        cycle = cycle_no,
                        tried = selector.tried(),
                        "[CONN_MGR] Every peer of the cycle was tried, waiting for rescan"
                    );
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = &mut deadline => false,
                    };
                    cycle.cancel();
                    if cancelled {
                        return;
                    }
                    break;
                }
            };

            shared.stats.lock().selected += 1;
            dials.spawn(dial_peer(Arc::clone(&shared), info, cycle.clone(), permit));
        }
    }
}

impl Shared {
    /// Peers known to the store merged with peers the host already knows,
    /// minus the local host and peers still waiting out a penalty
    fn snapshot(&self) -> Vec<AddrInfo> {
        let local = self.host.local_peer_id();
        let now = Utc::now().timestamp();
        let mut merged: HashMap<PeerId, AddrInfo> = HashMap::new();
        let mut deferred = HashSet::new();
        for info in self.host.peerstore().into_iter().chain(self.store.addr_infos()) {
            if info.id == *local {
                continue;
            }
            if !self.store.dial_eligible(&info.id, now) {
                deferred.insert(info.id);
                continue;
            }
            let entry = merged.entry(info.id.clone()).or_insert_with(|| AddrInfo {
                id: info.id.clone(),
                addrs: Vec::new(),
            });
            for addr in info.addrs {
                if !entry.addrs.contains(&addr) {
                    entry.addrs.push(addr);
                }
            }
        }
        if !deferred.is_empty() {
            debug!(deferred = deferred.len(), "[CONN_MGR] Peers waiting out a penalty");
            self.stats.lock().deferred += deferred.len() as u64;
        }
        merged.into_values().filter(|info| !info.addrs.is_empty()).collect()
    }

    /// Learn who the peer is once a connection is up
    async fn enrich(&self, peer: &PeerId) {
        if let Some(agent) = self.host.agent_version(peer) {
            self.store.record_client(peer, &agent);
        }
        if !self.settings.request_status {
            return;
        }

        let local = self.local.status();
        match methods::request_status(self.host.as_ref(), peer, &local, self.settings.rpc_timeout).await {
            Ok((status, rtt)) => {
                self.store.record_status(peer, &status, rtt);
                self.metrics.rpc_outcome("status", "success");
            }
            Err(e) => {
                self.metrics.rpc_outcome("status", e.kind());
                debug!(peer = %peer, "[RPC] Status request failed: {}", e);
            }
        }

        match methods::request_metadata(self.host.as_ref(), peer, self.settings.rpc_timeout).await {
            Ok(metadata) => {
                self.store.record_metadata(peer, Some(&metadata));
                self.metrics.rpc_outcome("metadata", "success");
            }
            Err(e) => {
                self.store.record_metadata(peer, None);
                self.metrics.rpc_outcome("metadata", e.kind());
                debug!(peer = %peer, "[RPC] Metadata request failed: {}", e);
            }
        }
    }
}

async fn dial_peer(shared: Arc<Shared>, info: AddrInfo, cycle: CancellationToken, _permit: OwnedSemaphorePermit) {
    let peer = info.id.clone();
    let target = AddrInfo::dialable(info.id, &info.addrs);
    if target.addrs.is_empty() {
        debug!(peer = %peer, "[CONN_MGR] No transport address, skipping");
        return;
    }

    let settings = &shared.settings;
    let mut last_failure = DialFailure::Transient;
    for attempt in 1..=settings.max_retries {
        if attempt > 1 && !settings.retry_backoff.is_zero() {
            let delay = settings.retry_backoff * (attempt - 1);
            tokio::select! {
                _ = cycle.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cycle.is_cancelled() {
            debug!(peer = %peer, attempt, "[CONN_MGR] Cycle over, stopping dial loop");
            return;
        }

        shared.metrics.dial_attempts.inc();
        shared.stats.lock().attempts += 1;

        let err = match tokio::time::timeout(settings.dial_timeout, shared.host.dial(&target)).await {
            Ok(Ok(())) => {
                shared.store.record_attempt(&peer, true, None);
                shared.metrics.dial_successes.inc();
                shared.stats.lock().successes += 1;
                info!(peer = %peer, attempt, "[CONN_MGR] Connected");
                shared.enrich(&peer).await;
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => CrawlerError::Timeout(settings.dial_timeout),
        };

        shared.store.record_attempt(&peer, false, Some(&err.to_string()));
        shared.tracker.record(&peer, target.addrs.first(), err.kind(), attempt);
        debug!(
            peer = %peer,
            attempt,
            max_retries = settings.max_retries,
            reason = err.kind(),
            "[CONN_MGR] Dial failed: {}",
            err
        );

        last_failure = DialFailure::classify(&err);
        if last_failure == DialFailure::Deprecated {
            shared.store.deprecate(&peer);
            shared.stats.lock().deprecated += 1;
            info!(peer = %peer, reason = err.kind(), "[CONN_MGR] Peer deprecated: {}", err);
            return;
        }
    }

    shared.stats.lock().exhausted += 1;
    if last_failure == DialFailure::Penalized && !settings.failure_penalty.is_zero() {
        let window = shared.store.penalize(&peer, settings.failure_penalty);
        debug!(peer = %peer, window_secs = window.as_secs(), "[CONN_MGR] Peer penalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::test_utils::MockHost;
    use crate::p2p::types::{ForkDigest, Multiaddr};

    fn peer(n: u8) -> PeerId {
        PeerId::from_public_key(&[n; 33])
    }

    fn addr(n: u8) -> Multiaddr {
        format!("/ip4/10.0.0.{}/tcp/9000", n).parse().unwrap()
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            max_retries: 3,
            dial_timeout: Duration::from_secs(5),
            rescan_interval: Duration::from_secs(60),
            max_concurrent_dials: 4,
            request_status: false,
            rpc_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(10),
            failure_penalty: Duration::from_secs(3600),
        }
    }

    struct Fixture {
        host: Arc<MockHost>,
        store: Arc<PeerRecordStore>,
        tracker: Arc<DialTracker>,
        manager: ConnectionManager,
    }

    fn fixture(host: MockHost, settings: ConnectionSettings) -> Fixture {
        let host = Arc::new(host);
        let store = Arc::new(PeerRecordStore::new());
        let tracker = Arc::new(DialTracker::new());
        let manager = ConnectionManager::new(
            host.clone(),
            store.clone(),
            Arc::new(CrawlerMetrics::new().unwrap()),
            tracker.clone(),
            Arc::new(LocalNode::new(ForkDigest::default())),
            settings,
        );
        Fixture {
            host,
            store,
            tracker,
            manager,
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_selector_exhausts_small_snapshot() {
        let snapshot: Vec<AddrInfo> = (1..=3)
            .map(|n| AddrInfo {
                id: peer(n),
                addrs: vec![addr(n)],
            })
            .collect();
        let mut selector = CycleSelector::new(snapshot);
        let mut rng = rand::thread_rng();

        let mut seen = HashSet::new();
        for _ in 0..10 {
            if let Some(info) = selector.next(&mut rng) {
                assert!(seen.insert(info.id));
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(selector.tried(), 3);
        assert!(selector.next(&mut rng).is_none());
    }

    #[test]
    fn test_selector_empty_snapshot() {
        let mut selector = CycleSelector::new(Vec::new());
        assert!(selector.next(&mut rand::thread_rng()).is_none());
    }

    #[tokio::test]
    async fn test_success_stops_retrying() {
        let f = fixture(MockHost::new(), settings());
        f.host.script_dials(&peer(1), &[false, true, false]);
        f.store.add_address(&peer(1), addr(1), Duration::from_secs(60));

        let handle = f.manager.start();
        let store = f.store.clone();
        wait_for(|| store.get(&peer(1)).map_or(false, |r| r.successes == 1)).await;
        handle.shutdown().await;

        let record = f.store.get(&peer(1)).unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.successes, 1);
        assert_eq!(f.host.dial_count(&peer(1)), 2);
        assert_eq!(f.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_peer_abandoned_after_max_retries() {
        let f = fixture(MockHost::new().with_failing_dials(), settings());
        f.store.add_address(&peer(2), addr(2), Duration::from_secs(60));

        let handle = f.manager.start();
        let manager_stats = || f.manager.stats();
        wait_for(|| manager_stats().exhausted == 1).await;
        handle.shutdown().await;

        let record = f.store.get(&peer(2)).unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.successes, 0);
        assert!(record.last_error.is_some());
        assert_eq!(f.host.dial_count(&peer(2)), 3);
        assert_eq!(f.tracker.get_failures_for_peer(&peer(2)).len(), 3);
        assert_eq!(f.tracker.get_failures()[0].reason, "connection_refused");
    }

    #[tokio::test]
    async fn test_peer_id_suffix_is_stripped_before_dialing() {
        let f = fixture(MockHost::new(), settings());
        let suffixed: Multiaddr = format!("/ip4/10.0.0.3/tcp/9000/p2p/{}", peer(3))
            .parse()
            .unwrap();
        f.host.add_peer(peer(3), suffixed);

        let handle = f.manager.start();
        let store = f.store.clone();
        wait_for(|| store.get(&peer(3)).map_or(false, |r| r.successes == 1)).await;
        handle.shutdown().await;

        let dialed = f.host.last_dialed(&peer(3)).unwrap();
        assert_eq!(dialed, vec![addr(3)]);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_dial() {
        let host = MockHost::new()
            .with_failing_dials()
            .with_dial_delay(Duration::from_millis(200));
        let f = fixture(host, settings());
        f.store.add_address(&peer(4), addr(4), Duration::from_secs(60));

        let handle = f.manager.start();
        let host = f.host.clone();
        wait_for(|| host.dial_count(&peer(4)) == 1).await;
        handle.shutdown().await;

        // the attempt in flight at shutdown was recorded, no new one started
        let record = f.store.get(&peer(4)).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(f.host.dial_count(&peer(4)), 1);
    }

    #[tokio::test]
    async fn test_status_exchange_after_connect() {
        let remote = Arc::new(LocalNode::new(ForkDigest([0xb5, 0x30, 0x3f, 0x2a])));
        remote.update_head(4242, [7; 32], 130, [6; 32]);
        let host = MockHost::new().with_responder(remote);
        let mut s = settings();
        s.request_status = true;
        let f = fixture(host, s);
        f.host.set_agent(&peer(5), "Lighthouse/v4.5.0-441fc16/x86_64-linux");
        f.store.add_address(&peer(5), addr(5), Duration::from_secs(60));

        let handle = f.manager.start();
        let store = f.store.clone();
        wait_for(|| store.get(&peer(5)).map_or(false, |r| r.metadata_requested)).await;
        handle.shutdown().await;

        let record = f.store.get(&peer(5)).unwrap();
        assert_eq!(record.head_slot, Some(4242));
        assert_eq!(record.finalized_epoch, Some(130));
        assert_eq!(record.client_name.as_deref(), Some("Lighthouse"));
        assert!(record.metadata_succeeded);
    }

    #[tokio::test]
    async fn test_local_peer_is_never_dialed() {
        let f = fixture(MockHost::new(), settings());
        let local = f.host.local_peer_id().clone();
        f.host.add_peer(local.clone(), addr(9));
        f.store.add_address(&local, addr(9), Duration::from_secs(60));
        f.store.add_address(&peer(6), addr(6), Duration::from_secs(60));

        assert!(f.manager.shared.snapshot().iter().all(|info| info.id != local));

        let handle = f.manager.start();
        let store = f.store.clone();
        wait_for(|| store.get(&peer(6)).map_or(false, |r| r.successes == 1)).await;
        handle.shutdown().await;

        assert_eq!(f.host.dial_count(&local), 0);
        assert_eq!(f.store.get(&local).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_retries_are_spaced_by_backoff() {
        let mut s = settings();
        s.retry_backoff = Duration::from_millis(100);
        let f = fixture(MockHost::new().with_failing_dials(), s);
        f.store.add_address(&peer(7), addr(7), Duration::from_secs(60));

        let handle = f.manager.start();
        let host = f.host.clone();
        let mut seen = Vec::new();
        for n in 1..=3 {
            wait_for(|| host.dial_count(&peer(7)) == n).await;
            seen.push(tokio::time::Instant::now());
        }
        handle.shutdown().await;

        // 100ms before the second attempt, 200ms before the third; polling adds slack
        assert!(seen[1] - seen[0] >= Duration::from_millis(90));
        assert!(seen[2] - seen[1] >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let mut s = settings();
        s.retry_backoff = Duration::from_secs(30);
        let f = fixture(MockHost::new().with_failing_dials(), s);
        f.store.add_address(&peer(8), addr(8), Duration::from_secs(60));

        let handle = f.manager.start();
        let host = f.host.clone();
        wait_for(|| host.dial_count(&peer(8)) == 1).await;
        handle.shutdown().await;

        assert_eq!(f.host.dial_count(&peer(8)), 1);
        assert_eq!(f.manager.stats().exhausted, 0);
    }

    #[tokio::test]
    async fn test_dial_timeout_is_recorded_and_penalized() {
        let mut s = settings();
        s.max_retries = 1;
        s.dial_timeout = Duration::from_millis(50);
        let f = fixture(MockHost::new().with_dial_delay(Duration::from_secs(5)), s);
        f.store.add_address(&peer(10), addr(10), Duration::from_secs(60));

        let handle = f.manager.start();
        let manager_stats = || f.manager.stats();
        wait_for(|| manager_stats().exhausted == 1).await;
        handle.shutdown().await;

        let record = f.store.get(&peer(10)).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.successes, 0);
        assert!(record.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(record.penalty_secs, 3600);
        assert_eq!(f.tracker.get_failures()[0].reason, "timeout");
    }

    #[tokio::test]
    async fn test_penalized_and_deprecated_peers_left_out_of_snapshot() {
        let f = fixture(MockHost::new(), settings());
        for n in 11..=14 {
            f.store.add_address(&peer(n), addr(n), Duration::from_secs(60));
        }
        // inside its window
        f.store.record_attempt(&peer(11), false, Some("timed out"));
        f.store.penalize(&peer(11), Duration::from_secs(3600));
        // window already elapsed
        f.store.penalize(&peer(12), Duration::from_secs(60));
        f.store.upsert(&peer(12), |r| r.last_attempt = Some(Utc::now().timestamp() - 120));
        f.store.deprecate(&peer(13));

        let ids: HashSet<PeerId> = f.manager.shared.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, HashSet::from([peer(12), peer(14)]));
        assert_eq!(f.manager.stats().deferred, 2);
    }

    #[tokio::test]
    async fn test_protocol_failure_deprecates_without_retry() {
        fn mismatch() -> CrawlerError {
            CrawlerError::Protocol("peer id mismatch".to_string())
        }
        let host = MockHost::new().with_failing_dials().with_dial_error(mismatch);
        let f = fixture(host, settings());
        f.store.add_address(&peer(15), addr(15), Duration::from_secs(60));

        let handle = f.manager.start();
        let manager_stats = || f.manager.stats();
        wait_for(|| manager_stats().deprecated == 1).await;
        handle.shutdown().await;

        assert_eq!(f.host.dial_count(&peer(15)), 1);
        let record = f.store.get(&peer(15)).unwrap();
        assert!(record.deprecated);
        assert_eq!(record.penalty_secs, 0);
    }

    #[test]
    fn test_failure_classification() {
        let refused = CrawlerError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        let no_route = CrawlerError::Io(std::io::Error::new(std::io::ErrorKind::Other, "No route to host"));
        assert_eq!(DialFailure::classify(&refused), DialFailure::Transient);
        assert_eq!(DialFailure::classify(&no_route), DialFailure::Deprecated);
        assert_eq!(
            DialFailure::classify(&CrawlerError::Timeout(Duration::from_secs(1))),
            DialFailure::Penalized
        );
    }

    #[tokio::test]
    async fn test_silent_peer_status_times_out_without_stalling() {
        let mut s = settings();
        s.request_status = true;
        s.rpc_timeout = Duration::from_millis(50);
        let f = fixture(MockHost::new().with_silent_streams(), s);
        f.store.add_address(&peer(16), addr(16), Duration::from_secs(60));

        let handle = f.manager.start();
        let store = f.store.clone();
        wait_for(|| store.get(&peer(16)).map_or(false, |r| r.metadata_requested)).await;
        handle.shutdown().await;

        let record = f.store.get(&peer(16)).unwrap();
        assert_eq!(record.successes, 1);
        assert!(record.head_slot.is_none());
        assert!(!record.metadata_succeeded);
    }
}
