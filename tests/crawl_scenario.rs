//! End-to-end crawl scenarios through the public library API

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use beacon_crawler::gossip::topics::eth2_topic;
use beacon_crawler::gossip::StateFetcher;
use beacon_crawler::p2p::discovery::{DiscoveryOutcome, Eth2Data, FilterReason, NodeRecord};
use beacon_crawler::p2p::geo::NoopLocator;
use beacon_crawler::p2p::test_utils::MockHost;
use beacon_crawler::p2p::{ForkDigest, NetworkHost, TcpHost};
use beacon_crawler::rpc::methods;
use beacon_crawler::storage::StoreKind;
use beacon_crawler::{Crawler, CrawlerConfig, CrawlerError, Result};

const MAINNET: ForkDigest = ForkDigest([0xb5, 0x30, 0x3f, 0x2a]);

struct FixedState(Vec<u8>);

#[async_trait]
impl StateFetcher for FixedState {
    async fn fetch(&self, _slot: u64) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }

    fn endpoint(&self) -> &str {
        "fixed"
    }
}

fn node_record(key: &[u8], digest: ForkDigest, port: u16) -> NodeRecord {
    NodeRecord {
        seq: 1,
        public_key: key.to_vec(),
        ip: Some("10.0.0.7".parse().unwrap()),
        tcp_port: Some(port),
        udp_port: Some(port),
        eth2: Some(Eth2Data {
            fork_digest: digest,
            next_fork_version: [0; 4],
            next_fork_epoch: u64::MAX,
        }),
    }
}

fn filtering_config() -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.network.local_fork_digest = MAINNET.to_string();
    config.discovery.filter_digest = Some(MAINNET.to_string());
    config
}

fn signed_block(slot: u64, state_root: [u8; 32]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&100u32.to_le_bytes());
    bytes.extend_from_slice(&[0xAB; 96]);
    bytes.extend_from_slice(&slot.to_le_bytes());
    bytes.extend_from_slice(&7u64.to_le_bytes());
    bytes.extend_from_slice(&[0x11; 32]);
    bytes.extend_from_slice(&state_root);
    bytes.extend_from_slice(&84u32.to_le_bytes());
    bytes
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn discovered_peer_is_dialed_once_per_cycle() {
    let crawler = Crawler::new(
        filtering_config(),
        Arc::new(MockHost::new()),
        Arc::new(FixedState(Vec::new())),
        Arc::new(NoopLocator),
    )
    .unwrap();

    let record = node_record(b"matching-peer", MAINNET, 9000);
    let peer = record.peer_id();
    let outcome = crawler.handle_node_record(&record).await.unwrap();
    assert_eq!(outcome, DiscoveryOutcome::Updated(peer.clone()));

    let stored = crawler.peer(&peer).unwrap();
    assert_eq!(stored.live_addresses().len(), 1);
    assert_eq!(stored.attempts, 0);

    let other = node_record(b"other-network", ForkDigest([1, 2, 3, 4]), 9001);
    let outcome = crawler.handle_node_record(&other).await.unwrap();
    assert_eq!(
        outcome,
        DiscoveryOutcome::Filtered(FilterReason::DigestMismatch(ForkDigest([1, 2, 3, 4])))
    );
    assert!(matches!(crawler.peer(&other.peer_id()), Err(CrawlerError::NotFound(_))));

    crawler.start_connection_manager().unwrap();
    let dialed = wait_for(|| crawler.peer(&peer).map(|r| r.successes == 1).unwrap_or(false)).await;
    assert!(dialed, "peer was not dialed");
    crawler.stop_connection_manager().await.unwrap();

    let stored = crawler.peer(&peer).unwrap();
    assert!(stored.attempts >= 1);
    assert_eq!(stored.successes, 1);

    let snapshot = crawler.metrics_snapshot();
    assert_eq!(snapshot.total_peers, 1);
    assert_eq!(snapshot.succeeded, 1);
    crawler.shutdown().await.unwrap();
}

#[tokio::test]
async fn gossiped_block_is_ingested_and_served_in_status() {
    let topic = eth2_topic(&MAINNET, "beacon_block");
    let mut config = filtering_config();
    config.network.listen_addr = "127.0.0.1:0".to_string();
    config.ingestion.topics = vec![topic.clone()];

    let state = br#"{"data": {
        "genesis_time": "1606824023",
        "genesis_validators_root": "0x4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95",
        "slot": "6000000",
        "finalized_checkpoint": {"epoch": "187498", "root": "0x0202020202020202020202020202020202020202020202020202020202020202"}
    }}"#;

    let host = TcpHost::bind(config.listen_addr().unwrap(), "beacon-crawler/test")
        .await
        .unwrap();
    let crawler = Crawler::new(
        config,
        host.clone(),
        Arc::new(FixedState(state.to_vec())),
        Arc::new(NoopLocator),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    host.spawn_listener(
        crawler.local().clone(),
        crawler.topics().clone(),
        Duration::from_secs(5),
        cancel.clone(),
    )
    .unwrap();
    crawler.start_ingestion(&topic).unwrap();

    let publisher = TcpHost::bind("127.0.0.1:0".parse().unwrap(), "Lighthouse/v4.5.0/x86_64-linux")
        .await
        .unwrap();
    publisher.dial(&host.local_addr_info()).await.unwrap();
    publisher
        .send_gossip(host.local_peer_id(), &topic, signed_block(6_000_000, [0x33; 32]))
        .await
        .unwrap();

    let generations = crawler.generations().clone();
    let stored = wait_for(|| {
        generations.blocks.current().map(|g| g.len() == 1).unwrap_or(false)
            && generations.states.current().map(|g| g.len() == 1).unwrap_or(false)
    })
    .await;
    assert!(stored, "block and state were not committed");
    assert!(generations
        .states
        .current()
        .unwrap()
        .get(&[0x33; 32])
        .unwrap()
        .is_some());

    let (status, _) = methods::request_status(
        publisher.as_ref(),
        host.local_peer_id(),
        &Default::default(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(status.head_slot, 6_000_000);
    assert_eq!(status.finalized_epoch, 187_498);
    assert_eq!(status.fork_digest, MAINNET);

    let stats = crawler.stop_ingestion(&topic).await.unwrap();
    assert_eq!(stats.blocks_stored, 1);
    assert_eq!(stats.states_stored, 1);
    assert_eq!(crawler.list_generations(StoreKind::Blocks), vec!["blocks".to_string()]);

    crawler.shutdown().await.unwrap();
    cancel.cancel();
}
