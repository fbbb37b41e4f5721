use anyhow::{anyhow, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beacon_crawler::config::GeoIpSection;
use beacon_crawler::gossip::HttpStateFetcher;
use beacon_crawler::p2p::geo::{GeoLocator, IpApiLocator, MaxMindLocator, NoopLocator};
use beacon_crawler::p2p::TcpHost;
use beacon_crawler::{Crawler, CrawlerConfig};

/// Interval between peer summary log lines
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "beacon-crawler", version, about = "Beacon chain peer crawler and gossip ingester")]
struct Args {
    /// TOML config file; defaults are used when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Print the effective config and exit
    #[arg(long)]
    print_config: bool,
}

fn build_locator(geoip: &GeoIpSection) -> Arc<dyn GeoLocator> {
    if let Some(path) = &geoip.db_path {
        match MaxMindLocator::open(path) {
            Ok(locator) => return Arc::new(locator),
            Err(e) => warn!(path = %path, "[GEO] GeoIP database unavailable: {}", e),
        }
    }
    if geoip.use_ip_api {
        match IpApiLocator::new(Duration::from_secs(5)) {
            Ok(locator) => return Arc::new(locator),
            Err(e) => warn!("[GEO] ip-api locator unavailable: {}", e),
        }
    }
    Arc::new(NoopLocator)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // init tracing from env CRAWLER_LOG or RUST_LOG
    let filter = std::env::var("CRAWLER_LOG")
        .unwrap_or_else(|_| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => CrawlerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CrawlerConfig::default(),
    };
    config.apply_env_overrides();
    config.validate().map_err(|e| anyhow!("invalid config: {}", e))?;

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let listen_addr = config.listen_addr().map_err(|e| anyhow!(e))?;
    let host = TcpHost::bind(listen_addr, &config.network.agent_version)
        .await
        .with_context(|| format!("unable to listen on {}", listen_addr))?;

    let fetcher = Arc::new(HttpStateFetcher::new(
        &config.ingestion.state_endpoint,
        Duration::from_secs(config.ingestion.fetch_timeout_secs),
    )?);
    let locator = build_locator(&config.geoip);
    let rpc_timeout = Duration::from_secs(config.connection.rpc_timeout_secs);

    let crawler = Crawler::new(config, host.clone(), fetcher, locator)?;

    let cancel = CancellationToken::new();
    let listener = host.spawn_listener(
        crawler.local().clone(),
        crawler.topics().clone(),
        rpc_timeout,
        cancel.clone(),
    )?;

    crawler.bootstrap().await;
    crawler.start_connection_manager()?;
    for topic in crawler.topics().topics() {
        if !crawler.topics().has_queue(&topic) {
            continue;
        }
        match crawler.start_ingestion(&topic) {
            Ok(()) => info!(topic = %topic, "[INGEST] Ingestion started"),
            Err(e) => warn!(topic = %topic, "[INGEST] Ingestion not started: {}", e),
        }
    }

    info!(addr = %host.listen_addr(), "Beacon crawler running");

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    summary.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = summary.tick() => {
                let snapshot = crawler.metrics_snapshot();
                info!(
                    peers = snapshot.total_peers,
                    attempted = snapshot.attempted,
                    succeeded = snapshot.succeeded,
                    "[CRAWLER] Peer summary"
                );
            }
        }
    }

    crawler.shutdown().await?;
    cancel.cancel();
    if let Err(e) = listener.await {
        warn!("[P2P] Listener task ended abnormally: {}", e);
    }
    Ok(())
}
