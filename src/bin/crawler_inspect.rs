//! Inspect a single crawler-protocol peer: identify, status, metadata, ping.
//!
//! Usage:
//!   cargo run --bin crawler_inspect -- --addr 127.0.0.1:9000
//!   cargo run --bin crawler_inspect -- --addr 127.0.0.1:9000 --mode raw_v2

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use beacon_crawler::p2p::client_type::parse_user_agent;
use beacon_crawler::p2p::{AddrInfo, Multiaddr, NetworkHost, TcpHost};
use beacon_crawler::rpc::methods;

fn usage() -> ! {
    eprintln!(
        "Usage:\n  crawler_inspect --addr 127.0.0.1:9000 [--mode full|raw_v2]\n\nModes:\n  full     identify, then status, metadata and ping\n  raw_v2   sends a stream header with version=2 (expects the peer to drop it)"
    );
    std::process::exit(2);
}

fn arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
    }

    let addr: SocketAddr = arg_value(&args, "--addr")
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()?;
    let mode = arg_value(&args, "--mode").unwrap_or_else(|| "full".to_string());
    let timeout = Duration::from_secs(7);

    match mode.as_str() {
        "raw_v2" => {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(b"CRAWLER-P2").await?;
            stream.write_all(&[2u8]).await?; // version byte
            stream.flush().await?;
            Ok(())
        }
        "full" => {
            let host = TcpHost::bind("0.0.0.0:0".parse()?, "crawler-inspect").await?;
            let hello = host.identify(addr).await?;
            let client = parse_user_agent(&hello.agent_version);
            println!("peer:     {}", hello.peer_id);
            println!("agent:    {} ({} {} {})", hello.agent_version, client.name, client.version, client.os);

            host.dial(&AddrInfo {
                id: hello.peer_id.clone(),
                addrs: vec![Multiaddr::from_socket(addr)],
            })
            .await?;

            let (status, rtt) =
                methods::request_status(host.as_ref(), &hello.peer_id, &Default::default(), timeout).await?;
            println!("status:   {} (rtt {:?})", serde_json::to_string(&status)?, rtt);

            let metadata = methods::request_metadata(host.as_ref(), &hello.peer_id, timeout).await?;
            println!("metadata: {}", serde_json::to_string(&metadata)?);

            let seq = methods::ping(host.as_ref(), &hello.peer_id, 1, timeout).await?;
            println!("ping:     seq {}", seq);
            Ok(())
        }
        _ => usage(),
    }
}
