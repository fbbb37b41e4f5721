//! TCP network host
//!
//! Every stream is a fresh TCP connection that starts with a framed hello:
//!
//! ```text
//! "CRAWLER-P2" | version (1 byte) | length (u16 BE) | bincode(StreamHello)
//! ```
//!
//! The hello names the sender and the protocol the rest of the stream speaks.
//! Dialing a peer runs the identify protocol, which checks the remote peer id
//! and learns its agent string; later streams reuse the address that worked.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;

use crate::error::{CrawlerError, Result};
use crate::gossip::topics::GossipTopics;
use crate::p2p::host::{NetworkHost, RpcStream};
use crate::p2p::types::{AddrInfo, Multiaddr, PeerId};
use crate::rpc::codec::{self, Compression};
use crate::rpc::methods::RpcMethod;
use crate::rpc::server::{self, RpcHandler};

const STREAM_MAGIC: &[u8] = b"CRAWLER-P2";
const STREAM_VERSION: u8 = 1;
const MAX_HELLO_LEN: u16 = 4096;

/// Hello exchange performed by `dial`
pub const IDENTIFY_PROTOCOL: &str = "/crawler/identify/1";

/// One gossip message per stream
pub const GOSSIP_PROTOCOL: &str = "/crawler/gossip/1";

/// Deadline for reading the hello of an inbound stream
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHello {
    pub peer_id: PeerId,
    pub agent_version: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GossipFrame {
    topic: String,
    data: Vec<u8>,
}

async fn write_hello<W>(writer: &mut W, hello: &StreamHello) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = bincode::serialize(hello)?;
    let len = u16::try_from(data.len())
        .ok()
        .filter(|l| *l <= MAX_HELLO_LEN)
        .ok_or_else(|| CrawlerError::Protocol(format!("hello of {} bytes is too large", data.len())))?;

    writer.write_all(STREAM_MAGIC).await?;
    writer.write_all(&[STREAM_VERSION]).await?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_hello<R>(reader: &mut R) -> Result<StreamHello>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 10];
    reader.read_exact(&mut magic).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CrawlerError::Protocol("stream closed before hello".to_string())
        } else {
            CrawlerError::Io(e)
        }
    })?;
    if &magic[..] != STREAM_MAGIC {
        const HTTP_VERBS: [&[u8]; 5] = [b"GET ", b"POST", b"HEAD", b"PUT ", b"OPTI"];
        if HTTP_VERBS.iter().any(|verb| magic.starts_with(verb)) {
            return Err(CrawlerError::Protocol("HTTP request on the p2p port".to_string()));
        }
        return Err(CrawlerError::Protocol(format!(
            "invalid stream magic {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version).await?;
    if version[0] != STREAM_VERSION {
        return Err(CrawlerError::Protocol(format!(
            "stream version mismatch (expected v{}, got v{})",
            STREAM_VERSION, version[0]
        )));
    }

    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes);
    if len > MAX_HELLO_LEN {
        return Err(CrawlerError::Protocol(format!("hello length {} exceeds {}", len, MAX_HELLO_LEN)));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data)?)
}

#[derive(Debug, Clone)]
struct KnownPeer {
    addr: SocketAddr,
    agent: String,
}

pub struct TcpHost {
    local_id: PeerId,
    agent_version: String,
    listen_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    known: DashMap<PeerId, KnownPeer>,
}

impl TcpHost {
    /// Bind the listening socket. Failing here is the one condition the
    /// crawler cannot recover from.
    pub async fn bind(listen_addr: SocketAddr, agent_version: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        let local_id = PeerId::from_public_key(&rand::random::<[u8; 32]>());
        info!(peer = %local_id, addr = %bound, "[P2P] Listener bound");

        Ok(Arc::new(Self {
            local_id,
            agent_version: agent_version.to_string(),
            listen_addr: bound,
            listener: Mutex::new(Some(listener)),
            known: DashMap::new(),
        }))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn local_addr_info(&self) -> AddrInfo {
        AddrInfo {
            id: self.local_id.clone(),
            addrs: vec![Multiaddr::from_socket(self.listen_addr)],
        }
    }

    fn hello(&self, protocol: &str) -> StreamHello {
        StreamHello {
            peer_id: self.local_id.clone(),
            agent_version: self.agent_version.clone(),
            protocol: protocol.to_string(),
        }
    }

    /// Accept inbound streams until `cancel` fires
    pub fn spawn_listener(
        self: &Arc<Self>,
        handler: Arc<dyn RpcHandler>,
        topics: Arc<GossipTopics>,
        rpc_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| CrawlerError::InvalidState("listener already running".to_string()))?;
        let host = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "[P2P] Inbound stream accepted");
                        let host = Arc::clone(&host);
                        let handler = Arc::clone(&handler);
                        let topics = Arc::clone(&topics);
                        tokio::spawn(async move {
                            if let Err(e) = host.handle_inbound(stream, handler, topics, rpc_timeout).await {
                                debug!(remote = %remote, "[P2P] Inbound stream failed: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("[P2P] Failed to accept connection: {}", e),
                }
            }
            info!("[P2P] Listener stopped");
        }))
    }

    async fn handle_inbound(
        &self,
        mut stream: TcpStream,
        handler: Arc<dyn RpcHandler>,
        topics: Arc<GossipTopics>,
        rpc_timeout: Duration,
    ) -> Result<()> {
        let hello = tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream))
            .await
            .map_err(|_| CrawlerError::Timeout(HELLO_TIMEOUT))??;
        let remote = hello.peer_id.clone();

        match hello.protocol.as_str() {
            IDENTIFY_PROTOCOL => {
                write_hello(&mut stream, &self.hello(IDENTIFY_PROTOCOL)).await?;
                stream.shutdown().await?;
                Ok(())
            }
            GOSSIP_PROTOCOL => {
                let payload = tokio::time::timeout(
                    rpc_timeout,
                    codec::read_payload(&mut stream, Compression::Gzip),
                )
                .await
                .map_err(|_| CrawlerError::Timeout(rpc_timeout))??;
                let frame: GossipFrame = bincode::deserialize(&payload)?;
                match topics.deliver(&frame.topic, remote, frame.data) {
                    Ok(seq) => debug!(topic = %frame.topic, seq, "[GOSSIP] Message received"),
                    Err(CrawlerError::NotFound(_)) => {
                        debug!(topic = %frame.topic, "[GOSSIP] Dropping message for unrecorded topic")
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            }
            protocol => match RpcMethod::from_protocol_id(protocol) {
                Some(method) => server::serve(&mut stream, &method, &remote, handler.as_ref(), rpc_timeout).await,
                None => {
                    warn!(peer = %remote, protocol, "[P2P] Unsupported protocol");
                    Err(CrawlerError::Protocol(format!("unsupported protocol {}", protocol)))
                }
            },
        }
    }

    async fn connect(&self, addr: SocketAddr, protocol: &str) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_hello(&mut stream, &self.hello(protocol)).await?;
        Ok(stream)
    }

    /// Run the identify exchange against `addr` without remembering the peer
    pub async fn identify(&self, addr: SocketAddr) -> Result<StreamHello> {
        let mut stream = self.connect(addr, IDENTIFY_PROTOCOL).await?;
        let reply = read_hello(&mut stream).await?;
        if reply.protocol != IDENTIFY_PROTOCOL {
            return Err(CrawlerError::Protocol(format!(
                "{} answered identify with {}",
                addr, reply.protocol
            )));
        }
        Ok(reply)
    }

    /// Publish one gossip message to a peer we already dialed
    pub async fn send_gossip(&self, peer: &PeerId, topic: &str, data: Vec<u8>) -> Result<()> {
        let mut stream = self.open_stream(peer, GOSSIP_PROTOCOL).await?;
        let frame = bincode::serialize(&GossipFrame {
            topic: topic.to_string(),
            data,
        })?;
        codec::write_payload(&mut stream, Compression::Gzip, &frame).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkHost for TcpHost {
    fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn dial(&self, info: &AddrInfo) -> Result<()> {
        let mut last_err = None;
        for addr in &info.addrs {
            let Some(socket) = addr.socket_addr() else {
                debug!(addr = %addr, "[P2P] Skipping address without ip/tcp");
                continue;
            };
            match self.identify(socket).await {
                Ok(reply) if reply.peer_id != info.id => {
                    last_err = Some(CrawlerError::Protocol(format!(
                        "{} identified as {}, expected {}",
                        socket, reply.peer_id, info.id
                    )));
                }
                Ok(reply) => {
                    self.known.insert(
                        info.id.clone(),
                        KnownPeer {
                            addr: socket,
                            agent: reply.agent_version,
                        },
                    );
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CrawlerError::Decode(format!("peer {} has no dialable ip/tcp address", info.id))
        }))
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Box<dyn RpcStream>> {
        let addr = self
            .known
            .get(peer)
            .map(|k| k.addr)
            .ok_or_else(|| CrawlerError::NotFound(format!("peer {} is not connected", peer)))?;
        let stream = self.connect(addr, protocol).await?;
        Ok(Box::new(stream))
    }

    fn peerstore(&self) -> Vec<AddrInfo> {
        self.known
            .iter()
            .map(|entry| AddrInfo {
                id: entry.key().clone(),
                addrs: vec![Multiaddr::from_socket(entry.value().addr)],
            })
            .collect()
    }

    fn agent_version(&self, peer: &PeerId) -> Option<String> {
        self.known.get(peer).map(|k| k.agent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::types::ForkDigest;
    use crate::rpc::methods;
    use crate::rpc::server::LocalNode;

    async fn listening_host(agent: &str) -> (Arc<TcpHost>, Arc<LocalNode>, Arc<GossipTopics>, CancellationToken) {
        let host = TcpHost::bind("127.0.0.1:0".parse().unwrap(), agent).await.unwrap();
        let node = Arc::new(LocalNode::new(ForkDigest([1, 2, 3, 4])));
        let topics = Arc::new(GossipTopics::new());
        let cancel = CancellationToken::new();
        host.spawn_listener(node.clone(), topics.clone(), Duration::from_secs(5), cancel.clone())
            .unwrap();
        (host, node, topics, cancel)
    }

    #[tokio::test]
    async fn test_hello_rejects_bad_magic() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let err = read_hello(&mut b).await.unwrap_err();
        assert!(matches!(err, CrawlerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_dial_identify_and_status() {
        let (remote, remote_node, _topics, cancel) = listening_host("Lighthouse/v4.5.0/x86_64-linux").await;
        remote_node.update_head(512, [5; 32], 15, [4; 32]);
        let local = TcpHost::bind("127.0.0.1:0".parse().unwrap(), "crawler/0.1.0").await.unwrap();

        local.dial(&remote.local_addr_info()).await.unwrap();
        assert_eq!(
            local.agent_version(remote.local_peer_id()).as_deref(),
            Some("Lighthouse/v4.5.0/x86_64-linux")
        );
        assert_eq!(local.peerstore().len(), 1);

        let (status, _rtt) = methods::request_status(
            local.as_ref(),
            remote.local_peer_id(),
            &Default::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(status.head_slot, 512);
        assert_eq!(status.fork_digest, ForkDigest([1, 2, 3, 4]));

        let metadata = methods::request_metadata(local.as_ref(), remote.local_peer_id(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(metadata.seq_number, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dial_with_wrong_peer_id_fails() {
        let (remote, _node, _topics, cancel) = listening_host("Prysm/v4.1.1").await;
        let local = TcpHost::bind("127.0.0.1:0".parse().unwrap(), "crawler").await.unwrap();

        let mut info = remote.local_addr_info();
        info.id = PeerId::from_public_key(b"somebody else");
        assert!(matches!(local.dial(&info).await, Err(CrawlerError::Protocol(_))));
        assert!(local.peerstore().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_open_stream_requires_dial() {
        let local = TcpHost::bind("127.0.0.1:0".parse().unwrap(), "crawler").await.unwrap();
        let res = local.open_stream(&PeerId::from_public_key(b"x"), IDENTIFY_PROTOCOL).await;
        assert!(matches!(res, Err(CrawlerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_gossip_delivered_into_topic_log() {
        let (remote, _node, topics, cancel) = listening_host("teku/teku/v23.10.0").await;
        topics.record("/eth2/01020304/beacon_block/ssz_snappy", true).unwrap();
        let local = TcpHost::bind("127.0.0.1:0".parse().unwrap(), "crawler").await.unwrap();
        local.dial(&remote.local_addr_info()).await.unwrap();

        local
            .send_gossip(remote.local_peer_id(), "/eth2/01020304/beacon_block/ssz_snappy", vec![9, 9, 9])
            .await
            .unwrap();

        let mut latest = None;
        for _ in 0..100 {
            if let Ok(msg) = topics.read_latest("/eth2/01020304/beacon_block/ssz_snappy") {
                latest = Some(msg);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let msg = latest.expect("gossip message delivered");
        assert_eq!(msg.data, vec![9, 9, 9]);
        assert_eq!(&msg.from, local.local_peer_id());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_second_listener_rejected() {
        let (host, node, topics, cancel) = listening_host("crawler").await;
        let again = host.spawn_listener(node, topics, Duration::from_secs(1), cancel.clone());
        assert!(matches!(again, Err(CrawlerError::InvalidState(_))));
        cancel.cancel();
    }
}
