//! Network host capability
//!
//! Everything the crawler needs from the transport layer: dialing, opening
//! protocol streams and enumerating known peers. `TcpHost` is the production
//! implementation; tests use `test_utils::MockHost`.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::p2p::types::{AddrInfo, PeerId};

/// Bidirectional byte stream negotiated for one protocol
pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RpcStream for T {}

#[async_trait]
pub trait NetworkHost: Send + Sync + 'static {
    fn local_peer_id(&self) -> &PeerId;

    /// Establish a connection; callers bound this with their own timeout
    async fn dial(&self, info: &AddrInfo) -> Result<()>;

    /// Open a new stream speaking `protocol` to an already known peer
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Box<dyn RpcStream>>;

    /// Snapshot of every peer the host knows how to reach
    fn peerstore(&self) -> Vec<AddrInfo>;

    /// Agent string the peer identified itself with, if any
    fn agent_version(&self, peer: &PeerId) -> Option<String>;
}
