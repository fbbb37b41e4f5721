//! Responder side of the request/response methods
//!
//! The crawler answers status, metadata and ping requests from the peers it
//! connects to, advertising whatever chain view ingestion last produced.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{CrawlerError, Result};
use crate::p2p::types::{ForkDigest, PeerId};
use crate::rpc::codec::{self, ResultCode};
use crate::rpc::methods::{MetaData, RpcMethod, Status};

#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn status(&self, peer: &PeerId, remote: Status) -> Result<Status>;

    async fn metadata(&self, peer: &PeerId) -> Result<MetaData>;

    async fn ping(&self, peer: &PeerId, seq: u64) -> Result<u64>;
}

/// The crawler's own chain view, updated by ingestion
pub struct LocalNode {
    status: RwLock<Status>,
    metadata: RwLock<MetaData>,
}

impl LocalNode {
    pub fn new(fork_digest: ForkDigest) -> Self {
        Self {
            status: RwLock::new(Status {
                fork_digest,
                ..Status::default()
            }),
            metadata: RwLock::new(MetaData::default()),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn metadata(&self) -> MetaData {
        *self.metadata.read()
    }

    /// Advance the advertised head; older slots are ignored
    pub fn update_head(&self, head_slot: u64, head_root: [u8; 32], finalized_epoch: u64, finalized_root: [u8; 32]) {
        let mut status = self.status.write();
        if head_slot < status.head_slot {
            return;
        }
        status.head_slot = head_slot;
        status.head_root = head_root;
        if finalized_epoch >= status.finalized_epoch {
            status.finalized_epoch = finalized_epoch;
            status.finalized_root = finalized_root;
        }
    }
}

#[async_trait]
impl RpcHandler for LocalNode {
    async fn status(&self, peer: &PeerId, remote: Status) -> Result<Status> {
        debug!(
            peer = %peer,
            head_slot = remote.head_slot,
            fork_digest = %remote.fork_digest,
            "[RPC] Inbound status"
        );
        Ok(self.status())
    }

    async fn metadata(&self, _peer: &PeerId) -> Result<MetaData> {
        Ok(self.metadata())
    }

    async fn ping(&self, _peer: &PeerId, _seq: u64) -> Result<u64> {
        Ok(self.metadata().seq_number)
    }
}

/// Answer one inbound request on `stream`.
///
/// An undecodable request gets an invalid-request chunk, a failing handler a
/// server-error chunk. The returned error describes what went wrong locally.
pub async fn serve<S>(
    stream: &mut S,
    method: &RpcMethod,
    peer: &PeerId,
    handler: &dyn RpcHandler,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::time::timeout(timeout, serve_inner(stream, method, peer, handler))
        .await
        .map_err(|_| CrawlerError::Timeout(timeout))?
}

async fn serve_inner<S>(stream: &mut S, method: &RpcMethod, peer: &PeerId, handler: &dyn RpcHandler) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = if method.has_request {
        match codec::read_payload(stream, method.compression).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(peer = %peer, method = method.name, "[RPC] Unreadable request: {}", e);
                codec::write_error_chunk(stream, ResultCode::InvalidRequest, method.compression, &e.to_string())
                    .await?;
                stream.shutdown().await?;
                return Err(e);
            }
        }
    } else {
        None
    };

    let response = dispatch(method, peer, handler, request.as_deref()).await;

    match response {
        Ok(payload) => {
            codec::write_chunk(stream, ResultCode::Success, method.compression, &payload).await?;
        }
        Err(e @ CrawlerError::Decode(_)) => {
            codec::write_error_chunk(stream, ResultCode::InvalidRequest, method.compression, &e.to_string())
                .await?;
        }
        Err(e) => {
            codec::write_error_chunk(stream, ResultCode::ServerError, method.compression, &e.to_string())
                .await?;
        }
    }
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

async fn dispatch(method: &RpcMethod, peer: &PeerId, handler: &dyn RpcHandler, request: Option<&[u8]>) -> Result<Vec<u8>> {
    let body = request.unwrap_or_default();
    match method.name {
        "status" => {
            let remote: Status = bincode::deserialize(body)?;
            Ok(bincode::serialize(&handler.status(peer, remote).await?)?)
        }
        "metadata" => Ok(bincode::serialize(&handler.metadata(peer).await?)?),
        "ping" => {
            let seq: u64 = bincode::deserialize(body)?;
            Ok(bincode::serialize(&handler.ping(peer, seq).await?)?)
        }
        other => Err(CrawlerError::Protocol(format!("no handler for method {}", other))),
    }
}
