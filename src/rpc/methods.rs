//! Request/response methods and the client side of an exchange
//!
//! All methods share the chunk envelope from [`codec`](super::codec); only the
//! payload schema differs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{CrawlerError, Result};
use crate::p2p::host::NetworkHost;
use crate::p2p::types::{ForkDigest, PeerId};
use crate::rpc::codec::{self, Compression, ResultCode};

/// Handshake object exchanged by the status method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub fork_digest: ForkDigest,
    pub finalized_root: [u8; 32],
    pub finalized_epoch: u64,
    pub head_root: [u8; 32],
    pub head_slot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaData {
    pub seq_number: u64,
    pub attnets: [u8; 8],
}

/// One request/response method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcMethod {
    pub name: &'static str,
    pub version: u32,
    pub compression: Compression,
    /// Methods like metadata send no request payload at all
    pub has_request: bool,
}

pub const STATUS_V1: RpcMethod = RpcMethod {
    name: "status",
    version: 1,
    compression: Compression::Gzip,
    has_request: true,
};

pub const METADATA_V1: RpcMethod = RpcMethod {
    name: "metadata",
    version: 1,
    compression: Compression::Gzip,
    has_request: false,
};

pub const PING_V1: RpcMethod = RpcMethod {
    name: "ping",
    version: 1,
    compression: Compression::Gzip,
    has_request: true,
};

pub const ALL_METHODS: [RpcMethod; 3] = [STATUS_V1, METADATA_V1, PING_V1];

impl RpcMethod {
    pub fn protocol_id(&self) -> String {
        format!(
            "/crawler/req/{}/{}/{}",
            self.name,
            self.version,
            self.compression.encoding()
        )
    }

    pub fn from_protocol_id(protocol: &str) -> Option<RpcMethod> {
        ALL_METHODS
            .iter()
            .find(|m| m.protocol_id() == protocol)
            .copied()
    }
}

/// Run one exchange over an open stream: write the request, half-close,
/// then read exactly one response chunk.
pub async fn exchange<S, Req, Resp>(stream: &mut S, method: &RpcMethod, request: Option<&Req>) -> Result<Resp>
where
    S: AsyncRead + AsyncWrite + Unpin,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    if method.has_request {
        let req = request.ok_or_else(|| {
            CrawlerError::InvalidState(format!("{} requires a request payload", method.name))
        })?;
        let bytes = bincode::serialize(req)?;
        codec::write_payload(stream, method.compression, &bytes).await?;
    }
    stream.flush().await?;
    stream.shutdown().await?;

    match codec::read_result_code(stream).await? {
        ResultCode::Success => {
            let bytes = codec::read_payload(stream, method.compression).await?;
            bincode::deserialize(&bytes).map_err(|e| {
                CrawlerError::Decode(format!("{} response: {}", method.name, e))
            })
        }
        ResultCode::ServerError => {
            let msg = codec::read_error_message(stream, method.compression).await?;
            Err(CrawlerError::RemoteServerError(msg))
        }
        ResultCode::InvalidRequest => {
            let msg = codec::read_error_message(stream, method.compression).await?;
            Err(CrawlerError::RemoteInvalidRequest(msg))
        }
        ResultCode::Unknown(code) => Err(CrawlerError::Protocol(format!(
            "unexpected result code {} for {} request",
            code, method.name
        ))),
    }
}

/// Open a stream to `peer` and run one exchange, all under `timeout`.
/// Dropping the stream on expiry aborts it.
pub async fn call<Req, Resp>(
    host: &dyn NetworkHost,
    peer: &PeerId,
    method: &RpcMethod,
    request: Option<&Req>,
    timeout: Duration,
) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let fut = async {
        let mut stream = host.open_stream(peer, &method.protocol_id()).await?;
        exchange(&mut stream, method, request).await
    };
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| CrawlerError::Timeout(timeout))?
}

/// Ask a peer for its status, returning it with the round-trip time
pub async fn request_status(
    host: &dyn NetworkHost,
    peer: &PeerId,
    local: &Status,
    timeout: Duration,
) -> Result<(Status, Duration)> {
    let started = Instant::now();
    let status: Status = call(host, peer, &STATUS_V1, Some(local), timeout).await?;
    let rtt = started.elapsed();
    debug!(
        peer = %peer,
        head_slot = status.head_slot,
        fork_digest = %status.fork_digest,
        rtt_ms = rtt.as_millis() as u64,
        "[RPC] Status received"
    );
    Ok((status, rtt))
}

pub async fn request_metadata(host: &dyn NetworkHost, peer: &PeerId, timeout: Duration) -> Result<MetaData> {
    call::<(), MetaData>(host, peer, &METADATA_V1, None, timeout).await
}

pub async fn ping(host: &dyn NetworkHost, peer: &PeerId, seq: u64, timeout: Duration) -> Result<u64> {
    call(host, peer, &PING_V1, Some(&seq), timeout).await
}
