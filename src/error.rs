//! Crawler error kinds
//!
//! Every fallible operation in the library returns [`CrawlerError`]. Loops that
//! recover locally (dialing, ingestion) log these and keep going; operator
//! commands surface them to the caller unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlerError {
    /// Unknown peer, generation or topic
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate generation name or duplicate ingestion start
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation precondition not met (e.g. removing the current generation)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Discovery record rejected by the fork digest filter. The adapter itself
    /// returns `DiscoveryOutcome::Filtered`; this is what
    /// `DiscoveryOutcome::into_result` turns it into.
    #[error("filtered: {0}")]
    Filtered(String),

    /// Dial or RPC deadline expired
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed frame or unexpected RPC result code
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote peer answered with the server-error result code
    #[error("remote server error: {0}")]
    RemoteServerError(String),

    /// Remote peer rejected our request as invalid
    #[error("remote rejected request: {0}")]
    RemoteInvalidRequest(String),

    /// Companion node fetch failed or returned an empty body
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CrawlerError {
    /// Short label used for metrics and dial failure reasons
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlerError::NotFound(_) => "not_found",
            CrawlerError::AlreadyExists(_) => "already_exists",
            CrawlerError::InvalidState(_) => "invalid_state",
            CrawlerError::Filtered(_) => "filtered",
            CrawlerError::Timeout(_) => "timeout",
            CrawlerError::Protocol(_) => "protocol",
            CrawlerError::RemoteServerError(_) => "remote_server_error",
            CrawlerError::RemoteInvalidRequest(_) => "remote_invalid_request",
            CrawlerError::UpstreamUnavailable(_) => "upstream_unavailable",
            CrawlerError::Decode(_) => "decode",
            CrawlerError::Config(_) => "config",
            CrawlerError::Storage(_) => "storage",
            CrawlerError::Metrics(_) => "metrics",
            CrawlerError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => "connection_refused",
                std::io::ErrorKind::ConnectionReset => "connection_reset",
                std::io::ErrorKind::UnexpectedEof => "unexpected_eof",
                _ => "io",
            },
        }
    }
}

impl From<serde_json::Error> for CrawlerError {
    fn from(e: serde_json::Error) -> Self {
        CrawlerError::Decode(e.to_string())
    }
}

impl From<bincode::Error> for CrawlerError {
    fn from(e: bincode::Error) -> Self {
        CrawlerError::Decode(e.to_string())
    }
}

pub type Result<T, E = CrawlerError> = std::result::Result<T, E>;
