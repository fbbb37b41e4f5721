//! Companion beacon node client used to fetch full states by slot

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use std::time::Duration;
use tracing::debug;

use crate::error::{CrawlerError, Result};

#[async_trait]
pub trait StateFetcher: Send + Sync {
    /// Raw state bytes (SSZ or JSON) for `slot`. Non-2xx and empty bodies are
    /// `UpstreamUnavailable`; there is no retry at this level.
    async fn fetch(&self, slot: u64) -> Result<Vec<u8>>;

    fn endpoint(&self) -> &str;
}

/// `GET {base}{slot}` against a beacon node debug endpoint
pub struct HttpStateFetcher {
    client: reqwest::Client,
    base: String,
}

impl HttpStateFetcher {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlerError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base: base.to_string(),
        })
    }
}

#[async_trait]
impl StateFetcher for HttpStateFetcher {
    async fn fetch(&self, slot: u64) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base, slot);
        debug!(slot, url = %url, "[INGEST] Fetching state");

        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, "application/octet-stream, application/json;q=0.9")
            .send()
            .await
            .map_err(|e| CrawlerError::UpstreamUnavailable(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CrawlerError::UpstreamUnavailable(format!("{} returned {}", url, status)));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| CrawlerError::UpstreamUnavailable(format!("{}: {}", url, e)))?;
        if body.is_empty() {
            return Err(CrawlerError::UpstreamUnavailable(format!("{} returned an empty body", url)));
        }
        Ok(body.to_vec())
    }

    fn endpoint(&self) -> &str {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering with a fixed status line and body
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                status,
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(body).await.unwrap();
            let _ = sock.shutdown().await;
        });
        format!("http://{}/eth/v1/debug/beacon/states/", addr)
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let base = serve_once("200 OK", b"{\"data\":{}}").await;
        let fetcher = HttpStateFetcher::new(&base, Duration::from_secs(5)).unwrap();
        assert_eq!(fetcher.fetch(12).await.unwrap(), b"{\"data\":{}}");
    }

    #[tokio::test]
    async fn test_non_success_status_is_upstream_unavailable() {
        let base = serve_once("404 Not Found", b"missing").await;
        let fetcher = HttpStateFetcher::new(&base, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            fetcher.fetch(12).await,
            Err(CrawlerError::UpstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_body_is_upstream_unavailable() {
        let base = serve_once("200 OK", b"").await;
        let fetcher = HttpStateFetcher::new(&base, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            fetcher.fetch(12).await,
            Err(CrawlerError::UpstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let fetcher =
            HttpStateFetcher::new("http://127.0.0.1:1/states/", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            fetcher.fetch(1).await,
            Err(CrawlerError::UpstreamUnavailable(_))
        ));
    }
}
