//! Best-effort IP geolocation
//!
//! Lookups never block a peer-store update: callers log the error and leave
//! the location unset.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{CrawlerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    #[serde(default)]
    pub country_code: Option<String>,
    pub city: String,
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    fn name(&self) -> &str;

    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation>;
}

/// Loopback, unspecified and RFC 1918 addresses are never looked up
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_unspecified() || v4.is_private() || v4.is_link_local())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

/// Locator used when no database or API is configured
pub struct NoopLocator;

#[async_trait]
impl GeoLocator for NoopLocator {
    fn name(&self) -> &str {
        "none"
    }

    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation> {
        Err(CrawlerError::NotFound(format!("no geolocation source for {}", ip)))
    }
}

/// MaxMind GeoLite2-City database reader
pub struct MaxMindLocator {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindLocator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| {
            CrawlerError::Config(format!("failed to open GeoIP DB {}: {}", path.display(), e))
        })?;
        info!("[GEOIP] Loaded GeoIP DB from: {}", path.display());
        Ok(Self { reader })
    }
}

#[async_trait]
impl GeoLocator for MaxMindLocator {
    fn name(&self) -> &str {
        "maxmind"
    }

    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation> {
        if !is_routable(&ip) {
            return Err(CrawlerError::NotFound(format!("{} is not publicly routable", ip)));
        }

        let city: maxminddb::geoip2::City = self
            .reader
            .lookup(ip)
            .map_err(|e| CrawlerError::NotFound(format!("GeoIP lookup for {}: {}", ip, e)))?;

        let country_code = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .map(|s| s.to_string());
        let country = city
            .country
            .and_then(|c| c.names)
            .and_then(|names| names.get("en").map(|s| s.to_string()))
            .unwrap_or_default();
        let city_name = city
            .city
            .and_then(|c| c.names)
            .and_then(|names| names.get("en").map(|s| s.to_string()))
            .unwrap_or_default();

        if country.is_empty() {
            return Err(CrawlerError::NotFound(format!("no country for {}", ip)));
        }

        debug!(ip = %ip, country = %country, city = %city_name, "[GEOIP] Lookup successful");
        Ok(GeoLocation {
            country,
            country_code,
            city: city_name,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    city: String,
}

/// ip-api.com JSON endpoint
pub struct IpApiLocator {
    client: reqwest::Client,
    base_url: String,
}

impl IpApiLocator {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url("http://ip-api.com/json/", timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlerError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    fn name(&self) -> &str {
        "ip-api"
    }

    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation> {
        if !is_routable(&ip) {
            return Err(CrawlerError::NotFound(format!("{} is not publicly routable", ip)));
        }

        let url = format!("{}{}", self.base_url, ip);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CrawlerError::UpstreamUnavailable(format!("ip-api request: {}", e)))?;
        let body: IpApiResponse = resp
            .json()
            .await
            .map_err(|e| CrawlerError::Decode(format!("ip-api response: {}", e)))?;

        if body.status != "success" {
            return Err(CrawlerError::NotFound(format!(
                "ip-api status '{}' for {}",
                body.status, ip
            )));
        }
        if body.country.is_empty() || body.city.is_empty() {
            return Err(CrawlerError::NotFound(format!("ip-api: empty country or city for {}", ip)));
        }

        Ok(GeoLocation {
            country: body.country,
            country_code: body.country_code,
            city: body.city,
        })
    }
}
