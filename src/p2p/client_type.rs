//! Client identification from libp2p agent strings
//!
//! Examples of agents seen on the network:
//! - `Lighthouse/v4.5.0-441fc16/x86_64-linux`
//! - `Prysm/v4.1.1/9b2c2d8a`
//! - `teku/teku/v23.10.0/linux-x86_64/-eclipseadoptium-openjdk64bitservervm-java-17`
//! - `nimbus`
//! - `js-libp2p/0.46.21/node/v20`

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub os: String,
}

pub fn parse_user_agent(user_agent: &str) -> ClientInfo {
    let lower = user_agent.to_lowercase();
    let fields: Vec<&str> = lower.split('/').collect();

    let (name, version) = if lower.contains("lighthouse") {
        ("Lighthouse", clean_version(field(&fields, 1)))
    } else if lower.contains("prysm") {
        ("Prysm", clean_version(field(&fields, 1)))
    } else if lower.contains("teku") {
        ("Teku", clean_version(field(&fields, 2)))
    } else if lower.contains("nimbus") {
        ("Nimbus", "Unknown".to_string())
    } else if lower.contains("js-libp2p") || lower.contains("lodestar") {
        ("Lodestar", clean_version(field(&fields, 1)))
    } else if lower.contains("rust-libp2p") || lower.contains("grandine") {
        ("Grandine", clean_version(field(&fields, 1)))
    } else if lower.contains("crawler") || lower.contains("armiarma") {
        ("Crawler", String::new())
    } else if lower.is_empty() {
        ("NotIdentified", String::new())
    } else {
        debug!("[CLIENT] Could not identify client from agent: {}", user_agent);
        ("Others", String::new())
    };

    ClientInfo {
        name: name.to_string(),
        version,
        os: detect_os(&lower),
    }
}

fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).copied().unwrap_or("unknown")
}

fn clean_version(raw: &str) -> String {
    if raw == "unknown" {
        return "Unknown".to_string();
    }
    let cleaned = raw.split('+').next().unwrap_or(raw);
    let cleaned = cleaned.split('-').next().unwrap_or(cleaned);
    cleaned.to_string()
}

fn detect_os(lower: &str) -> String {
    if lower.contains("linux") {
        "linux"
    } else if lower.contains("windows") {
        "windows"
    } else if lower.contains("darwin") || lower.contains("macos") {
        "macos"
    } else {
        "unknown"
    }
    .to_string()
}
