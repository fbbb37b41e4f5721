//! Test utilities for P2P testing with proper isolation
//!
//! `MockHost` stands in for the TCP host: dial outcomes are scripted per peer,
//! and streams are answered in memory by an optional [`RpcHandler`].

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::error::{CrawlerError, Result};
use crate::p2p::host::{NetworkHost, RpcStream};
use crate::p2p::types::{AddrInfo, Multiaddr, PeerId};
use crate::rpc::methods::RpcMethod;
use crate::rpc::server::{self, RpcHandler};

pub struct MockHost {
    local: PeerId,
    peers: Mutex<Vec<AddrInfo>>,
    scripts: Mutex<HashMap<PeerId, VecDeque<bool>>>,
    dials: Mutex<HashMap<PeerId, u32>>,
    last_dialed: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
    agents: Mutex<HashMap<PeerId, String>>,
    dial_ok: bool,
    dial_delay: Duration,
    dial_error: fn() -> CrawlerError,
    responder: Option<Arc<dyn RpcHandler>>,
    silent: bool,
    /// Far ends of silent streams, held open so reads block instead of hitting EOF
    parked: Mutex<Vec<DuplexStream>>,
}

impl MockHost {
    /// Host whose dials succeed unless scripted otherwise
    pub fn new() -> Self {
        Self {
            local: PeerId::from_public_key(b"mock-local-host"),
            peers: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
            last_dialed: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            dial_ok: true,
            dial_delay: Duration::ZERO,
            dial_error: refused,
            responder: None,
            silent: false,
            parked: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failing_dials(mut self) -> Self {
        self.dial_ok = false;
        self
    }

    /// Error returned by failing dials, connection refused by default
    pub fn with_dial_error(mut self, make: fn() -> CrawlerError) -> Self {
        self.dial_error = make;
        self
    }

    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    pub fn with_responder(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.responder = Some(handler);
        self
    }

    /// Streams open fine but the peer never writes a byte
    pub fn with_silent_streams(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn add_peer(&self, id: PeerId, addr: Multiaddr) {
        self.peers.lock().push(AddrInfo { id, addrs: vec![addr] });
    }

    /// Queue dial outcomes for one peer; once drained the default applies
    pub fn script_dials(&self, peer: &PeerId, outcomes: &[bool]) {
        self.scripts
            .lock()
            .entry(peer.clone())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn set_agent(&self, peer: &PeerId, agent: &str) {
        self.agents.lock().insert(peer.clone(), agent.to_string());
    }

    pub fn dial_count(&self, peer: &PeerId) -> u32 {
        self.dials.lock().get(peer).copied().unwrap_or(0)
    }

    /// Addresses handed to the most recent dial of `peer`
    pub fn last_dialed(&self, peer: &PeerId) -> Option<Vec<Multiaddr>> {
        self.last_dialed.lock().get(peer).cloned()
    }

    pub fn total_dials(&self) -> u32 {
        self.dials.lock().values().sum()
    }
}

fn refused() -> CrawlerError {
    CrawlerError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "scripted dial failure",
    ))
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkHost for MockHost {
    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    async fn dial(&self, info: &AddrInfo) -> Result<()> {
        *self.dials.lock().entry(info.id.clone()).or_insert(0) += 1;
        self.last_dialed.lock().insert(info.id.clone(), info.addrs.clone());
        if !self.dial_delay.is_zero() {
            tokio::time::sleep(self.dial_delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .get_mut(&info.id)
            .and_then(|queue| queue.pop_front());
        if scripted.unwrap_or(self.dial_ok) {
            Ok(())
        } else {
            Err((self.dial_error)())
        }
    }

    async fn open_stream(&self, _peer: &PeerId, protocol: &str) -> Result<Box<dyn RpcStream>> {
        if self.silent {
            let (client, remote) = tokio::io::duplex(64 * 1024);
            self.parked.lock().push(remote);
            return Ok(Box::new(client));
        }
        let handler = self
            .responder
            .clone()
            .ok_or_else(|| CrawlerError::Protocol(format!("no responder for {}", protocol)))?;
        let method = RpcMethod::from_protocol_id(protocol)
            .ok_or_else(|| CrawlerError::Protocol(format!("unsupported protocol {}", protocol)))?;

        let (client, mut remote) = tokio::io::duplex(64 * 1024);
        let local = self.local.clone();
        tokio::spawn(async move {
            let _ = server::serve(&mut remote, &method, &local, handler.as_ref(), Duration::from_secs(5)).await;
        });
        Ok(Box::new(client))
    }

    fn peerstore(&self) -> Vec<AddrInfo> {
        self.peers.lock().clone()
    }

    fn agent_version(&self, peer: &PeerId) -> Option<String> {
        self.agents.lock().get(peer).cloned()
    }
}
