use groat_core::{now_ts, BlockchainError, HeaderView, MessageType, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-request timeout for outbound peer calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Message posted to a peer's `/inbox/` and consumed from the local inbound
/// queue. `data` is decoded per message type by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub host: String,
}

impl Envelope {
    pub fn new(msg_type: MessageType, data: impl Serialize, host: &str) -> Self {
        Self {
            msg_type,
            data: serde_json::to_value(data).expect("envelope payloads serialize infallibly"),
            host: host.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PeerInfo {
    last_seen: u64,
    failures: u32,
}

/// Known peer endpoints with liveness bookkeeping. A peer whose consecutive
/// failure count exceeds the downtime threshold is evicted.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerInfo>>,
    downtime_threshold: u32,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(downtime_threshold: u32, max_peers: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            downtime_threshold,
            max_peers,
        }
    }

    /// Returns false when the registry is full or the peer is present.
    pub fn add_peer(&self, host: &str) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains_key(host) || peers.len() >= self.max_peers {
            return false;
        }
        info!(peer = host, "added peer");
        peers.insert(
            host.to_string(),
            PeerInfo {
                last_seen: now_ts(),
                failures: 0,
            },
        );
        true
    }

    pub fn remove_peer(&self, host: &str) -> bool {
        self.peers.lock().remove(host).is_some()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.peers.lock().contains_key(host)
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn get_all_peers(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn record_success(&self, host: &str) {
        if let Some(info) = self.peers.lock().get_mut(host) {
            info.failures = 0;
            info.last_seen = now_ts();
        }
    }

    /// Bumps the failure counter and evicts past the threshold.
    pub fn record_downtime(&self, host: &str) {
        let mut peers = self.peers.lock();
        let evict = match peers.get_mut(host) {
            Some(info) => {
                info.failures += 1;
                info.failures > self.downtime_threshold
            }
            None => false,
        };
        if evict {
            peers.remove(host);
            warn!(peer = host, "evicted unresponsive peer");
        }
    }
}

/// HTTP client side of the peer protocol. Every call targets one peer; on
/// failure the caller is expected to record downtime for that peer.
pub struct PeerClient {
    http: reqwest::Client,
    port: u16,
}

impl PeerClient {
    pub fn new(port: u16) -> Result<Self, BlockchainError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BlockchainError::Store(e.to_string()))?;
        Ok(Self { http, port })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.port)
    }

    fn unreachable(host: &str) -> BlockchainError {
        BlockchainError::PeerUnreachable(host.to_string())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        host: &str,
        path: &str,
    ) -> Result<T, BlockchainError> {
        let response = self
            .http
            .get(self.url(host, path))
            .send()
            .await
            .map_err(|_| Self::unreachable(host))?;
        if !response.status().is_success() {
            return Err(Self::unreachable(host));
        }
        response.json().await.map_err(|_| Self::unreachable(host))
    }

    /// The peer's `network` configuration table.
    pub async fn get_status(&self, host: &str) -> Result<serde_json::Value, BlockchainError> {
        self.get_json(host, "/status/").await
    }

    /// True when the peer's `/status/` matches `local_network` exactly.
    pub async fn status_matches(&self, host: &str, local_network: &serde_json::Value) -> bool {
        match self.get_status(host).await {
            Ok(remote) => remote == *local_network,
            Err(_) => false,
        }
    }

    pub async fn get_nodes(&self, host: &str) -> Result<Vec<String>, BlockchainError> {
        #[derive(Deserialize)]
        struct Nodes {
            full_nodes: Vec<String>,
        }
        Ok(self.get_json::<Nodes>(host, "/nodes/").await?.full_nodes)
    }

    /// Requests the peer to add `own_host`; the peer pings back before
    /// accepting.
    pub async fn connect(&self, host: &str, own_host: &str) -> Result<bool, BlockchainError> {
        #[derive(Deserialize)]
        struct Connected {
            success: bool,
        }
        let response = self
            .http
            .post(self.url(host, "/connect/"))
            .json(&serde_json::json!({ "host": own_host }))
            .send()
            .await
            .map_err(|_| Self::unreachable(host))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: Connected = response.json().await.map_err(|_| Self::unreachable(host))?;
        Ok(body.success)
    }

    pub async fn get_header_by_hash(
        &self,
        host: &str,
        block_hash: &str,
    ) -> Result<HeaderView, BlockchainError> {
        self.get_json(host, &format!("/blocks/hash/{block_hash}"))
            .await
    }

    pub async fn get_latest_header(&self, host: &str) -> Result<HeaderView, BlockchainError> {
        self.get_json(host, "/blocks/height/latest").await
    }

    /// Main-chain block hashes for `start..=end` on the peer.
    pub async fn get_hashes_range(
        &self,
        host: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<String>, BlockchainError> {
        #[derive(Deserialize)]
        struct Hashes {
            block_hashes: Vec<String>,
        }
        Ok(self
            .get_json::<Hashes>(host, &format!("/blocks/start/{start}/end/{end}"))
            .await?
            .block_hashes)
    }

    pub async fn get_transaction_hashes_by_block(
        &self,
        host: &str,
        block_hash: &str,
    ) -> Result<Vec<String>, BlockchainError> {
        #[derive(Deserialize)]
        struct TxHashes {
            tx_hashes: Vec<String>,
        }
        Ok(self
            .get_json::<TxHashes>(host, &format!("/transactions/block_hash/{block_hash}"))
            .await?
            .tx_hashes)
    }

    /// Pulls a full transaction, confirmed or unconfirmed, from the peer.
    pub async fn get_transaction(
        &self,
        host: &str,
        tx_hash: &str,
    ) -> Result<Transaction, BlockchainError> {
        self.get_json(host, &format!("/transactions/{tx_hash}"))
            .await
    }

    pub async fn post_inbox(
        &self,
        host: &str,
        envelope: &Envelope,
    ) -> Result<(), BlockchainError> {
        let response = self
            .http
            .post(self.url(host, "/inbox/"))
            .json(envelope)
            .send()
            .await
            .map_err(|_| Self::unreachable(host))?;
        if !response.status().is_success() {
            return Err(Self::unreachable(host));
        }
        Ok(())
    }

    /// Posts `envelope` to every registered peer except `exclude`,
    /// recording downtime for unreachable ones.
    pub async fn broadcast(
        &self,
        registry: &PeerRegistry,
        envelope: &Envelope,
        exclude: Option<&str>,
    ) {
        for peer in registry.get_all_peers() {
            if Some(peer.as_str()) == exclude {
                continue;
            }
            match self.post_inbox(&peer, envelope).await {
                Ok(()) => registry.record_success(&peer),
                Err(_) => {
                    debug!(peer = %peer, "broadcast delivery failed");
                    registry.record_downtime(&peer);
                }
            }
        }
    }

    /// Peer-set maintenance: gossip `/nodes/` from current peers, then ping
    /// and connect to candidates until the registry is comfortable.
    pub async fn check_peers(
        &self,
        registry: &PeerRegistry,
        seeds: &[String],
        own_host: &str,
        local_network: &serde_json::Value,
        min_peers: usize,
        max_peers: usize,
    ) {
        if registry.count() >= min_peers {
            return;
        }
        let mut candidates: Vec<String> = seeds.to_vec();
        for peer in registry.get_all_peers() {
            match self.get_nodes(&peer).await {
                Ok(nodes) => {
                    registry.record_success(&peer);
                    candidates.extend(nodes);
                }
                Err(_) => registry.record_downtime(&peer),
            }
        }
        candidates.sort();
        candidates.dedup();
        for candidate in candidates {
            if registry.count() >= max_peers {
                break;
            }
            if candidate == own_host || registry.contains(&candidate) {
                continue;
            }
            if !self.status_matches(&candidate, local_network).await {
                continue;
            }
            match self.connect(&candidate, own_host).await {
                Ok(true) => {
                    registry.add_peer(&candidate);
                }
                _ => debug!(peer = %candidate, "peer declined connection"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_caps_size_and_dedups() {
        let registry = PeerRegistry::new(3, 2);
        assert!(registry.add_peer("10.0.0.1"));
        assert!(!registry.add_peer("10.0.0.1"));
        assert!(registry.add_peer("10.0.0.2"));
        assert!(!registry.add_peer("10.0.0.3"));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn repeated_failures_evict_peer() {
        let registry = PeerRegistry::new(2, 8);
        registry.add_peer("10.0.0.1");
        registry.record_downtime("10.0.0.1");
        registry.record_downtime("10.0.0.1");
        assert!(registry.contains("10.0.0.1"));
        registry.record_downtime("10.0.0.1");
        assert!(!registry.contains("10.0.0.1"));
    }

    #[test]
    fn success_resets_failure_count() {
        let registry = PeerRegistry::new(1, 8);
        registry.add_peer("10.0.0.1");
        registry.record_downtime("10.0.0.1");
        registry.record_success("10.0.0.1");
        registry.record_downtime("10.0.0.1");
        assert!(registry.contains("10.0.0.1"));
    }

    #[test]
    fn envelope_wire_format_uses_numeric_type() {
        let envelope = Envelope::new(MessageType::BlockInv, "abc123", "10.0.0.1");
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], 2);
        assert_eq!(wire["data"], "abc123");

        let parsed: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.msg_type, MessageType::BlockInv);

        let unknown = serde_json::json!({"type": 9, "data": null});
        assert!(serde_json::from_value::<Envelope>(unknown).is_err());
    }
}
