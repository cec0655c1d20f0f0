use consensus::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{NameStoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: SocketAddr,
    /// Observed round-trip time to this peer, used to pick the closest replica.
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    pub node_ip: IpAddr,
    pub port: u16,
    /// Full membership, this node included.
    pub peers: Vec<PeerConfig>,
    pub controllers_per_name: usize,
    pub rc_timeout_ms: u64,
    pub value_poll_interval_ms: u64,
    /// `None` keeps polling old actives until one answers.
    pub max_value_poll_rounds: Option<u32>,
    /// Lets a controller that still holds the old values ship them with the start request.
    pub embed_previous_value: bool,
    pub quorum_timeout_ms: u64,
    pub decision_workers: usize,
    /// Zero disables the periodic new-actives scan.
    pub reconfiguration_interval_ms: u64,
}

pub const DEFAULT_RC_TIMEOUT_MS: u64 = 5000;

impl Config {
    pub fn new(node_id: NodeId, node_ip: IpAddr, port: u16, peers: Vec<PeerConfig>) -> Self {
        Self {
            node_id,
            node_ip,
            port,
            peers,
            controllers_per_name: 3,
            rc_timeout_ms: DEFAULT_RC_TIMEOUT_MS,
            value_poll_interval_ms: DEFAULT_RC_TIMEOUT_MS / 4,
            max_value_poll_rounds: None,
            embed_previous_value: true,
            quorum_timeout_ms: 5000,
            decision_workers: 8,
            reconfiguration_interval_ms: 0,
        }
    }

    /// Configs for `count` nodes on the loopback interface, IDs starting at 1.
    pub fn local_cluster(count: u32, base_port: u16) -> Vec<Config> {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let peers: Vec<PeerConfig> = (1..=count)
            .map(|id| PeerConfig {
                id: NodeId(id),
                address: SocketAddr::new(ip, base_port.saturating_add(id as u16)),
                latency_ms: None,
            })
            .collect();

        peers
            .iter()
            .map(|peer| Config::new(peer.id, ip, peer.address.port(), peers.clone()))
            .collect()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(NameStoreError::InvalidConfig(format!("duplicate node ID {}", peer.id)));
            }
        }
        if !seen.contains(&self.node_id) {
            return Err(NameStoreError::InvalidConfig(format!(
                "node {} is not in the membership list",
                self.node_id
            )));
        }
        if self.controllers_per_name == 0 {
            return Err(NameStoreError::InvalidConfig(
                "controllers_per_name must be at least 1".to_string(),
            ));
        }
        if self.controllers_per_name > self.peers.len() {
            return Err(NameStoreError::InvalidConfig(format!(
                "controllers_per_name {} exceeds cluster size {}",
                self.controllers_per_name,
                self.peers.len()
            )));
        }
        if self.rc_timeout_ms == 0 || self.value_poll_interval_ms == 0 || self.quorum_timeout_ms == 0 {
            return Err(NameStoreError::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.decision_workers == 0 {
            return Err(NameStoreError::InvalidConfig(
                "decision_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.node_ip, self.port)
    }

    pub fn membership(&self) -> Vec<NodeId> {
        self.peers.iter().map(|peer| peer.id).collect()
    }

    pub fn rc_timeout(&self) -> Duration {
        Duration::from_millis(self.rc_timeout_ms)
    }

    pub fn value_poll_interval(&self) -> Duration {
        Duration::from_millis(self.value_poll_interval_ms)
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }

    pub fn reconfiguration_interval(&self) -> Option<Duration> {
        match self.reconfiguration_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Sets the stop/start re-send interval and derives the value poll interval from it.
    pub fn with_rc_timeout_ms(mut self, rc_timeout_ms: u64) -> Self {
        self.rc_timeout_ms = rc_timeout_ms;
        self.value_poll_interval_ms = (rc_timeout_ms / 4).max(1);
        self
    }
}

impl From<Config> for consensus::Config {
    fn from(config: Config) -> Self {
        consensus::Config {
            node_id: config.node_id,
            decision_workers: config.decision_workers,
        }
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        network::Config {
            node_id: config.node_id,
            latency_hints: config
                .peers
                .iter()
                .filter_map(|peer| peer.latency_ms.map(|ms| (peer.id, ms)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cluster_configs_validate() {
        let configs = Config::local_cluster(5, 7000);
        assert_eq!(configs.len(), 5);
        for config in &configs {
            config.validate().unwrap();
            assert_eq!(config.membership().len(), 5);
        }
        assert_eq!(configs[0].value_poll_interval_ms, 1250);
    }

    #[test]
    fn validation_fails_fast() {
        let mut config = Config::local_cluster(2, 7000).remove(0);
        assert!(matches!(config.validate(), Err(NameStoreError::InvalidConfig(_))));

        config.controllers_per_name = 2;
        config.validate().unwrap();

        config.peers.push(config.peers[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::local_cluster(3, 7000).remove(0);
        config.node_id = NodeId(42);
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::local_cluster(3, 7000).remove(1).with_rc_timeout_ms(400);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_id, NodeId(2));
        assert_eq!(parsed.value_poll_interval_ms, 100);
        assert_eq!(parsed.reconfiguration_interval(), None);
    }
}
