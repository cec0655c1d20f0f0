use chrono::{DateTime, Utc};
use consensus::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use crate::transport::Envelope;
use crate::{Config, LocalNetwork, NameServerMessage, NetworkError, RequestId, Result};

/// Latency assumed for peers without an observation.
const DEFAULT_LATENCY: Duration = Duration::from_millis(50);

pub struct MessageHandler {
    node_id: NodeId,
    network: Arc<LocalNetwork>,
    peers: Arc<RwLock<HashMap<NodeId, PeerState>>>,
    message_receiver: Arc<RwLock<Option<mpsc::UnboundedReceiver<Envelope>>>>,
    next_request_id: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PeerState {
    pub latency: Duration,
    pub last_sent: Option<DateTime<Utc>>,
    pub failed_sends: u64,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            latency: DEFAULT_LATENCY,
            last_sent: None,
            failed_sends: 0,
        }
    }
}

impl MessageHandler {
    pub fn new(config: Config, network: Arc<LocalNetwork>) -> Self {
        let receiver = network.register(config.node_id);
        let peers = config
            .latency_hints
            .iter()
            .map(|(node, millis)| {
                (
                    *node,
                    PeerState {
                        latency: Duration::from_millis(*millis),
                        ..PeerState::default()
                    },
                )
            })
            .collect();

        Self {
            node_id: config.node_id,
            network,
            peers: Arc::new(RwLock::new(peers)),
            message_receiver: Arc::new(RwLock::new(Some(receiver))),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Hands the inbox to the node's message loop. Only the first call succeeds.
    pub async fn take_receiver(&self) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let mut guard = self.message_receiver.write().await;
        guard
            .take()
            .ok_or_else(|| NetworkError::Protocol("Message receiver already taken".to_string()))
    }

    pub fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send_message(&self, target_node: NodeId, message: NameServerMessage) -> Result<()> {
        tracing::trace!("{} -> {}: {} for {}", self.node_id, target_node, message.kind(), message.name());
        let result = self.network.deliver(self.node_id, target_node, message);

        let mut peers = self.peers.write().await;
        let peer = peers.entry(target_node).or_default();
        match &result {
            Ok(()) => peer.last_sent = Some(Utc::now()),
            Err(_) => peer.failed_sends += 1,
        }
        result
    }

    /// Sends to every target, logging rather than failing on individual errors.
    pub async fn send_to_many<I>(&self, targets: I, message: NameServerMessage)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut failed_nodes = Vec::new();
        for target in targets {
            if self.send_message(target, message.clone()).await.is_err() {
                failed_nodes.push(target);
            }
        }

        if !failed_nodes.is_empty() {
            tracing::warn!(
                "Failed to send {} to {} nodes: {:?}",
                message.kind(),
                failed_nodes.len(),
                failed_nodes
            );
        }
    }

    pub async fn record_latency(&self, node: NodeId, latency: Duration) {
        self.peers.write().await.entry(node).or_default().latency = latency;
    }

    /// Records the round trip to `node` of a request this node sent at `sent_at`.
    pub async fn observe_round_trip(&self, node: NodeId, sent_at: DateTime<Utc>) -> Duration {
        let round_trip = (Utc::now() - sent_at).to_std().unwrap_or(Duration::ZERO);
        self.record_latency(node, round_trip).await;
        round_trip
    }

    pub async fn latency(&self, node: NodeId) -> Duration {
        if node == self.node_id {
            return Duration::ZERO;
        }
        self.peers
            .read()
            .await
            .get(&node)
            .map(|peer| peer.latency)
            .unwrap_or(DEFAULT_LATENCY)
    }

    /// Lowest-latency node among `candidates`, ties broken by node ID. This node counts as zero latency.
    pub async fn closest_node<I>(&self, candidates: I) -> Option<NodeId>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut best: Option<(Duration, NodeId)> = None;
        for node in candidates {
            let latency = self.latency(node).await;
            if best.map_or(true, |current| (latency, node) < current) {
                best = Some((latency, node));
            }
        }
        best.map(|(_, node)| node)
    }

    pub async fn peer_state(&self, node: NodeId) -> Option<PeerState> {
        self.peers.read().await.get(&node).cloned()
    }
}
