use consensus::{NodeId, PaxosManager, PaxosSubstrate};
use network::{MessageHandler, NameServerMessage};
use std::collections::BTreeSet;
use storage::{ActiveRecord, MemoryRecordStore, ReplicaControllerRecord};

use crate::config::Config;
use crate::placement::ConsistentHashing;
use crate::tasks::TaskRegistry;

/// Everything one name server shares between its coordinators.
pub struct NodeContext {
    pub node_id: NodeId,
    pub config: Config,
    pub placement: ConsistentHashing,
    pub paxos: PaxosManager,
    pub network: MessageHandler,
    pub controller_records: MemoryRecordStore<ReplicaControllerRecord>,
    pub active_records: MemoryRecordStore<ActiveRecord>,
    pub tasks: TaskRegistry,
}

impl NodeContext {
    pub fn new(config: Config, placement: ConsistentHashing, paxos: PaxosManager, network: MessageHandler) -> Self {
        Self {
            node_id: config.node_id,
            config,
            placement,
            paxos,
            network,
            controller_records: MemoryRecordStore::new("controller"),
            active_records: MemoryRecordStore::new("active"),
            tasks: TaskRegistry::new(),
        }
    }

    pub fn is_up(&self, node: NodeId) -> bool {
        self.paxos.is_node_up(node)
    }

    /// Fire-and-forget send; delivery failures are logged.
    pub async fn send(&self, target: NodeId, message: NameServerMessage) {
        let kind = message.kind();
        if let Err(e) = self.network.send_message(target, message).await {
            tracing::warn!("Node {} failed to send {} to {}: {}", self.node_id, kind, target, e);
        }
    }

    pub async fn send_to_many(&self, targets: &BTreeSet<NodeId>, message: NameServerMessage) {
        self.network.send_to_many(targets.iter().copied(), message).await;
    }

    /// Closest live node in `candidates` that is not in `exclude`.
    pub async fn closest_live(&self, candidates: &BTreeSet<NodeId>, exclude: &BTreeSet<NodeId>) -> Option<NodeId> {
        let live: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|node| self.is_up(*node) && !exclude.contains(node))
            .collect();
        self.network.closest_node(live).await
    }
}
