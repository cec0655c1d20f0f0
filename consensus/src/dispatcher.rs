use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::messages::Decision;
use crate::{DecisionHandler, NodeId, PaxosId};

type AppliedSlots = Arc<RwLock<HashMap<PaxosId, u64>>>;

enum WorkItem {
    Apply(Decision),
    Restore { paxos_id: PaxosId, state: Bytes },
}

/// Bounded pool of decision workers.
///
/// A paxos ID always hashes to the same worker, so decisions of one instance
/// are applied strictly in commit order while different instances proceed
/// concurrently.
pub struct DecisionDispatcher {
    node_id: NodeId,
    workers: Vec<mpsc::UnboundedSender<WorkItem>>,
    applied: AppliedSlots,
}

impl DecisionDispatcher {
    pub fn new(node_id: NodeId, worker_count: usize, handler: Arc<dyn DecisionHandler>) -> Self {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let applied: AppliedSlots = Arc::new(RwLock::new(HashMap::new()));

        for worker in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let handler = handler.clone();
            let applied = applied.clone();
            tokio::spawn(async move {
                Self::process_decisions(node_id, worker, rx, handler, applied).await
            });
            workers.push(tx);
        }

        tracing::debug!("Started {} decision workers for node {}", worker_count, node_id);

        Self { node_id, workers, applied }
    }

    /// Highest slot of `paxos_id` this node has finished applying.
    pub async fn applied_slot(&self, paxos_id: &PaxosId) -> Option<u64> {
        self.applied.read().await.get(paxos_id).copied()
    }

    pub fn dispatch(&self, decision: Decision) {
        let worker = self.worker_for(&decision.paxos_id);
        self.send(worker, WorkItem::Apply(decision));
    }

    /// Queues a state restore behind every decision already queued for the instance.
    pub fn dispatch_restore(&self, paxos_id: PaxosId, state: Bytes) {
        let worker = self.worker_for(&paxos_id);
        self.send(worker, WorkItem::Restore { paxos_id, state });
    }

    fn send(&self, worker: usize, item: WorkItem) {
        if self.workers[worker].send(item).is_err() {
            tracing::error!("Decision worker {} of node {} has shut down", worker, self.node_id);
        }
    }

    fn worker_for(&self, paxos_id: &PaxosId) -> usize {
        let mut hasher = DefaultHasher::new();
        paxos_id.hash(&mut hasher);
        (hasher.finish() % self.workers.len() as u64) as usize
    }

    async fn process_decisions(
        node_id: NodeId,
        worker: usize,
        mut receiver: mpsc::UnboundedReceiver<WorkItem>,
        handler: Arc<dyn DecisionHandler>,
        applied: AppliedSlots,
    ) {
        while let Some(item) = receiver.recv().await {
            match item {
                WorkItem::Apply(decision) => {
                    let paxos_id = decision.paxos_id.clone();
                    let slot = decision.slot;
                    if let Err(e) = handler.on_decision(decision).await {
                        tracing::error!(
                            "Node {} worker {} failed to apply decision {}#{}: {}",
                            node_id, worker, paxos_id, slot, e
                        );
                    }
                    applied.write().await.insert(paxos_id, slot);
                }
                WorkItem::Restore { paxos_id, state } => {
                    if let Err(e) = handler.restore(&paxos_id, state).await {
                        tracing::error!("Node {} failed to restore {}: {}", node_id, paxos_id, e);
                    }
                    applied.write().await.remove(&paxos_id);
                }
            }
        }
        tracing::debug!("Decision worker {} of node {} stopped", worker, node_id);
    }
}
