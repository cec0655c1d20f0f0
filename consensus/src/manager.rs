use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::dispatcher::DecisionDispatcher;
use crate::messages::{InstanceStatus, LogEntry};
use crate::{Config, ConsensusError, DecisionHandler, NodeId, PaxosId, PaxosSubstrate, Result};

struct Instance {
    members: BTreeSet<NodeId>,
    base_state: Bytes,
    log: Vec<LogEntry>,
    next_slot: u64,
    stopped: bool,
}

struct RegisteredNode {
    dispatcher: DecisionDispatcher,
    handler: Arc<dyn DecisionHandler>,
}

/// In-process ordering service shared by every node of a cluster.
///
/// Each paxos instance keeps its member set, the state it was created with
/// and the decided log. A proposal is assigned the next slot under the
/// instance lock and fanned out to the dispatcher of every live member, so
/// all members observe the same order.
pub struct PaxosCluster {
    instances: RwLock<HashMap<PaxosId, Arc<Mutex<Instance>>>>,
    nodes: RwLock<HashMap<NodeId, RegisteredNode>>,
    down: StdRwLock<HashSet<NodeId>>,
}

impl PaxosCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            down: StdRwLock::new(HashSet::new()),
        })
    }

    /// Handle for `node_id`. Decisions only reach the node once it is registered.
    pub fn manager(self: &Arc<Self>, node_id: NodeId) -> PaxosManager {
        PaxosManager {
            node_id,
            cluster: self.clone(),
        }
    }

    /// Attaches a node's decision handler and returns its substrate handle.
    pub async fn register(
        self: &Arc<Self>,
        config: Config,
        handler: Arc<dyn DecisionHandler>,
    ) -> PaxosManager {
        let dispatcher = DecisionDispatcher::new(config.node_id, config.decision_workers, handler.clone());
        self.nodes.write().await.insert(config.node_id, RegisteredNode { dispatcher, handler });
        tracing::info!("Registered node {} with paxos cluster", config.node_id);

        self.manager(config.node_id)
    }

    pub fn set_node_up(&self, node: NodeId, up: bool) {
        let mut down = match self.down.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if up {
            down.remove(&node);
        } else {
            down.insert(node);
        }
    }

    pub fn is_node_up(&self, node: NodeId) -> bool {
        match self.down.read() {
            Ok(down) => !down.contains(&node),
            Err(poisoned) => !poisoned.into_inner().contains(&node),
        }
    }

    pub async fn status(&self, paxos_id: &PaxosId) -> Option<InstanceStatus> {
        let instance = self.instances.read().await.get(paxos_id).cloned()?;
        let instance = instance.lock().await;
        Some(InstanceStatus {
            paxos_id: paxos_id.clone(),
            members: instance.members.clone(),
            first_slot: instance.log.first().map(|e| e.slot).unwrap_or(instance.next_slot),
            next_slot: instance.next_slot,
            stopped: instance.stopped,
        })
    }

    async fn instance(&self, paxos_id: &PaxosId) -> Result<Arc<Mutex<Instance>>> {
        self.instances
            .read()
            .await
            .get(paxos_id)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownInstance(paxos_id.clone()))
    }

    async fn append(&self, from: NodeId, paxos_id: &PaxosId, entry: Bytes, stop: bool) -> Result<()> {
        if !self.is_node_up(from) {
            return Err(ConsensusError::NodeDown(from));
        }

        let instance = self.instance(paxos_id).await?;
        let mut instance = instance.lock().await;

        if instance.stopped {
            return Err(ConsensusError::InstanceStopped(paxos_id.clone()));
        }
        if !instance.members.contains(&from) {
            return Err(ConsensusError::NotMember {
                node: from,
                paxos_id: paxos_id.clone(),
            });
        }

        let log_entry = LogEntry {
            slot: instance.next_slot,
            entry,
            stop,
        };
        instance.next_slot += 1;
        instance.stopped = stop;

        let decision = log_entry.to_decision(paxos_id);
        instance.log.push(log_entry);

        // Fan out while the instance lock is held so concurrent proposers
        // cannot reorder deliveries.
        let nodes = self.nodes.read().await;
        for member in instance.members.iter() {
            if !self.is_node_up(*member) {
                tracing::debug!("Skipping decision {}#{} for down node {}", paxos_id, decision.slot, member);
                continue;
            }
            match nodes.get(member) {
                Some(node) => node.dispatcher.dispatch(decision.clone()),
                None => tracing::warn!("Member {} of {} is not registered", member, paxos_id),
            }
        }

        tracing::trace!("Committed {}#{} (stop = {})", paxos_id, decision.slot, stop);
        Ok(())
    }

    async fn handler(&self, node: NodeId) -> Result<Arc<dyn DecisionHandler>> {
        self.nodes
            .read()
            .await
            .get(&node)
            .map(|n| n.handler.clone())
            .ok_or(ConsensusError::NodeNotRegistered(node))
    }

    /// Rebuilds one node's copy of an instance: restores the base state and
    /// re-delivers the decided log through that node's dispatcher. Both go
    /// through the instance's worker, after anything already queued there.
    async fn replay(&self, node: NodeId, paxos_id: &PaxosId) -> Result<usize> {
        let instance = self.instance(paxos_id).await?;
        let instance = instance.lock().await;

        let nodes = self.nodes.read().await;
        let registered = nodes.get(&node).ok_or(ConsensusError::NodeNotRegistered(node))?;
        registered
            .dispatcher
            .dispatch_restore(paxos_id.clone(), instance.base_state.clone());
        for entry in instance.log.iter() {
            registered.dispatcher.dispatch(entry.to_decision(paxos_id));
        }

        Ok(instance.log.len())
    }

    /// Replaces an instance's base state with `node`'s snapshot and drops the
    /// log prefix it covers. Waits, holding the instance, until `node` has
    /// applied every committed slot.
    async fn checkpoint(&self, node: NodeId, paxos_id: &PaxosId) -> Result<usize> {
        const MAX_WAITS: usize = 200;

        let instance = self.instance(paxos_id).await?;
        let mut instance = instance.lock().await;
        let last_slot = match instance.log.last() {
            Some(entry) => entry.slot,
            None => return Ok(0),
        };

        let handler = self.handler(node).await?;
        let mut waits = 0;
        loop {
            let applied = {
                let nodes = self.nodes.read().await;
                let registered = nodes.get(&node).ok_or(ConsensusError::NodeNotRegistered(node))?;
                registered.dispatcher.applied_slot(paxos_id).await
            };
            if applied.map_or(false, |slot| slot >= last_slot) {
                break;
            }
            waits += 1;
            if waits > MAX_WAITS {
                return Err(ConsensusError::InvalidEntry(format!(
                    "{} has not applied {}#{}", node, paxos_id, last_slot
                )));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let state = handler
            .snapshot(paxos_id)
            .await?
            .ok_or_else(|| ConsensusError::UnknownInstance(paxos_id.clone()))?;
        let truncated = instance.log.len();
        instance.base_state = state;
        instance.log.clear();
        Ok(truncated)
    }
}

/// One node's handle on the [`PaxosCluster`].
#[derive(Clone)]
pub struct PaxosManager {
    node_id: NodeId,
    cluster: Arc<PaxosCluster>,
}

impl PaxosManager {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cluster(&self) -> &Arc<PaxosCluster> {
        &self.cluster
    }

    pub async fn status(&self, paxos_id: &PaxosId) -> Option<InstanceStatus> {
        self.cluster.status(paxos_id).await
    }

    /// Replays an instance into this node after it missed decisions while down.
    pub async fn recover(&self, paxos_id: &PaxosId) -> Result<usize> {
        let replayed = self.cluster.replay(self.node_id, paxos_id).await?;
        tracing::info!("Node {} replayed {} decisions of {}", self.node_id, replayed, paxos_id);
        Ok(replayed)
    }

    /// Compacts an instance's log into this node's current snapshot.
    pub async fn checkpoint(&self, paxos_id: &PaxosId) -> Result<usize> {
        let truncated = self.cluster.checkpoint(self.node_id, paxos_id).await?;
        tracing::debug!("Node {} checkpointed {} ({} entries truncated)", self.node_id, paxos_id, truncated);
        Ok(truncated)
    }
}

#[async_trait]
impl PaxosSubstrate for PaxosManager {
    async fn propose(&self, paxos_id: &PaxosId, entry: Bytes) -> Result<()> {
        self.cluster.append(self.node_id, paxos_id, entry, false).await
    }

    async fn propose_stop(&self, paxos_id: &PaxosId, entry: Bytes) -> Result<()> {
        self.cluster.append(self.node_id, paxos_id, entry, true).await
    }

    async fn create_instance(
        &self,
        paxos_id: &PaxosId,
        members: BTreeSet<NodeId>,
        initial_state: Bytes,
    ) -> Result<bool> {
        let mut instances = self.cluster.instances.write().await;
        if instances.contains_key(paxos_id) {
            tracing::trace!("Paxos instance {} already exists", paxos_id);
            return Ok(false);
        }

        tracing::info!("Node {} created paxos instance {} with members {:?}", self.node_id, paxos_id, members);
        instances.insert(
            paxos_id.clone(),
            Arc::new(Mutex::new(Instance {
                members,
                base_state: initial_state,
                log: Vec::new(),
                next_slot: 0,
                stopped: false,
            })),
        );
        Ok(true)
    }

    async fn delete_instance(&self, paxos_id: &PaxosId) -> Result<bool> {
        let removed = self.cluster.instances.write().await.remove(paxos_id).is_some();
        if removed {
            tracing::info!("Node {} deleted paxos instance {}", self.node_id, paxos_id);
        }
        Ok(removed)
    }

    async fn is_stopped(&self, paxos_id: &PaxosId) -> bool {
        match self.cluster.instance(paxos_id).await {
            Ok(instance) => instance.lock().await.stopped,
            Err(_) => false,
        }
    }

    async fn get_snapshot(&self, paxos_id: &PaxosId) -> Result<Option<Bytes>> {
        self.cluster.handler(self.node_id).await?.snapshot(paxos_id).await
    }

    async fn restore_snapshot(&self, paxos_id: &PaxosId, state: Bytes) -> Result<()> {
        self.cluster.handler(self.node_id).await?.restore(paxos_id, state).await
    }

    fn is_node_up(&self, node: NodeId) -> bool {
        self.cluster.is_node_up(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Decision;

    #[derive(Default)]
    struct RecordingHandler {
        applied: Mutex<Vec<(PaxosId, u64, Bytes)>>,
        restored: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl DecisionHandler for RecordingHandler {
        async fn on_decision(&self, decision: Decision) -> Result<()> {
            self.applied.lock().await.push((decision.paxos_id, decision.slot, decision.entry));
            Ok(())
        }

        async fn snapshot(&self, _paxos_id: &PaxosId) -> Result<Option<Bytes>> {
            Ok(Some(Bytes::from_static(b"state")))
        }

        async fn restore(&self, _paxos_id: &PaxosId, state: Bytes) -> Result<()> {
            self.restored.lock().await.push(state);
            self.applied.lock().await.clear();
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    async fn two_nodes() -> (Arc<PaxosCluster>, PaxosManager, Arc<RecordingHandler>, PaxosManager, Arc<RecordingHandler>) {
        let cluster = PaxosCluster::new();
        let h1 = Arc::new(RecordingHandler::default());
        let h2 = Arc::new(RecordingHandler::default());
        let m1 = cluster.register(Config { node_id: NodeId(1), decision_workers: 2 }, h1.clone()).await;
        let m2 = cluster.register(Config { node_id: NodeId(2), decision_workers: 2 }, h2.clone()).await;
        (cluster, m1, h1, m2, h2)
    }

    #[tokio::test]
    async fn decisions_reach_every_member_in_order() {
        let (_cluster, m1, h1, m2, h2) = two_nodes().await;
        let id = PaxosId::active("alice", 1);
        let members: BTreeSet<NodeId> = [NodeId(1), NodeId(2)].into_iter().collect();

        assert!(m1.create_instance(&id, members.clone(), Bytes::new()).await.unwrap());
        assert!(!m2.create_instance(&id, members, Bytes::new()).await.unwrap());

        for i in 0..10u8 {
            let proposer = if i % 2 == 0 { &m1 } else { &m2 };
            proposer.propose(&id, Bytes::from(vec![i])).await.unwrap();
        }
        settle().await;

        for handler in [&h1, &h2] {
            let applied = handler.applied.lock().await;
            let slots: Vec<u64> = applied.iter().map(|(_, slot, _)| *slot).collect();
            assert_eq!(slots, (0..10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn stopped_instance_rejects_proposals() {
        let (_cluster, m1, _h1, m2, _h2) = two_nodes().await;
        let id = PaxosId::active("bob", 3);
        let members: BTreeSet<NodeId> = [NodeId(1), NodeId(2)].into_iter().collect();
        m1.create_instance(&id, members, Bytes::new()).await.unwrap();

        m1.propose(&id, Bytes::from_static(b"x")).await.unwrap();
        m2.propose_stop(&id, Bytes::from_static(b"stop")).await.unwrap();

        assert!(m1.is_stopped(&id).await);
        assert!(matches!(
            m1.propose(&id, Bytes::from_static(b"late")).await,
            Err(ConsensusError::InstanceStopped(_))
        ));
    }

    #[tokio::test]
    async fn non_members_and_unknown_instances_are_rejected() {
        let (_cluster, m1, _h1, m2, _h2) = two_nodes().await;
        let id = PaxosId::controller("carol");
        m1.create_instance(&id, [NodeId(1)].into_iter().collect(), Bytes::new()).await.unwrap();

        assert!(matches!(
            m2.propose(&id, Bytes::new()).await,
            Err(ConsensusError::NotMember { .. })
        ));
        assert!(matches!(
            m1.propose(&PaxosId::controller("nobody"), Bytes::new()).await,
            Err(ConsensusError::UnknownInstance(_))
        ));

        assert!(m2.delete_instance(&id).await.unwrap());
        assert!(!m2.delete_instance(&id).await.unwrap());
        assert!(m1.status(&id).await.is_none());
    }

    #[tokio::test]
    async fn down_node_misses_decisions_until_recovered() {
        let (cluster, m1, h1, m2, h2) = two_nodes().await;
        let id = PaxosId::active("dave", 1);
        let members: BTreeSet<NodeId> = [NodeId(1), NodeId(2)].into_iter().collect();
        m1.create_instance(&id, members, Bytes::from_static(b"seed")).await.unwrap();

        cluster.set_node_up(NodeId(2), false);
        assert!(!m1.is_node_up(NodeId(2)));
        m1.propose(&id, Bytes::from_static(b"a")).await.unwrap();
        m1.propose(&id, Bytes::from_static(b"b")).await.unwrap();
        settle().await;
        assert_eq!(h1.applied.lock().await.len(), 2);
        assert!(h2.applied.lock().await.is_empty());

        cluster.set_node_up(NodeId(2), true);
        assert_eq!(m2.recover(&id).await.unwrap(), 2);
        settle().await;
        assert_eq!(h2.restored.lock().await.as_slice(), &[Bytes::from_static(b"seed")]);
        assert_eq!(h2.applied.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_truncates_log_into_snapshot() {
        let (_cluster, m1, _h1, m2, h2) = two_nodes().await;
        let id = PaxosId::active("erin", 1);
        let members: BTreeSet<NodeId> = [NodeId(1), NodeId(2)].into_iter().collect();
        m1.create_instance(&id, members, Bytes::from_static(b"seed")).await.unwrap();

        for i in 0..3u8 {
            m1.propose(&id, Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(m1.checkpoint(&id).await.unwrap(), 3);

        let status = m1.status(&id).await.unwrap();
        assert_eq!(status.first_slot, 3);
        assert_eq!(status.next_slot, 3);

        assert_eq!(m2.recover(&id).await.unwrap(), 0);
        settle().await;
        assert_eq!(h2.restored.lock().await.as_slice(), &[Bytes::from_static(b"state")]);
    }
}
