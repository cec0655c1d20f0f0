use consensus::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

use crate::{NameServerMessage, NetworkError, Result};

pub type Envelope = (NodeId, NameServerMessage);

#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub delivered: u64,
    pub dropped: u64,
}

/// In-process message fabric shared by every node of a local cluster.
///
/// Messages to or from an unreachable node are dropped silently, the way a
/// partitioned datagram would be. Sending to a node that never registered
/// is an error.
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    unreachable: RwLock<HashSet<NodeId>>,
    stats: RwLock<TransportStats>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `node` and returns its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if write(&self.inboxes).insert(node, tx).is_some() {
            tracing::warn!("Node {} re-registered with the local network", node);
        }
        rx
    }

    pub fn registered_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = read(&self.inboxes).keys().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        let mut unreachable = write(&self.unreachable);
        if reachable {
            unreachable.remove(&node);
        } else {
            unreachable.insert(node);
        }
        tracing::info!("Node {} is now {}", node, if reachable { "reachable" } else { "unreachable" });
    }

    pub fn is_reachable(&self, node: NodeId) -> bool {
        !read(&self.unreachable).contains(&node)
    }

    pub fn stats(&self) -> TransportStats {
        read(&self.stats).clone()
    }

    pub(crate) fn deliver(&self, from: NodeId, to: NodeId, message: NameServerMessage) -> Result<()> {
        let sender = read(&self.inboxes)
            .get(&to)
            .cloned()
            .ok_or_else(|| NetworkError::ConnectionFailed(format!("No route to node {}", to)))?;

        if !self.is_reachable(from) || !self.is_reachable(to) {
            tracing::trace!("Dropping {} for {} from {} to {}", message.kind(), message.name(), from, to);
            write(&self.stats).dropped += 1;
            return Ok(());
        }

        sender
            .send((from, message))
            .map_err(|_| NetworkError::NodeUnreachable(to))?;
        write(&self.stats).delivered += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OldActiveSetStop;
    use consensus::PaxosId;

    fn stop(name: &str) -> NameServerMessage {
        NameServerMessage::OldActiveSetStop(OldActiveSetStop {
            name: name.to_string(),
            paxos_id: PaxosId::active(name, 1),
            controller: NodeId(1),
            receiver: NodeId(2),
        })
    }

    #[tokio::test]
    async fn delivers_between_registered_nodes() {
        let network = LocalNetwork::new();
        let _a = network.register(NodeId(1));
        let mut b = network.register(NodeId(2));

        network.deliver(NodeId(1), NodeId(2), stop("alice")).unwrap();
        let (from, message) = b.recv().await.unwrap();
        assert_eq!(from, NodeId(1));
        assert_eq!(message.name(), "alice");
        assert!(matches!(
            network.deliver(NodeId(1), NodeId(9), stop("alice")),
            Err(NetworkError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_nodes_lose_messages() {
        let network = LocalNetwork::new();
        let _a = network.register(NodeId(1));
        let mut b = network.register(NodeId(2));

        network.set_reachable(NodeId(2), false);
        network.deliver(NodeId(1), NodeId(2), stop("alice")).unwrap();
        assert!(b.try_recv().is_err());
        assert_eq!(network.stats().dropped, 1);

        network.set_reachable(NodeId(2), true);
        network.deliver(NodeId(1), NodeId(2), stop("bob")).unwrap();
        assert_eq!(b.recv().await.unwrap().1.name(), "bob");
    }
}
