//! Active-set migration: the controller side proposes and drives it, the
//! active side stops old instances and starts new ones.

mod active;
mod controller;

pub use active::ActiveCoordinator;
pub use controller::{ControllerCoordinator, GroupChangeProgress};

use consensus::NodeId;
use std::collections::BTreeSet;
use storage::ReplicaControllerRecord;

/// Chooses where a name's values should live.
pub trait ReplicaSelectionPolicy: Send + Sync {
    /// The desired active set for `record` out of `nodes`. An empty set means
    /// no change.
    fn select_actives(&self, record: &ReplicaControllerRecord, nodes: &BTreeSet<NodeId>) -> BTreeSet<NodeId>;
}

/// Leaves every name where it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepCurrentActives;

impl ReplicaSelectionPolicy for KeepCurrentActives {
    fn select_actives(&self, record: &ReplicaControllerRecord, _nodes: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        record.active_servers.clone()
    }
}

/// Places every name on a fixed node set, clipped to the membership.
#[derive(Debug, Clone)]
pub struct FixedActives {
    actives: BTreeSet<NodeId>,
}

impl FixedActives {
    pub fn new(actives: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            actives: actives.into_iter().collect(),
        }
    }
}

impl ReplicaSelectionPolicy for FixedActives {
    fn select_actives(&self, _record: &ReplicaControllerRecord, nodes: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        self.actives.intersection(nodes).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ReplicaControllerRecord {
        ReplicaControllerRecord::new("carol", (1..=3).map(NodeId).collect(), None)
    }

    #[test]
    fn keep_current_returns_the_active_set() {
        let nodes: BTreeSet<NodeId> = (1..=5).map(NodeId).collect();
        assert_eq!(KeepCurrentActives.select_actives(&record(), &nodes), record().active_servers);
    }

    #[test]
    fn fixed_actives_drop_unknown_nodes() {
        let nodes: BTreeSet<NodeId> = (1..=5).map(NodeId).collect();
        let policy = FixedActives::new([NodeId(4), NodeId(5), NodeId(9)]);
        let expected: BTreeSet<NodeId> = [NodeId(4), NodeId(5)].into_iter().collect();
        assert_eq!(policy.select_actives(&record(), &nodes), expected);
    }
}
