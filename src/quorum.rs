use consensus::NodeId;
use network::NewActiveSetStart;
use std::collections::{BTreeSet, HashSet};

/// Majority-acknowledgment counter for one in-flight request.
///
/// Only members count, and each member counts once. An empty member set is
/// treated as already having a majority.
#[derive(Debug, Clone)]
pub struct QuorumTracker {
    members: BTreeSet<NodeId>,
    acked: HashSet<NodeId>,
    rejected: HashSet<NodeId>,
}

impl QuorumTracker {
    pub fn new(members: BTreeSet<NodeId>) -> Self {
        Self {
            members,
            acked: HashSet::new(),
            rejected: HashSet::new(),
        }
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Returns whether the acknowledgment was new.
    pub fn ack(&mut self, node: NodeId) -> bool {
        if !self.members.contains(&node) || self.rejected.contains(&node) {
            return false;
        }
        self.acked.insert(node)
    }

    pub fn reject(&mut self, node: NodeId) -> bool {
        if !self.members.contains(&node) || self.acked.contains(&node) {
            return false;
        }
        self.rejected.insert(node)
    }

    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    pub fn have_majority_responded(&self) -> bool {
        self.members.is_empty() || self.acked.len() * 2 > self.members.len()
    }

    /// True once enough members refused that a majority can no longer be reached.
    pub fn majority_impossible(&self) -> bool {
        if self.members.is_empty() {
            return false;
        }
        (self.members.len() - self.rejected.len()) * 2 <= self.members.len()
    }

    pub fn pending(&self) -> BTreeSet<NodeId> {
        self.members
            .iter()
            .filter(|node| !self.acked.contains(node) && !self.rejected.contains(node))
            .copied()
            .collect()
    }
}

/// Start-confirmation state kept by the new active coordinating a migration.
#[derive(Debug, Clone)]
pub struct NewActiveStartInfo {
    pub request: NewActiveSetStart,
    tracker: QuorumTracker,
    sent: bool,
}

impl NewActiveStartInfo {
    pub fn new(request: NewActiveSetStart) -> Self {
        let tracker = QuorumTracker::new(request.new_actives.clone());
        Self {
            request,
            tracker,
            sent: false,
        }
    }

    /// Records a start response. Returns `true` exactly once, when a majority
    /// of the new actives has first been reached.
    pub fn record_response(&mut self, node: NodeId) -> bool {
        self.tracker.ack(node);
        if !self.sent && self.tracker.have_majority_responded() {
            self.sent = true;
            return true;
        }
        false
    }

    pub fn responded(&self) -> usize {
        self.tracker.acked_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus::PaxosId;
    use proptest::prelude::*;

    fn nodes(ids: &[u32]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| NodeId(*id)).collect()
    }

    #[test]
    fn majority_is_strictly_more_than_half() {
        let mut tracker = QuorumTracker::new(nodes(&[1, 2, 3, 4]));
        assert!(tracker.ack(NodeId(1)));
        assert!(!tracker.ack(NodeId(1)));
        assert!(tracker.ack(NodeId(2)));
        assert!(!tracker.have_majority_responded());
        assert!(!tracker.ack(NodeId(9)));
        assert!(tracker.ack(NodeId(3)));
        assert!(tracker.have_majority_responded());
        assert_eq!(tracker.pending(), nodes(&[4]));
    }

    #[test]
    fn empty_member_set_counts_as_majority() {
        let tracker = QuorumTracker::new(BTreeSet::new());
        assert!(tracker.have_majority_responded());
        assert!(!tracker.majority_impossible());
    }

    #[test]
    fn rejections_make_majority_impossible() {
        let mut tracker = QuorumTracker::new(nodes(&[1, 2, 3]));
        tracker.ack(NodeId(1));
        assert!(tracker.reject(NodeId(2)));
        assert!(!tracker.majority_impossible());
        assert!(!tracker.reject(NodeId(1)));
        tracker.reject(NodeId(3));
        assert!(tracker.majority_impossible());
        assert!(!tracker.ack(NodeId(3)));
    }

    #[test]
    fn start_confirmation_latches_once() {
        let mut info = NewActiveStartInfo::new(NewActiveSetStart {
            name: "alice".to_string(),
            controller: NodeId(1),
            coordinator: Some(NodeId(4)),
            old_actives: nodes(&[1, 2, 3]),
            new_actives: nodes(&[4, 5, 6]),
            old_paxos_id: PaxosId::active("alice", 1),
            new_paxos_id: PaxosId::active("alice", 2),
            previous_value: None,
        });

        assert!(!info.record_response(NodeId(4)));
        assert!(!info.record_response(NodeId(4)));
        assert!(info.record_response(NodeId(5)));
        assert!(!info.record_response(NodeId(6)));
        assert_eq!(info.responded(), 3);
    }

    proptest! {
        #[test]
        fn majority_iff_more_than_half_distinct_members(
            size in 1u32..9,
            acks in proptest::collection::vec(0u32..12, 0..30),
        ) {
            let members: BTreeSet<NodeId> = (0..size).map(NodeId).collect();
            let mut tracker = QuorumTracker::new(members.clone());
            for ack in &acks {
                tracker.ack(NodeId(*ack));
            }
            let distinct: HashSet<u32> = acks.iter().copied().filter(|a| *a < size).collect();
            prop_assert_eq!(tracker.have_majority_responded(), distinct.len() * 2 > members.len());
        }
    }
}
