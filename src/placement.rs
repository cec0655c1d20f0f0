use consensus::NodeId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{NameStoreError, Result};

/// Hash ring assigning each name its replica controllers.
///
/// Every node owns one point on the ring. A name's controllers are the first
/// `replicas` distinct owners found walking clockwise from the name's own
/// point, wrapping around at the end of the ring.
#[derive(Debug, Clone)]
pub struct ConsistentHashing {
    ring: BTreeMap<u64, NodeId>,
    replicas: usize,
}

fn ring_position(key: &[u8]) -> u64 {
    let digest = Sha256::digest(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl ConsistentHashing {
    pub fn new<I>(nodes: I, replicas: usize) -> Result<Self>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut ring = BTreeMap::new();
        for node in nodes {
            let position = ring_position(format!("node-{}", node.0).as_bytes());
            if let Some(existing) = ring.insert(position, node) {
                if existing != node {
                    return Err(NameStoreError::InvalidConfig(format!(
                        "nodes {} and {} collide on the hash ring",
                        existing, node
                    )));
                }
            }
        }

        if replicas == 0 {
            return Err(NameStoreError::InvalidConfig(
                "controllers per name must be at least 1".to_string(),
            ));
        }
        if replicas > ring.len() {
            return Err(NameStoreError::InvalidConfig(format!(
                "{} controllers per name but only {} nodes",
                replicas,
                ring.len()
            )));
        }

        Ok(Self { ring, replicas })
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.ring.values().copied().collect()
    }

    /// Controllers of `name` in ring order, primary first.
    pub fn controllers_in_ring_order(&self, name: &str) -> Vec<NodeId> {
        let start = ring_position(name.as_bytes());
        let mut controllers = Vec::with_capacity(self.replicas);
        for (_, node) in self.ring.range(start..).chain(self.ring.range(..start)) {
            if !controllers.contains(node) {
                controllers.push(*node);
            }
            if controllers.len() == self.replicas {
                break;
            }
        }
        controllers
    }

    pub fn controllers_for(&self, name: &str) -> BTreeSet<NodeId> {
        self.controllers_in_ring_order(name).into_iter().collect()
    }

    pub fn is_controller(&self, name: &str, node: NodeId) -> bool {
        self.controllers_in_ring_order(name).contains(&node)
    }
}

fn name_seed(name: &str) -> u64 {
    ring_position(name.as_bytes())
}

/// The node that drives work for `name` among `nodes`: the first live node
/// in a shuffle of the sorted set seeded by the name.
pub fn driver_for<F>(name: &str, nodes: &BTreeSet<NodeId>, is_up: F) -> Option<NodeId>
where
    F: Fn(NodeId) -> bool,
{
    let mut order: Vec<NodeId> = nodes.iter().copied().collect();
    let mut rng = StdRng::seed_from_u64(name_seed(name));
    order.shuffle(&mut rng);
    order.into_iter().find(|node| is_up(*node))
}

pub fn is_smallest_node_running<F>(name: &str, nodes: &BTreeSet<NodeId>, me: NodeId, is_up: F) -> bool
where
    F: Fn(NodeId) -> bool,
{
    driver_for(name, nodes, is_up) == Some(me)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring(count: u32, replicas: usize) -> ConsistentHashing {
        ConsistentHashing::new((1..=count).map(NodeId), replicas).unwrap()
    }

    #[test]
    fn rejects_more_controllers_than_nodes() {
        assert!(matches!(
            ConsistentHashing::new((1..=2).map(NodeId), 3),
            Err(NameStoreError::InvalidConfig(_))
        ));
        assert!(ConsistentHashing::new((1..=3).map(NodeId), 0).is_err());
    }

    #[test]
    fn every_name_gets_k_distinct_controllers() {
        let placement = ring(5, 3);
        for name in ["alice", "bob", "carol", "", "a-very-long-name-0123456789"] {
            let controllers = placement.controllers_in_ring_order(name);
            assert_eq!(controllers.len(), 3);
            assert_eq!(placement.controllers_for(name).len(), 3);
        }
        assert_eq!(ring(3, 3).controllers_for("x"), (1..=3).map(NodeId).collect());
    }

    #[test]
    fn driver_skips_nodes_that_are_down() {
        let nodes: BTreeSet<NodeId> = (1..=3).map(NodeId).collect();
        let first = driver_for("alice", &nodes, |_| true).unwrap();
        let second = driver_for("alice", &nodes, |node| node != first).unwrap();
        assert_ne!(first, second);
        assert!(is_smallest_node_running("alice", &nodes, first, |_| true));
        assert!(!is_smallest_node_running("alice", &nodes, first, |node| node != first));
        assert_eq!(driver_for("alice", &nodes, |_| false), None);
    }

    proptest! {
        #[test]
        fn placement_is_deterministic(name in ".{0,40}", count in 3u32..12) {
            let a = ring(count, 3);
            let b = ConsistentHashing::new((1..=count).rev().map(NodeId), 3).unwrap();
            prop_assert_eq!(a.controllers_in_ring_order(&name), b.controllers_in_ring_order(&name));
        }

        #[test]
        fn driver_choice_is_deterministic(name in "[a-z]{1,16}", count in 1u32..8) {
            let nodes: BTreeSet<NodeId> = (1..=count).map(NodeId).collect();
            let driver = driver_for(&name, &nodes, |_| true);
            prop_assert!(driver.is_some());
            prop_assert_eq!(driver, driver_for(&name, &nodes, |_| true));
        }
    }
}
