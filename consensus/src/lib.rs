mod dispatcher;
mod manager;
mod messages;

pub use dispatcher::DecisionDispatcher;
pub use manager::{PaxosCluster, PaxosManager};
pub use messages::{Decision, InstanceStatus};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns{}", self.0)
    }
}

const CONTROLLER_SUFFIX: &str = "-P";

/// Identifier of one consensus instance.
///
/// Controller groups use `<name>-P`, active groups use `<name>-<version>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaxosId(String);

impl PaxosId {
    pub fn controller(name: &str) -> Self {
        Self(format!("{}{}", name, CONTROLLER_SUFFIX))
    }

    pub fn active(name: &str, version: u64) -> Self {
        Self(format!("{}-{}", name, version))
    }

    pub fn is_controller(&self) -> bool {
        self.0.ends_with(CONTROLLER_SUFFIX)
    }

    /// Name the instance belongs to.
    pub fn name(&self) -> &str {
        match self.0.rfind('-') {
            Some(index) => &self.0[..index],
            None => &self.0,
        }
    }

    /// Active-set version, `None` for controller instances.
    pub fn version(&self) -> Option<u64> {
        if self.is_controller() {
            return None;
        }
        self.0.rfind('-').and_then(|index| self.0[index + 1..].parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaxosId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordering service consumed by the name server.
///
/// Completion of a proposal is observed only through
/// [`DecisionHandler::on_decision`] on every live member.
#[async_trait]
pub trait PaxosSubstrate: Send + Sync {
    async fn propose(&self, paxos_id: &PaxosId, entry: Bytes) -> Result<()>;

    /// Proposes the final entry of an instance; nothing is accepted after it commits.
    async fn propose_stop(&self, paxos_id: &PaxosId, entry: Bytes) -> Result<()>;

    /// Returns `false` when the instance already existed.
    async fn create_instance(
        &self,
        paxos_id: &PaxosId,
        members: BTreeSet<NodeId>,
        initial_state: Bytes,
    ) -> Result<bool>;

    /// Forgets an instance and its log. Returns `false` when it did not exist.
    async fn delete_instance(&self, paxos_id: &PaxosId) -> Result<bool>;

    async fn is_stopped(&self, paxos_id: &PaxosId) -> bool;

    async fn get_snapshot(&self, paxos_id: &PaxosId) -> Result<Option<Bytes>>;

    async fn restore_snapshot(&self, paxos_id: &PaxosId, state: Bytes) -> Result<()>;

    fn is_node_up(&self, node: NodeId) -> bool;
}

/// Callback side of the substrate: applies decided entries to local state.
#[async_trait]
pub trait DecisionHandler: Send + Sync {
    async fn on_decision(&self, decision: Decision) -> Result<()>;

    async fn snapshot(&self, paxos_id: &PaxosId) -> Result<Option<Bytes>>;

    async fn restore(&self, paxos_id: &PaxosId, state: Bytes) -> Result<()>;
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Unknown paxos instance: {0}")]
    UnknownInstance(PaxosId),

    #[error("Paxos instance stopped: {0}")]
    InstanceStopped(PaxosId),

    #[error("Node not registered with consensus: {0}")]
    NodeNotRegistered(NodeId),

    #[error("Node {node} is not a member of {paxos_id}")]
    NotMember { node: NodeId, paxos_id: PaxosId },

    #[error("Node is down: {0}")]
    NodeDown(NodeId),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for ConsensusError {
    fn from(err: bincode::Error) -> Self {
        ConsensusError::Codec(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    pub decision_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paxos_id_formats() {
        let controller = PaxosId::controller("alice");
        assert_eq!(controller.as_str(), "alice-P");
        assert!(controller.is_controller());
        assert_eq!(controller.name(), "alice");
        assert_eq!(controller.version(), None);

        let active = PaxosId::active("bob-smith", 7);
        assert_eq!(active.as_str(), "bob-smith-7");
        assert!(!active.is_controller());
        assert_eq!(active.name(), "bob-smith");
        assert_eq!(active.version(), Some(7));
    }
}
