use consensus::{NodeId, PaxosId};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NameStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Name already exists: {0}")]
    DuplicateName(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Stale paxos instance: {0}")]
    StaleInstance(PaxosId),

    #[error("Timed out waiting for quorum on {0}")]
    QuorumTimeout(String),

    #[error("Compare failed on {0}")]
    CompareFailed(String),

    #[error("Node does not serve {name}; active replicas are {actives:?}")]
    NotResponsible { name: String, actives: BTreeSet<NodeId> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NameStoreError {
    /// Only quorum timeouts are worth retrying with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NameStoreError::QuorumTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, NameStoreError>;

impl From<NameStoreError> for consensus::ConsensusError {
    fn from(err: NameStoreError) -> Self {
        match err {
            NameStoreError::Consensus(inner) => inner,
            other => consensus::ConsensusError::InvalidEntry(other.to_string()),
        }
    }
}
