pub mod client;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod paxos_interface;
pub mod placement;
pub mod quorum;
pub mod reconfig;
pub mod tasks;

pub use client::FieldUpdate;
pub use cluster::LocalCluster;
pub use config::{Config, PeerConfig};
pub use error::{NameStoreError, Result};
pub use node::Node;
pub use placement::ConsistentHashing;
pub use reconfig::{FixedActives, KeepCurrentActives, ReplicaSelectionPolicy};

// Re-export key types from workspace crates
pub use consensus;
pub use network;
pub use storage;
pub use consensus::{NodeId, PaxosId};
pub use storage::{UpdateOperation, ValuesMap};
