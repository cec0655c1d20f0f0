use crate::config::Config;
use crate::error::{NameStoreError, Result};
use crate::node::Node;
use crate::reconfig::{KeepCurrentActives, ReplicaSelectionPolicy};
use consensus::{NodeId, PaxosCluster};
use network::LocalNetwork;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

const BASE_PORT: u16 = 24400;

/// An in-process cluster of name servers sharing one network and one
/// consensus substrate.
pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    paxos: Arc<PaxosCluster>,
    nodes: BTreeMap<NodeId, Node>,
    handles: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    pub async fn start(count: u32) -> Result<Self> {
        Self::start_with(count, Arc::new(KeepCurrentActives), |config| config).await
    }

    /// Starts `count` nodes, letting `configure` adjust each node's config first.
    pub async fn start_with<F>(count: u32, policy: Arc<dyn ReplicaSelectionPolicy>, configure: F) -> Result<Self>
    where
        F: Fn(Config) -> Config,
    {
        if count == 0 {
            return Err(NameStoreError::InvalidConfig("a cluster needs at least one node".to_string()));
        }

        let network = LocalNetwork::new();
        let paxos = PaxosCluster::new();
        let mut nodes = BTreeMap::new();
        for config in Config::local_cluster(count, BASE_PORT) {
            let config = configure(config);
            let node = Node::new(config, network.clone(), paxos.clone(), policy.clone()).await?;
            nodes.insert(node.node_id(), node);
        }

        let handles = nodes
            .values()
            .cloned()
            .map(|node| {
                tokio::spawn(async move {
                    if let Err(e) = node.start().await {
                        error!("Name server {} exited: {}", node.node_id(), e);
                    }
                })
            })
            .collect();

        info!("Local cluster of {} name servers running", count);
        Ok(Self {
            network,
            paxos,
            nodes,
            handles,
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn controllers_for(&self, name: &str) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .next()
            .map(|node| node.context().placement.controllers_for(name))
            .unwrap_or_default()
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn paxos(&self) -> &Arc<PaxosCluster> {
        &self.paxos
    }

    /// Cuts `node` off the network without telling the failure detector.
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        self.network.set_reachable(node, reachable);
    }

    /// Crashes or revives `node` as seen by the failure detector.
    pub fn set_node_up(&self, node: NodeId, up: bool) {
        self.paxos.set_node_up(node, up);
    }

    /// Polls `check` every 10ms until it holds or `timeout` passes.
    pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
