use async_trait::async_trait;
use bytes::Bytes;
use consensus::{ConsensusError, Decision, DecisionHandler, NodeId, PaxosId};
use network::UpdateFieldRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::{ActiveRecord, RecordStore, ReplicaControllerRecord};

use crate::client::ClientRequestCoordinator;
use crate::context::NodeContext;
use crate::error::{NameStoreError, Result};
use crate::reconfig::{ActiveCoordinator, ControllerCoordinator};

/// Entries proposed into name server paxos instances.
///
/// `UpdateField` and `ActiveStop` go to a name's active instance, the rest to
/// its controller instance `<name>-P`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaxosEntry {
    UpdateField {
        request: UpdateFieldRequest,
        proposer: NodeId,
    },
    ActiveStop {
        name: String,
        paxos_id: PaxosId,
        controller: NodeId,
        receiver: NodeId,
    },
    NewActivesProposed {
        name: String,
        actives: BTreeSet<NodeId>,
        paxos_id: PaxosId,
        proposer: NodeId,
    },
    NewActiveSetConfirmed {
        name: String,
        paxos_id: PaxosId,
        proposer: NodeId,
    },
    MarkForRemoval {
        name: String,
        proposer: NodeId,
    },
    RemoveRecord {
        name: String,
        proposer: NodeId,
    },
}

impl PaxosEntry {
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = bincode::serialize(self).map_err(ConsensusError::from)?;
        Ok(Bytes::from(bytes))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes).map_err(ConsensusError::from)?)
    }

    pub fn name(&self) -> &str {
        match self {
            PaxosEntry::UpdateField { request, .. } => &request.name,
            PaxosEntry::ActiveStop { name, .. }
            | PaxosEntry::NewActivesProposed { name, .. }
            | PaxosEntry::NewActiveSetConfirmed { name, .. }
            | PaxosEntry::MarkForRemoval { name, .. }
            | PaxosEntry::RemoveRecord { name, .. } => name,
        }
    }

    fn is_controller_entry(&self) -> bool {
        !matches!(self, PaxosEntry::UpdateField { .. } | PaxosEntry::ActiveStop { .. })
    }
}

/// Applies decided entries to this node's records and serves snapshots.
pub struct PaxosInterface {
    ctx: Arc<NodeContext>,
    client: Arc<ClientRequestCoordinator>,
    controller: Arc<ControllerCoordinator>,
    active: Arc<ActiveCoordinator>,
}

impl PaxosInterface {
    pub fn new(
        ctx: Arc<NodeContext>,
        client: Arc<ClientRequestCoordinator>,
        controller: Arc<ControllerCoordinator>,
        active: Arc<ActiveCoordinator>,
    ) -> Self {
        Self {
            ctx,
            client,
            controller,
            active,
        }
    }

    async fn apply(&self, paxos_id: &PaxosId, entry: PaxosEntry) -> Result<()> {
        if entry.is_controller_entry() != paxos_id.is_controller() || entry.name() != paxos_id.name() {
            return Err(NameStoreError::StaleInstance(paxos_id.clone()));
        }

        match entry {
            PaxosEntry::UpdateField { request, proposer } => {
                self.client.apply_update(paxos_id, request, proposer).await
            }
            PaxosEntry::ActiveStop {
                name,
                paxos_id: stopped,
                controller,
                receiver,
            } => self.active.apply_active_stop(&name, &stopped, controller, receiver).await,
            PaxosEntry::NewActivesProposed {
                name,
                actives,
                paxos_id: new_paxos_id,
                proposer,
            } => {
                self.controller
                    .apply_new_actives_proposed(&name, actives, new_paxos_id, proposer)
                    .await
            }
            PaxosEntry::NewActiveSetConfirmed {
                name,
                paxos_id: confirmed,
                proposer,
            } => self.controller.apply_new_active_confirmed(&name, &confirmed, proposer).await,
            PaxosEntry::MarkForRemoval { name, proposer } => {
                self.controller.apply_mark_for_removal(&name, proposer).await
            }
            PaxosEntry::RemoveRecord { name, proposer } => {
                self.controller.apply_remove_record(&name, proposer).await?;
                self.client.complete_removal(&name).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DecisionHandler for PaxosInterface {
    async fn on_decision(&self, decision: Decision) -> consensus::Result<()> {
        let entry = PaxosEntry::decode(&decision.entry)?;
        tracing::trace!(
            "Node {} applying {}#{} for {}",
            self.ctx.node_id,
            decision.paxos_id,
            decision.slot,
            entry.name()
        );
        Ok(self.apply(&decision.paxos_id, entry).await?)
    }

    async fn snapshot(&self, paxos_id: &PaxosId) -> consensus::Result<Option<Bytes>> {
        let name = paxos_id.name();
        let state = if paxos_id.is_controller() {
            match self.ctx.controller_records.get(name).await.map_err(NameStoreError::from)? {
                Some(record) => Some(record.to_snapshot().map_err(NameStoreError::from)?),
                None => None,
            }
        } else {
            match self.ctx.active_records.get(name).await.map_err(NameStoreError::from)? {
                Some(record) => Some(record.to_snapshot().map_err(NameStoreError::from)?),
                None => None,
            }
        };
        Ok(state)
    }

    async fn restore(&self, paxos_id: &PaxosId, state: Bytes) -> consensus::Result<()> {
        let name = paxos_id.name();
        if state.is_empty() {
            tracing::debug!("Empty snapshot for {}, nothing to restore", paxos_id);
            return Ok(());
        }

        if paxos_id.is_controller() {
            let record = ReplicaControllerRecord::from_snapshot(&state).map_err(NameStoreError::from)?;
            self.ctx.controller_records.put(name, record).await.map_err(NameStoreError::from)?;
        } else {
            let snapshot = ActiveRecord::from_snapshot(&state).map_err(NameStoreError::from)?;
            let seed = snapshot.clone();
            let merged = self
                .ctx
                .active_records
                .update(
                    name,
                    Box::new(move |record: &mut ActiveRecord| {
                        record.restore_instance_state(snapshot);
                        true
                    }),
                )
                .await
                .map_err(NameStoreError::from)?;
            if merged.is_none() {
                self.ctx.active_records.put(name, seed).await.map_err(NameStoreError::from)?;
            }
        }
        tracing::debug!("Node {} restored {} from snapshot", self.ctx.node_id, paxos_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::UpdateOperation;

    #[test]
    fn entries_survive_the_codec() {
        let entry = PaxosEntry::UpdateField {
            request: UpdateFieldRequest {
                request_id: 7,
                origin: NodeId(2),
                name: "alice".to_string(),
                field: "age".to_string(),
                operation: UpdateOperation::Substitute,
                new_values: vec!["31".to_string()],
                old_values: Some(vec!["30".to_string()]),
                argument: 0,
            },
            proposer: NodeId(3),
        };

        match PaxosEntry::decode(&entry.encode().unwrap()).unwrap() {
            PaxosEntry::UpdateField { request, proposer } => {
                assert_eq!(proposer, NodeId(3));
                assert_eq!(request.old_values, Some(vec!["30".to_string()]));
                assert_eq!(request.operation, UpdateOperation::Substitute);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        assert!(PaxosEntry::decode(b"\xff\xff").is_err());
    }

    #[test]
    fn entries_know_their_instance_family() {
        let stop = PaxosEntry::ActiveStop {
            name: "bob".to_string(),
            paxos_id: PaxosId::active("bob", 1),
            controller: NodeId(1),
            receiver: NodeId(2),
        };
        assert!(!stop.is_controller_entry());
        assert_eq!(stop.name(), "bob");

        let remove = PaxosEntry::RemoveRecord {
            name: "bob".to_string(),
            proposer: NodeId(1),
        };
        assert!(remove.is_controller_entry());
    }
}
