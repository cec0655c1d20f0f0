use bytes::Bytes;
use consensus::{NodeId, PaxosId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::values::{UpdateOperation, ValuesMap};
use crate::{Result, StorageError};

/// Correlates a controller record with the add request that created it.
///
/// Among concurrent adds of one name, the smallest key wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddRequestKey {
    pub origin: NodeId,
    pub request_id: u64,
}

/// Metadata for one name, replicated across its replica controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaControllerRecord {
    pub name: String,
    pub controllers: BTreeSet<NodeId>,
    pub active_servers: BTreeSet<NodeId>,
    pub old_active_servers: BTreeSet<NodeId>,
    pub active_paxos_id: Option<PaxosId>,
    pub old_active_paxos_id: Option<PaxosId>,
    pub active_version: u64,
    pub active_running: bool,
    pub added: bool,
    pub marked_for_removal: bool,
    pub add_request: Option<AddRequestKey>,
}

impl ReplicaControllerRecord {
    /// A fresh record whose first active set is the controller set itself.
    pub fn new(name: impl Into<String>, controllers: BTreeSet<NodeId>, add_request: Option<AddRequestKey>) -> Self {
        let name = name.into();
        Self {
            active_paxos_id: Some(PaxosId::active(&name, 1)),
            old_active_paxos_id: Some(PaxosId::active(&name, 0)),
            active_servers: controllers.clone(),
            old_active_servers: controllers.clone(),
            controllers,
            active_version: 1,
            active_running: true,
            added: false,
            marked_for_removal: false,
            add_request,
            name,
        }
    }

    pub fn controller_paxos_id(&self) -> PaxosId {
        PaxosId::controller(&self.name)
    }

    pub fn is_controller(&self, node: NodeId) -> bool {
        self.controllers.contains(&node)
    }

    /// Instance ID for the next active set, strictly newer than any used so far.
    pub fn next_active_paxos_id(&self) -> PaxosId {
        PaxosId::active(&self.name, self.active_version + 1)
    }

    /// Moves the current active set to the old slot and installs `new_actives`.
    ///
    /// Refused unless `new_paxos_id` carries a version above the current one.
    pub fn update_active_name_servers(&mut self, new_actives: BTreeSet<NodeId>, new_paxos_id: PaxosId) -> bool {
        let version = match new_paxos_id.version() {
            Some(version) if version > self.active_version => version,
            _ => return false,
        };

        self.active_running = false;
        self.old_active_servers = std::mem::replace(&mut self.active_servers, new_actives);
        self.old_active_paxos_id = self.active_paxos_id.replace(new_paxos_id);
        self.active_version = version;
        true
    }

    /// Marks the new actives as running if `paxos_id` is still the current instance.
    pub fn set_new_active_running(&mut self, paxos_id: &PaxosId) -> bool {
        if self.active_paxos_id.as_ref() == Some(paxos_id) {
            self.active_running = true;
            true
        } else {
            false
        }
    }

    pub fn mark_for_removal(&mut self) -> bool {
        if self.marked_for_removal {
            return false;
        }
        self.marked_for_removal = true;
        true
    }

    pub fn to_snapshot(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_snapshot(state: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(state)?)
    }
}

/// Where a paxos ID stands relative to an active record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaxosStatus {
    Current,
    Old,
    Unknown,
}

/// Field data for one name, replicated across its active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRecord {
    pub name: String,
    pub values_map: ValuesMap,
    pub old_values_map: ValuesMap,
    pub active_name_servers: BTreeSet<NodeId>,
    pub active_paxos_id: Option<PaxosId>,
    pub old_active_paxos_id: Option<PaxosId>,
    pub total_lookup_requests: u64,
    pub total_update_requests: u64,
}

impl ActiveRecord {
    pub fn new(
        name: impl Into<String>,
        active_name_servers: BTreeSet<NodeId>,
        active_paxos_id: PaxosId,
        values_map: ValuesMap,
    ) -> Self {
        Self {
            name: name.into(),
            values_map,
            old_values_map: ValuesMap::new(),
            active_name_servers,
            active_paxos_id: Some(active_paxos_id),
            old_active_paxos_id: None,
            total_lookup_requests: 0,
            total_update_requests: 0,
        }
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.active_paxos_id.is_some() && self.active_name_servers.contains(&node)
    }

    pub fn paxos_status(&self, paxos_id: &PaxosId) -> PaxosStatus {
        if self.active_paxos_id.as_ref() == Some(paxos_id) {
            PaxosStatus::Current
        } else if self.old_active_paxos_id.as_ref() == Some(paxos_id) {
            PaxosStatus::Old
        } else {
            PaxosStatus::Unknown
        }
    }

    /// Final values of a retired instance, if `paxos_id` is the one this record retired last.
    pub fn old_values_on_paxos_id_match(&self, paxos_id: &PaxosId) -> Option<&ValuesMap> {
        if self.old_active_paxos_id.as_ref() == Some(paxos_id) {
            Some(&self.old_values_map)
        } else {
            None
        }
    }

    /// Archives the current values after the STOP of `paxos_id` commits.
    pub fn handle_current_active_stop(&mut self, paxos_id: &PaxosId) -> bool {
        if self.active_paxos_id.as_ref() != Some(paxos_id) {
            return false;
        }
        self.old_values_map = std::mem::take(&mut self.values_map);
        self.old_active_paxos_id = self.active_paxos_id.take();
        self.active_name_servers.clear();
        true
    }

    /// Archives `values` as the final state of `paxos_id` when a start overtakes
    /// this replica's local stop of that instance.
    pub fn archive_final_values(&mut self, paxos_id: &PaxosId, values: &ValuesMap) -> bool {
        if self.active_paxos_id.as_ref() != Some(paxos_id) {
            return false;
        }
        self.old_values_map = values.clone();
        self.old_active_paxos_id = Some(paxos_id.clone());
        true
    }

    pub fn handle_new_active_start(&mut self, actives: BTreeSet<NodeId>, paxos_id: PaxosId, values: ValuesMap) {
        self.active_name_servers = actives;
        self.active_paxos_id = Some(paxos_id);
        self.values_map = values;
    }

    /// Takes the instance state of `snapshot` while keeping this replica's
    /// archive of the instance it retired, unless the snapshot retired a newer one.
    pub fn restore_instance_state(&mut self, snapshot: ActiveRecord) {
        let local_retired = self.old_active_paxos_id.as_ref().and_then(PaxosId::version);
        let snapshot_retired = snapshot.old_active_paxos_id.as_ref().and_then(PaxosId::version);
        if snapshot_retired > local_retired {
            self.old_values_map = snapshot.old_values_map;
            self.old_active_paxos_id = snapshot.old_active_paxos_id;
        }
        self.values_map = snapshot.values_map;
        self.active_name_servers = snapshot.active_name_servers;
        self.active_paxos_id = snapshot.active_paxos_id;
        self.total_lookup_requests = snapshot.total_lookup_requests;
        self.total_update_requests = snapshot.total_update_requests;
    }

    pub fn update_field(
        &mut self,
        field: &str,
        operation: UpdateOperation,
        new_values: &[String],
        old_values: Option<&[String]>,
        argument: usize,
    ) -> bool {
        self.increment_updates();
        operation.apply(&mut self.values_map, field, new_values, old_values, argument)
    }

    pub fn lookup(&mut self, field: &str) -> Option<Vec<String>> {
        self.increment_lookups();
        self.values_map.get(field).cloned()
    }

    pub fn increment_lookups(&mut self) {
        self.total_lookup_requests += 1;
    }

    pub fn increment_updates(&mut self) {
        self.total_update_requests += 1;
    }

    pub fn to_snapshot(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_snapshot(state: &[u8]) -> Result<Self> {
        serde_json::from_slice(state).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}
