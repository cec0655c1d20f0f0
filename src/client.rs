use consensus::{ConsensusError, NodeId, PaxosId, PaxosSubstrate};
use network::{
    AddRecordAbort, AddRecordComplete, AddRecordConfirm, AddRecordRequest, NameServerMessage, RequestId,
    UpdateFieldConfirm, UpdateFieldRequest, UpdateOutcome,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use storage::{
    ActiveRecord, AddRequestKey, RecordStore, ReplicaControllerRecord, StorageError, UpdateOperation, ValuesMap,
};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::context::NodeContext;
use crate::error::{NameStoreError, Result};
use crate::paxos_interface::PaxosEntry;
use crate::quorum::QuorumTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddOutcome {
    Accepted,
    Rejected,
}

struct PendingAdd {
    key: AddRequestKey,
    tracker: QuorumTracker,
    /// Set once some controller holds a concurrent add with a smaller key.
    outranked: bool,
    done: Option<oneshot::Sender<AddOutcome>>,
}

impl PendingAdd {
    fn new(key: AddRequestKey, controllers: BTreeSet<NodeId>, done: oneshot::Sender<AddOutcome>) -> Self {
        let mut tracker = QuorumTracker::new(controllers);
        tracker.ack(key.origin);
        Self {
            key,
            tracker,
            outranked: false,
            done: Some(done),
        }
    }

    fn record_confirm(&mut self, confirm: &AddRecordConfirm) {
        if confirm.accepted {
            self.tracker.ack(confirm.from);
            return;
        }
        match confirm.holder {
            Some(holder) if holder < self.key => self.outranked = true,
            Some(holder) => trace!("{} holds {:?} of {}, asking again later", confirm.from, holder, confirm.name),
            None => {
                self.tracker.reject(confirm.from);
            }
        }
    }

    fn settle(&mut self) {
        let outcome = if self.tracker.have_majority_responded() {
            AddOutcome::Accepted
        } else if self.outranked || self.tracker.majority_impossible() {
            AddOutcome::Rejected
        } else {
            return;
        };
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

/// One single-field update as a client issues it.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub field: String,
    pub operation: UpdateOperation,
    pub new_values: Vec<String>,
    pub old_values: Option<Vec<String>>,
    pub argument: usize,
}

impl FieldUpdate {
    pub fn new(field: impl Into<String>, operation: UpdateOperation, new_values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            operation,
            new_values,
            old_values: None,
            argument: 0,
        }
    }

    pub fn with_old_values(mut self, old_values: Vec<String>) -> Self {
        self.old_values = Some(old_values);
        self
    }

    pub fn with_argument(mut self, argument: usize) -> Self {
        self.argument = argument;
        self
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(NameStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn outcome_to_result(name: &str, outcome: UpdateOutcome) -> Result<()> {
    match outcome {
        UpdateOutcome::Applied => Ok(()),
        UpdateOutcome::CompareFailed => Err(NameStoreError::CompareFailed(name.to_string())),
        UpdateOutcome::InvalidName => Err(NameStoreError::InvalidName(name.to_string())),
        UpdateOutcome::NotActive(actives) => Err(NameStoreError::NotResponsible {
            name: name.to_string(),
            actives,
        }),
    }
}

/// Handles add, update, lookup and remove requests arriving at this node.
pub struct ClientRequestCoordinator {
    ctx: Arc<NodeContext>,
    pending_adds: Mutex<HashMap<AddRequestKey, PendingAdd>>,
    pending_updates: Mutex<HashMap<RequestId, oneshot::Sender<UpdateOutcome>>>,
    pending_removals: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl ClientRequestCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            pending_adds: Mutex::new(HashMap::new()),
            pending_updates: Mutex::new(HashMap::new()),
            pending_removals: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add(&self, name: &str, field: &str, values: Vec<String>) -> Result<()> {
        let request_id = self.ctx.network.next_request_id();
        self.add_with_request(request_id, name, field, values).await
    }

    /// Adds `name` with one initial field. Retrying after a `QuorumTimeout`
    /// with the same `request_id` resumes the same quorum round.
    pub async fn add_with_request(
        &self,
        request_id: RequestId,
        name: &str,
        field: &str,
        values: Vec<String>,
    ) -> Result<()> {
        check_name(name)?;
        let me = self.ctx.node_id;
        let controllers = self.ctx.placement.controllers_for(name);
        if !controllers.contains(&me) {
            return Err(NameStoreError::NotResponsible {
                name: name.to_string(),
                actives: controllers,
            });
        }

        let key = AddRequestKey {
            origin: me,
            request_id,
        };
        let record = ReplicaControllerRecord::new(name, controllers.clone(), Some(key));
        match self.ctx.controller_records.insert(name, record).await {
            Ok(()) => {}
            Err(StorageError::RecordExists(_)) => match self.ctx.controller_records.get(name).await? {
                Some(existing) if existing.add_request == Some(key) && !existing.marked_for_removal => {
                    if existing.added {
                        return Ok(());
                    }
                    debug!("Resuming add of {} for request {}", name, request_id);
                }
                _ => return Err(NameStoreError::DuplicateName(name.to_string())),
            },
            Err(e) => return Err(e.into()),
        }

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = PendingAdd::new(key, controllers.clone(), tx);
            pending.settle();
            self.pending_adds.lock().await.insert(key, pending);
        }

        let others: BTreeSet<NodeId> = controllers.iter().copied().filter(|node| *node != me).collect();
        let request = AddRecordRequest {
            request_id,
            origin: me,
            name: name.to_string(),
            field: field.to_string(),
            values: values.clone(),
        };
        self.ctx
            .send_to_many(&others, NameServerMessage::AddRecordRequest(request.clone()))
            .await;

        // Controllers still holding a larger concurrent add are asked again
        // every rc_timeout until that add aborts.
        let deadline = Instant::now() + self.ctx.config.quorum_timeout();
        let outcome = loop {
            let wake = deadline.min(Instant::now() + self.ctx.config.rc_timeout());
            match tokio::time::timeout_at(wake, &mut rx).await {
                Ok(result) => break result.ok(),
                Err(_) if Instant::now() >= deadline => break None,
                Err(_) => {
                    let waiting = match self.pending_adds.lock().await.get(&key) {
                        Some(pending) => pending.tracker.pending(),
                        None => BTreeSet::new(),
                    };
                    if !waiting.is_empty() {
                        trace!("Asking {:?} again for the add of {}", waiting, name);
                        self.ctx
                            .send_to_many(&waiting, NameServerMessage::AddRecordRequest(request.clone()))
                            .await;
                    }
                }
            }
        };
        self.pending_adds.lock().await.remove(&key);

        match outcome {
            Some(AddOutcome::Accepted) => {
                info!("Add of {} accepted by a majority of {:?}", name, controllers);
                self.apply_add_complete(key, name, field, &values).await?;
                let complete = AddRecordComplete {
                    request_id,
                    origin: me,
                    name: name.to_string(),
                    field: field.to_string(),
                    values,
                };
                self.ctx
                    .send_to_many(&others, NameServerMessage::AddRecordComplete(complete))
                    .await;
                Ok(())
            }
            Some(AddOutcome::Rejected) => {
                info!("Add of {} lost to a concurrent add", name);
                self.drop_pending_record(name, key).await?;
                let abort = AddRecordAbort {
                    request_id,
                    origin: me,
                    name: name.to_string(),
                };
                self.ctx
                    .send_to_many(&others, NameServerMessage::AddRecordAbort(abort))
                    .await;
                Err(NameStoreError::DuplicateName(name.to_string()))
            }
            None => {
                warn!("Add of {} timed out waiting for a controller majority", name);
                Err(NameStoreError::QuorumTimeout(name.to_string()))
            }
        }
    }

    pub async fn handle_add_request(&self, request: AddRecordRequest) -> Result<()> {
        let me = self.ctx.node_id;
        let controllers = self.ctx.placement.controllers_for(&request.name);
        let key = AddRequestKey {
            origin: request.origin,
            request_id: request.request_id,
        };

        let (accepted, holder) = if !controllers.contains(&me) {
            warn!("Node {} got an add for {} but is not one of its controllers", me, request.name);
            (false, None)
        } else {
            let record = ReplicaControllerRecord::new(&request.name, controllers, Some(key));
            loop {
                match self.ctx.controller_records.insert(&request.name, record.clone()).await {
                    Ok(()) => break (true, None),
                    Err(StorageError::RecordExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                match self.ctx.controller_records.get(&request.name).await? {
                    Some(existing) if existing.marked_for_removal => break (false, None),
                    Some(existing) if existing.add_request == Some(key) => break (true, None),
                    Some(existing) if existing.added => break (false, None),
                    Some(existing) => break (false, existing.add_request),
                    None => continue,
                }
            }
        };

        if !accepted {
            debug!("Rejecting add of {} from {} (holding {:?})", request.name, request.origin, holder);
        }
        let confirm = AddRecordConfirm {
            request_id: request.request_id,
            name: request.name,
            from: me,
            accepted,
            holder,
        };
        self.ctx
            .send(request.origin, NameServerMessage::AddRecordConfirm(confirm))
            .await;
        Ok(())
    }

    pub async fn handle_add_confirm(&self, confirm: AddRecordConfirm) -> Result<()> {
        let key = AddRequestKey {
            origin: self.ctx.node_id,
            request_id: confirm.request_id,
        };
        let mut pending_adds = self.pending_adds.lock().await;
        match pending_adds.get_mut(&key) {
            Some(pending) => {
                pending.record_confirm(&confirm);
                pending.settle();
            }
            None => trace!("Late add confirm for {} from {}", confirm.name, confirm.from),
        }
        Ok(())
    }

    pub async fn handle_add_complete(&self, complete: AddRecordComplete) -> Result<()> {
        let key = AddRequestKey {
            origin: complete.origin,
            request_id: complete.request_id,
        };
        self.apply_add_complete(key, &complete.name, &complete.field, &complete.values)
            .await
    }

    pub async fn handle_add_abort(&self, abort: AddRecordAbort) -> Result<()> {
        let key = AddRequestKey {
            origin: abort.origin,
            request_id: abort.request_id,
        };
        self.drop_pending_record(&abort.name, key).await
    }

    /// Marks the record added and stands up the controller instance and the
    /// first active instance, whose members are the controllers.
    async fn apply_add_complete(&self, key: AddRequestKey, name: &str, field: &str, values: &[String]) -> Result<()> {
        let controllers = self.ctx.placement.controllers_for(name);
        if !controllers.contains(&self.ctx.node_id) {
            warn!("Node {} is not a controller of {}, ignoring add completion", self.ctx.node_id, name);
            return Ok(());
        }

        let mut fresh = ReplicaControllerRecord::new(name, controllers.clone(), Some(key));
        fresh.added = true;

        let finalized = loop {
            let candidate = fresh.clone();
            let updated = self
                .ctx
                .controller_records
                .update(
                    name,
                    Box::new(move |record: &mut ReplicaControllerRecord| {
                        if record.added || record.marked_for_removal {
                            return false;
                        }
                        if record.add_request == Some(key) {
                            record.added = true;
                        } else {
                            *record = candidate;
                        }
                        true
                    }),
                )
                .await?;
            match updated {
                Some(finalized) => break finalized,
                None => match self.ctx.controller_records.insert(name, fresh.clone()).await {
                    Ok(()) => break true,
                    Err(StorageError::RecordExists(_)) => continue,
                    Err(e) => return Err(e.into()),
                },
            }
        };
        if !finalized {
            trace!("Add of {} already finalized on {}", name, self.ctx.node_id);
            return Ok(());
        }

        let controller_id = PaxosId::controller(name);
        let created = self
            .ctx
            .paxos
            .create_instance(&controller_id, controllers.clone(), fresh.to_snapshot()?)
            .await?;
        if !created {
            self.ctx.paxos.recover(&controller_id).await?;
        }

        let first_id = PaxosId::active(name, 1);
        let active = ActiveRecord::new(
            name,
            controllers.clone(),
            first_id.clone(),
            ValuesMap::with_field(field, values.to_vec()),
        );
        self.install_active_record(name, active.clone()).await?;
        let created = self
            .ctx
            .paxos
            .create_instance(&first_id, controllers, active.to_snapshot()?)
            .await?;
        if !created {
            self.ctx.paxos.recover(&first_id).await?;
        }

        info!("Node {} finalized add of {}", self.ctx.node_id, name);
        Ok(())
    }

    /// Replaces a retired active record, never a live one.
    async fn install_active_record(&self, name: &str, record: ActiveRecord) -> Result<bool> {
        let candidate = record.clone();
        let replaced = self
            .ctx
            .active_records
            .update(
                name,
                Box::new(move |existing: &mut ActiveRecord| {
                    if existing.active_paxos_id.is_some() {
                        return false;
                    }
                    *existing = candidate;
                    true
                }),
            )
            .await?;
        match replaced {
            Some(replaced) => Ok(replaced),
            None => match self.ctx.active_records.insert(name, record).await {
                Ok(()) => Ok(true),
                Err(StorageError::RecordExists(_)) => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn drop_pending_record(&self, name: &str, key: AddRequestKey) -> Result<()> {
        let still_pending = self
            .ctx
            .controller_records
            .get(name)
            .await?
            .map(|record| record.add_request == Some(key) && !record.added)
            .unwrap_or(false);
        if still_pending {
            self.ctx.controller_records.remove(name).await?;
            debug!("Dropped pending record for {} on {}", name, self.ctx.node_id);
        }
        Ok(())
    }

    pub async fn update(&self, name: &str, update: FieldUpdate) -> Result<()> {
        let request_id = self.ctx.network.next_request_id();
        self.update_with_request(request_id, name, update).await
    }

    pub async fn update_with_request(&self, request_id: RequestId, name: &str, mut update: FieldUpdate) -> Result<()> {
        check_name(name)?;
        let me = self.ctx.node_id;
        let is_controller = self.ctx.placement.is_controller(name, me);
        let controller_record = if is_controller {
            self.ctx.controller_records.get(name).await?
        } else {
            None
        };
        if controller_record.as_ref().map_or(false, |record| record.marked_for_removal) {
            return Err(NameStoreError::InvalidName(name.to_string()));
        }

        if update.operation.is_upsert() {
            let exists = if is_controller {
                controller_record.is_some()
            } else {
                self.ctx.active_records.contains(name).await?
            };
            if !exists {
                if is_controller {
                    debug!("Upsert on unknown name {} becomes an add", name);
                    return self
                        .add_with_request(request_id, name, &update.field, update.new_values)
                        .await;
                }
                return Err(NameStoreError::NotResponsible {
                    name: name.to_string(),
                    actives: self.ctx.placement.controllers_for(name),
                });
            }
            update.operation = update.operation.non_upsert_equivalent();
        }

        let request = UpdateFieldRequest {
            request_id,
            origin: me,
            name: name.to_string(),
            field: update.field,
            operation: update.operation,
            new_values: update.new_values,
            old_values: update.old_values,
            argument: update.argument,
        };

        let (tx, rx) = oneshot::channel();
        self.pending_updates.lock().await.insert(request_id, tx);
        if let Err(e) = self.route_update(request, controller_record.as_ref()).await {
            self.pending_updates.lock().await.remove(&request_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.ctx.config.quorum_timeout(), rx).await;
        self.pending_updates.lock().await.remove(&request_id);
        match outcome {
            Ok(Ok(outcome)) => outcome_to_result(name, outcome),
            Ok(Err(_)) | Err(_) => Err(NameStoreError::QuorumTimeout(name.to_string())),
        }
    }

    /// Proposes locally when this node is active, otherwise forwards to the
    /// closest active replica it knows of.
    async fn route_update(&self, request: UpdateFieldRequest, controller_record: Option<&ReplicaControllerRecord>) -> Result<()> {
        let me = self.ctx.node_id;
        let local = self.ctx.active_records.get(&request.name).await?;
        if let Some(record) = &local {
            if let (true, Some(paxos_id)) = (record.is_active(me), record.active_paxos_id.clone()) {
                return self.propose_update(request, &paxos_id).await;
            }
        }

        if controller_record.is_none() && self.ctx.placement.is_controller(&request.name, me) {
            return Err(NameStoreError::InvalidName(request.name));
        }

        let actives = match (controller_record, &local) {
            (Some(record), _) => record.active_servers.clone(),
            (None, Some(record)) => record.active_name_servers.clone(),
            (None, None) => BTreeSet::new(),
        };
        let exclude: BTreeSet<NodeId> = [me].into_iter().collect();
        match self.ctx.closest_live(&actives, &exclude).await {
            Some(target) => {
                debug!("Forwarding update of {} to {}", request.name, target);
                self.ctx
                    .send(target, NameServerMessage::UpdateFieldRequest(request))
                    .await;
                Ok(())
            }
            None => Err(NameStoreError::NotResponsible {
                name: request.name,
                actives,
            }),
        }
    }

    async fn propose_update(&self, request: UpdateFieldRequest, paxos_id: &PaxosId) -> Result<()> {
        let entry = PaxosEntry::UpdateField {
            request,
            proposer: self.ctx.node_id,
        }
        .encode()?;
        match self.ctx.paxos.propose(paxos_id, entry).await {
            Ok(()) => Ok(()),
            Err(ConsensusError::InstanceStopped(stopped)) => Err(NameStoreError::StaleInstance(stopped)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn handle_update_request(&self, request: UpdateFieldRequest) -> Result<()> {
        let me = self.ctx.node_id;
        let (origin, request_id, name) = (request.origin, request.request_id, request.name.clone());

        let outcome = match self.ctx.active_records.get(&name).await? {
            Some(record) if record.is_active(me) => {
                let paxos_id = match record.active_paxos_id.clone() {
                    Some(paxos_id) => paxos_id,
                    None => return Ok(()),
                };
                match self.propose_update(request, &paxos_id).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!("Could not propose forwarded update of {}: {}", name, e);
                        UpdateOutcome::NotActive(record.active_name_servers)
                    }
                }
            }
            Some(record) => UpdateOutcome::NotActive(record.active_name_servers),
            None => UpdateOutcome::NotActive(BTreeSet::new()),
        };
        self.reply_update(origin, request_id, &name, outcome).await;
        Ok(())
    }

    pub async fn handle_update_confirm(&self, confirm: UpdateFieldConfirm) -> Result<()> {
        match self.pending_updates.lock().await.remove(&confirm.request_id) {
            Some(waiter) => {
                let _ = waiter.send(confirm.outcome);
            }
            None => trace!("No pending update {} for {}", confirm.request_id, confirm.name),
        }
        Ok(())
    }

    async fn reply_update(&self, origin: NodeId, request_id: RequestId, name: &str, outcome: UpdateOutcome) {
        if origin == self.ctx.node_id {
            if let Some(waiter) = self.pending_updates.lock().await.remove(&request_id) {
                let _ = waiter.send(outcome);
            }
            return;
        }
        let confirm = UpdateFieldConfirm {
            request_id,
            name: name.to_string(),
            outcome,
        };
        self.ctx
            .send(origin, NameServerMessage::UpdateFieldConfirm(confirm))
            .await;
    }

    /// Applies a decided update. Every member applies it; only the proposer replies.
    pub async fn apply_update(&self, paxos_id: &PaxosId, request: UpdateFieldRequest, proposer: NodeId) -> Result<()> {
        let mut applied = None;
        self.ctx
            .active_records
            .update(
                &request.name,
                Box::new(|record: &mut ActiveRecord| {
                    if record.active_paxos_id.as_ref() != Some(paxos_id) {
                        return false;
                    }
                    let changed = record.update_field(
                        &request.field,
                        request.operation,
                        &request.new_values,
                        request.old_values.as_deref(),
                        request.argument,
                    );
                    applied = Some(changed);
                    changed
                }),
            )
            .await?;

        if proposer != self.ctx.node_id {
            return Ok(());
        }
        let outcome = match applied {
            Some(true) => UpdateOutcome::Applied,
            Some(false) => UpdateOutcome::CompareFailed,
            None => {
                warn!("Update of {} decided in {} which is not current here", request.name, paxos_id);
                UpdateOutcome::NotActive(BTreeSet::new())
            }
        };
        self.reply_update(request.origin, request.request_id, &request.name, outcome)
            .await;
        Ok(())
    }

    pub async fn lookup(&self, name: &str, field: &str) -> Result<Option<Vec<String>>> {
        check_name(name)?;
        let me = self.ctx.node_id;
        let is_controller = self.ctx.placement.is_controller(name, me);
        let controller_record = if is_controller {
            self.ctx.controller_records.get(name).await?
        } else {
            None
        };
        if controller_record.as_ref().map_or(false, |record| record.marked_for_removal) {
            return Err(NameStoreError::InvalidName(name.to_string()));
        }

        let mut served = false;
        let mut values = None;
        self.ctx
            .active_records
            .update(
                name,
                Box::new(|record: &mut ActiveRecord| {
                    if !record.is_active(me) {
                        return false;
                    }
                    served = true;
                    values = record.lookup(field);
                    true
                }),
            )
            .await?;
        if served {
            return Ok(values);
        }

        if is_controller && controller_record.is_none() {
            return Err(NameStoreError::InvalidName(name.to_string()));
        }
        let actives = match controller_record {
            Some(record) => record.active_servers,
            None => self
                .ctx
                .active_records
                .get(name)
                .await?
                .map(|record| record.active_name_servers)
                .unwrap_or_default(),
        };
        Err(NameStoreError::NotResponsible {
            name: name.to_string(),
            actives,
        })
    }

    /// Removes `name`: marks it, stops its actives, then deletes the controller record.
    pub async fn remove(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let me = self.ctx.node_id;
        if !self.ctx.placement.is_controller(name, me) {
            return Err(NameStoreError::NotResponsible {
                name: name.to_string(),
                actives: self.ctx.placement.controllers_for(name),
            });
        }
        let record = match self.ctx.controller_records.get(name).await? {
            Some(record) if record.added => record,
            _ => return Err(NameStoreError::InvalidName(name.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        self.pending_removals
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .push(tx);

        if record.marked_for_removal {
            debug!("Joining in-flight removal of {}", name);
        } else {
            let entry = PaxosEntry::MarkForRemoval {
                name: name.to_string(),
                proposer: me,
            }
            .encode()?;
            if let Err(e) = self.ctx.paxos.propose(&record.controller_paxos_id(), entry).await {
                self.pending_removals.lock().await.remove(name);
                return Err(e.into());
            }
        }

        let timeout = self.ctx.config.quorum_timeout() + self.ctx.config.rc_timeout() * 2;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(NameStoreError::QuorumTimeout(name.to_string())),
        }
    }

    pub async fn complete_removal(&self, name: &str) {
        if let Some(waiters) = self.pending_removals.lock().await.remove(name) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(origin: u32, request_id: u64) -> AddRequestKey {
        AddRequestKey {
            origin: NodeId(origin),
            request_id,
        }
    }

    fn confirm(from: u32, accepted: bool, holder: Option<AddRequestKey>) -> AddRecordConfirm {
        AddRecordConfirm {
            request_id: 7,
            name: "carol".to_string(),
            from: NodeId(from),
            accepted,
            holder,
        }
    }

    fn pending(origin: u32) -> (PendingAdd, oneshot::Receiver<AddOutcome>) {
        let (tx, rx) = oneshot::channel();
        let controllers = [1, 2, 3].into_iter().map(NodeId).collect();
        (PendingAdd::new(key(origin, 7), controllers, tx), rx)
    }

    #[test]
    fn smaller_held_key_outranks_the_add() {
        let (mut add, mut rx) = pending(2);
        add.record_confirm(&confirm(1, false, Some(key(1, 7))));
        add.settle();
        assert_eq!(rx.try_recv().unwrap(), AddOutcome::Rejected);
    }

    #[test]
    fn larger_held_key_only_delays_the_add() {
        let (mut add, mut rx) = pending(1);
        add.record_confirm(&confirm(2, false, Some(key(2, 7))));
        add.record_confirm(&confirm(3, false, Some(key(3, 1))));
        add.settle();
        assert!(rx.try_recv().is_err());
        assert_eq!(add.tracker.pending(), [NodeId(2), NodeId(3)].into_iter().collect());

        add.record_confirm(&confirm(3, true, None));
        add.settle();
        assert_eq!(rx.try_recv().unwrap(), AddOutcome::Accepted);
    }

    #[test]
    fn final_rejections_defeat_the_add() {
        let (mut add, mut rx) = pending(1);
        add.record_confirm(&confirm(2, false, None));
        add.settle();
        assert!(rx.try_recv().is_err());
        add.record_confirm(&confirm(3, false, None));
        add.settle();
        assert_eq!(rx.try_recv().unwrap(), AddOutcome::Rejected);
    }

    #[test]
    fn request_keys_order_by_origin_then_request() {
        assert!(key(1, 9) < key(2, 1));
        assert!(key(2, 1) < key(2, 3));
    }
}
