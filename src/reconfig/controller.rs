use consensus::{ConsensusError, NodeId, PaxosId, PaxosSubstrate};
use network::{NameServerMessage, NewActiveSetStart, OldActiveSetStop};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use storage::{RecordStore, ReplicaControllerRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::ReplicaSelectionPolicy;
use crate::context::NodeContext;
use crate::error::{NameStoreError, Result};
use crate::paxos_interface::PaxosEntry;
use crate::placement::is_smallest_node_running;
use crate::tasks::{TaskControl, TaskKey, TaskKind};

/// How far this controller has driven a name's current migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupChangeProgress {
    StopSent = 1,
    OldActiveStop = 2,
    NewActiveStart = 3,
}

/// Replica-controller side of migrations and removals.
pub struct ControllerCoordinator {
    ctx: Arc<NodeContext>,
    policy: Arc<dyn ReplicaSelectionPolicy>,
    progress: Mutex<HashMap<String, GroupChangeProgress>>,
    /// Removals decided while a migration was still in flight.
    pending_removals: Mutex<HashSet<String>>,
}

impl ControllerCoordinator {
    pub fn new(ctx: Arc<NodeContext>, policy: Arc<dyn ReplicaSelectionPolicy>) -> Self {
        Self {
            ctx,
            policy,
            progress: Mutex::new(HashMap::new()),
            pending_removals: Mutex::new(HashSet::new()),
        }
    }

    pub async fn progress(&self, name: &str) -> Option<GroupChangeProgress> {
        self.progress.lock().await.get(name).copied()
    }

    /// Moves `name` forward to `state`. Refuses to go backwards or sideways,
    /// and refuses anything past `StopSent` when no migration is tracked.
    pub async fn update_progress(&self, name: &str, state: GroupChangeProgress) -> bool {
        let mut progress = self.progress.lock().await;
        match progress.get(name) {
            Some(current) if *current >= state => false,
            None if state > GroupChangeProgress::StopSent => false,
            _ => {
                progress.insert(name.to_string(), state);
                true
            }
        }
    }

    async fn clear_progress(&self, name: &str) {
        self.progress.lock().await.remove(name);
    }

    fn is_driver(&self, name: &str, controllers: &BTreeSet<NodeId>, proposer: NodeId) -> bool {
        let me = self.ctx.node_id;
        if proposer == me {
            return true;
        }
        !self.ctx.is_up(proposer) && is_smallest_node_running(name, controllers, me, |node| self.ctx.is_up(node))
    }

    /// Proposes `actives` as the next active set of `name`. Returns the new
    /// paxos ID, or `None` when there is nothing to do.
    pub async fn propose_new_actives(&self, name: &str, actives: BTreeSet<NodeId>) -> Result<Option<PaxosId>> {
        let record = match self.ctx.controller_records.get(name).await? {
            Some(record) if record.added && !record.marked_for_removal => record,
            _ => return Err(NameStoreError::InvalidName(name.to_string())),
        };
        if actives.is_empty() {
            return Err(NameStoreError::InvalidConfig(format!("empty active set for {}", name)));
        }
        if !record.active_running {
            debug!("Migration of {} already in flight", name);
            return Ok(None);
        }
        if actives == record.active_servers {
            return Ok(None);
        }

        let paxos_id = record.next_active_paxos_id();
        let entry = PaxosEntry::NewActivesProposed {
            name: name.to_string(),
            actives: actives.clone(),
            paxos_id: paxos_id.clone(),
            proposer: self.ctx.node_id,
        }
        .encode()?;
        self.ctx.paxos.propose(&record.controller_paxos_id(), entry).await?;
        info!("Node {} proposed actives {:?} for {} as {}", self.ctx.node_id, actives, name, paxos_id);
        Ok(Some(paxos_id))
    }

    pub async fn apply_new_actives_proposed(
        self: &Arc<Self>,
        name: &str,
        actives: BTreeSet<NodeId>,
        new_paxos_id: PaxosId,
        proposer: NodeId,
    ) -> Result<()> {
        let mut retired = None;
        let candidate_id = new_paxos_id.clone();
        let applied = self
            .ctx
            .controller_records
            .update(
                name,
                Box::new(|record: &mut ReplicaControllerRecord| {
                    if record.marked_for_removal || !record.active_running {
                        return false;
                    }
                    if !record.update_active_name_servers(actives, candidate_id) {
                        return false;
                    }
                    retired = Some((
                        record.old_active_servers.clone(),
                        record.old_active_paxos_id.clone(),
                        record.controllers.clone(),
                    ));
                    true
                }),
            )
            .await?;
        if applied.is_none() {
            warn!("No controller record for {} on {}", name, self.ctx.node_id);
        }

        let (old_actives, old_paxos_id, controllers) = match retired {
            Some((old_actives, Some(old_paxos_id), controllers)) => (old_actives, old_paxos_id, controllers),
            _ => {
                debug!("Ignoring proposal of {} for {}", new_paxos_id, name);
                return Ok(());
            }
        };

        if self.is_driver(name, &controllers, proposer) {
            self.clear_progress(name).await;
            self.update_progress(name, GroupChangeProgress::StopSent).await;
            info!("Node {} driving {} from {} to {}", self.ctx.node_id, name, old_paxos_id, new_paxos_id);
            self.start_stop_task(name, old_actives, old_paxos_id);
        }
        Ok(())
    }

    fn start_stop_task(self: &Arc<Self>, name: &str, actives: BTreeSet<NodeId>, paxos_id: PaxosId) {
        let key = TaskKey::new(TaskKind::StopActives, paxos_id.clone());
        let tried = Arc::new(Mutex::new(BTreeSet::new()));
        let this = self.clone();
        let name = name.to_string();
        self.ctx.tasks.spawn_periodic(key, self.ctx.config.rc_timeout(), move || {
            let this = this.clone();
            let name = name.clone();
            let actives = actives.clone();
            let paxos_id = paxos_id.clone();
            let tried = tried.clone();
            async move { this.stop_tick(&name, &actives, &paxos_id, &tried).await }
        });
    }

    async fn stop_tick(
        &self,
        name: &str,
        actives: &BTreeSet<NodeId>,
        paxos_id: &PaxosId,
        tried: &Mutex<BTreeSet<NodeId>>,
    ) -> TaskControl {
        if self.progress(name).await != Some(GroupChangeProgress::StopSent) {
            return TaskControl::Done;
        }
        match self.ctx.controller_records.contains(name).await {
            Ok(true) => {}
            _ => return TaskControl::Done,
        }

        let mut tried = tried.lock().await;
        let target = match self.ctx.closest_live(actives, &tried).await {
            Some(target) => Some(target),
            None if !tried.is_empty() => {
                tried.clear();
                self.ctx.closest_live(actives, &tried).await
            }
            None => None,
        };
        let target = match target {
            Some(target) => target,
            None => {
                warn!("No live old active to stop {} of {}", paxos_id, name);
                return TaskControl::Continue;
            }
        };
        tried.insert(target);

        debug!("Node {} asking {} to stop {}", self.ctx.node_id, target, paxos_id);
        let stop = OldActiveSetStop {
            name: name.to_string(),
            paxos_id: paxos_id.clone(),
            controller: self.ctx.node_id,
            receiver: target,
        };
        self.ctx.send(target, NameServerMessage::OldActiveSetStop(stop)).await;
        TaskControl::Continue
    }

    pub async fn handle_old_active_stop_confirm(self: &Arc<Self>, confirm: OldActiveSetStop) -> Result<()> {
        let record = match self.ctx.controller_records.get(&confirm.name).await? {
            Some(record) => record,
            None => {
                trace!("Stop confirm for unknown name {}", confirm.name);
                return Ok(());
            }
        };
        let stop_key = TaskKey::new(TaskKind::StopActives, confirm.paxos_id.clone());

        if record.marked_for_removal
            && record.active_running
            && record.active_paxos_id.as_ref() == Some(&confirm.paxos_id)
        {
            self.ctx.tasks.cancel(&stop_key);
            let entry = PaxosEntry::RemoveRecord {
                name: confirm.name.clone(),
                proposer: self.ctx.node_id,
            }
            .encode()?;
            return match self.ctx.paxos.propose_stop(&record.controller_paxos_id(), entry).await {
                Ok(()) => Ok(()),
                Err(ConsensusError::InstanceStopped(_)) => {
                    debug!("Removal of {} already decided", confirm.name);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
        }

        if record.active_running || record.old_active_paxos_id.as_ref() != Some(&confirm.paxos_id) {
            trace!("Stale stop confirm for {} from {}", confirm.paxos_id, confirm.receiver);
            return Ok(());
        }
        if !self
            .update_progress(&confirm.name, GroupChangeProgress::OldActiveStop)
            .await
        {
            trace!("Duplicate stop confirm for {}", confirm.paxos_id);
            return Ok(());
        }

        info!("Old actives of {} stopped at {}", confirm.name, confirm.paxos_id);
        self.ctx.tasks.cancel(&stop_key);
        self.start_start_task(record);
        Ok(())
    }

    fn start_start_task(self: &Arc<Self>, record: ReplicaControllerRecord) {
        let (new_paxos_id, old_paxos_id) = match (record.active_paxos_id.clone(), record.old_active_paxos_id.clone()) {
            (Some(new_paxos_id), Some(old_paxos_id)) => (new_paxos_id, old_paxos_id),
            _ => return,
        };
        let request = NewActiveSetStart {
            name: record.name.clone(),
            controller: self.ctx.node_id,
            coordinator: None,
            old_actives: record.old_active_servers.clone(),
            new_actives: record.active_servers.clone(),
            old_paxos_id,
            new_paxos_id: new_paxos_id.clone(),
            previous_value: None,
        };

        let key = TaskKey::new(TaskKind::StartActives, new_paxos_id);
        let tried = Arc::new(Mutex::new(BTreeSet::new()));
        let this = self.clone();
        self.ctx.tasks.spawn_periodic(key, self.ctx.config.rc_timeout(), move || {
            let this = this.clone();
            let request = request.clone();
            let tried = tried.clone();
            async move { this.start_tick(request, &tried).await }
        });
    }

    async fn start_tick(&self, mut request: NewActiveSetStart, tried: &Mutex<BTreeSet<NodeId>>) -> TaskControl {
        if self.progress(&request.name).await != Some(GroupChangeProgress::OldActiveStop) {
            return TaskControl::Done;
        }

        let mut tried = tried.lock().await;
        let target = match self.ctx.closest_live(&request.new_actives, &tried).await {
            Some(target) => Some(target),
            None if !tried.is_empty() => {
                tried.clear();
                self.ctx.closest_live(&request.new_actives, &tried).await
            }
            None => None,
        };
        let target = match target {
            Some(target) => target,
            None => {
                warn!("No live new active to start {}", request.new_paxos_id);
                return TaskControl::Continue;
            }
        };
        tried.insert(target);

        if self.ctx.config.embed_previous_value {
            request.previous_value = match self.ctx.active_records.get(&request.name).await {
                Ok(Some(record)) => record.old_values_on_paxos_id_match(&request.old_paxos_id).cloned(),
                _ => None,
            };
        }

        debug!(
            "Node {} asking {} to start {} (value embedded: {})",
            self.ctx.node_id,
            target,
            request.new_paxos_id,
            request.previous_value.is_some()
        );
        self.ctx.send(target, NameServerMessage::NewActiveSetStart(request)).await;
        TaskControl::Continue
    }

    pub async fn handle_new_active_start_confirm(&self, confirm: NewActiveSetStart) -> Result<()> {
        let current = match self.ctx.controller_records.get(&confirm.name).await? {
            Some(record) => !record.active_running && record.active_paxos_id.as_ref() == Some(&confirm.new_paxos_id),
            None => false,
        };
        if !current {
            trace!("Stale start confirm for {}", confirm.new_paxos_id);
            return Ok(());
        }
        if !self
            .update_progress(&confirm.name, GroupChangeProgress::NewActiveStart)
            .await
        {
            trace!("Duplicate start confirm for {}", confirm.new_paxos_id);
            return Ok(());
        }
        self.ctx
            .tasks
            .cancel(&TaskKey::new(TaskKind::StartActives, confirm.new_paxos_id.clone()));

        let entry = PaxosEntry::NewActiveSetConfirmed {
            name: confirm.name.clone(),
            paxos_id: confirm.new_paxos_id.clone(),
            proposer: self.ctx.node_id,
        }
        .encode()?;
        self.ctx
            .paxos
            .propose(&PaxosId::controller(&confirm.name), entry)
            .await?;
        Ok(())
    }

    pub async fn apply_new_active_confirmed(self: &Arc<Self>, name: &str, paxos_id: &PaxosId, _proposer: NodeId) -> Result<()> {
        let running = self
            .ctx
            .controller_records
            .update(
                name,
                Box::new(|record: &mut ReplicaControllerRecord| record.set_new_active_running(paxos_id)),
            )
            .await?;
        if running != Some(true) {
            debug!("Ignoring stale confirmation of {} for {}", paxos_id, name);
            return Ok(());
        }

        self.clear_progress(name).await;
        info!("Node {} sees {} running for {}", self.ctx.node_id, paxos_id, name);

        if self.pending_removals.lock().await.remove(name) {
            if let Some(record) = self.ctx.controller_records.get(name).await? {
                if record.marked_for_removal {
                    self.stop_for_removal(record).await;
                }
            }
        }
        Ok(())
    }

    pub async fn apply_mark_for_removal(self: &Arc<Self>, name: &str, proposer: NodeId) -> Result<()> {
        let marked = self
            .ctx
            .controller_records
            .update(
                name,
                Box::new(|record: &mut ReplicaControllerRecord| record.mark_for_removal()),
            )
            .await?;
        if marked != Some(true) {
            return Ok(());
        }

        let record = match self.ctx.controller_records.get(name).await? {
            Some(record) => record,
            None => return Ok(()),
        };
        info!("Node {} marked {} for removal", self.ctx.node_id, name);
        if !self.is_driver(name, &record.controllers, proposer) {
            return Ok(());
        }
        if record.active_running {
            self.stop_for_removal(record).await;
        } else {
            debug!("Removal of {} waits for its migration to finish", name);
            self.pending_removals.lock().await.insert(name.to_string());
        }
        Ok(())
    }

    async fn stop_for_removal(self: &Arc<Self>, record: ReplicaControllerRecord) {
        let paxos_id = match record.active_paxos_id.clone() {
            Some(paxos_id) => paxos_id,
            None => return,
        };
        self.clear_progress(&record.name).await;
        self.update_progress(&record.name, GroupChangeProgress::StopSent).await;
        self.start_stop_task(&record.name, record.active_servers, paxos_id);
    }

    pub async fn apply_remove_record(&self, name: &str, proposer: NodeId) -> Result<()> {
        let removed = self.ctx.controller_records.remove(name).await?;
        self.clear_progress(name).await;
        self.pending_removals.lock().await.remove(name);

        let record = match removed {
            Some(record) => record,
            None => return Ok(()),
        };
        if let Some(paxos_id) = record.active_paxos_id.clone() {
            self.ctx.tasks.cancel(&TaskKey::new(TaskKind::StopActives, paxos_id.clone()));
            self.ctx.tasks.cancel(&TaskKey::new(TaskKind::StartActives, paxos_id));
        }
        info!("Node {} removed controller record for {}", self.ctx.node_id, name);

        if proposer == self.ctx.node_id {
            self.ctx.paxos.delete_instance(&record.controller_paxos_id()).await?;
            for version in 1..=record.active_version {
                self.ctx.paxos.delete_instance(&PaxosId::active(name, version)).await?;
            }
        }
        Ok(())
    }

    /// One pass of the new-actives scan over the names this node drives.
    /// Returns how many migrations were proposed.
    pub async fn scan_once(&self) -> Result<usize> {
        let me = self.ctx.node_id;
        let nodes = self.ctx.placement.nodes();
        let mut proposed = 0;

        for record in self.ctx.controller_records.scan_all().await? {
            if record.marked_for_removal || !record.added || !record.active_running || !record.is_controller(me) {
                continue;
            }
            if !is_smallest_node_running(&record.name, &record.controllers, me, |node| self.ctx.is_up(node)) {
                continue;
            }

            let actives = self.policy.select_actives(&record, &nodes);
            if actives.is_empty() || actives == record.active_servers {
                continue;
            }
            match self.propose_new_actives(&record.name, actives).await {
                Ok(Some(_)) => proposed += 1,
                Ok(None) => {}
                Err(e) => warn!("Scan could not propose new actives for {}: {}", record.name, e),
            }
        }

        if proposed > 0 {
            debug!("Node {} proposed {} migrations", me, proposed);
        }
        Ok(proposed)
    }
}
