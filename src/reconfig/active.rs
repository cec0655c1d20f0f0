use chrono::Utc;
use consensus::{ConsensusError, NodeId, PaxosId, PaxosSubstrate};
use network::{
    NameServerMessage, NewActiveSetStart, NewActiveSetStartResponse, OldActiveSetStop, PreviousValueRequest,
    PreviousValueResponse,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use storage::{ActiveRecord, PaxosStatus, RecordStore, StorageError, ValuesMap};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::context::NodeContext;
use crate::error::Result;
use crate::paxos_interface::PaxosEntry;
use crate::quorum::NewActiveStartInfo;
use crate::tasks::{TaskControl, TaskKey, TaskKind};

#[derive(Default)]
struct CopyProgress {
    queried: BTreeSet<NodeId>,
    rounds: u32,
}

fn active_version(record: &ActiveRecord) -> u64 {
    let current = record.active_paxos_id.as_ref().and_then(PaxosId::version).unwrap_or(0);
    let retired = record.old_active_paxos_id.as_ref().and_then(PaxosId::version).unwrap_or(0);
    current.max(retired)
}

/// Active-replica side of migrations: stops retiring instances and brings
/// up new ones with the final values of the old.
pub struct ActiveCoordinator {
    ctx: Arc<NodeContext>,
    /// Migrations this node coordinates until a majority has started, keyed by the new instance.
    start_infos: Mutex<HashMap<PaxosId, NewActiveStartInfo>>,
    /// Starts still waiting for the previous value.
    pending_copies: Mutex<HashMap<PaxosId, NewActiveSetStart>>,
}

impl ActiveCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            start_infos: Mutex::new(HashMap::new()),
            pending_copies: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle_old_active_stop(&self, stop: OldActiveSetStop) -> Result<()> {
        let me = self.ctx.node_id;
        let record = match self.ctx.active_records.get(&stop.name).await? {
            Some(record) => record,
            None => {
                warn!("Node {} asked to stop {} but holds no record for {}", me, stop.paxos_id, stop.name);
                return Ok(());
            }
        };

        match record.paxos_status(&stop.paxos_id) {
            PaxosStatus::Current => {
                let entry = PaxosEntry::ActiveStop {
                    name: stop.name.clone(),
                    paxos_id: stop.paxos_id.clone(),
                    controller: stop.controller,
                    receiver: me,
                }
                .encode()?;
                match self.ctx.paxos.propose_stop(&stop.paxos_id, entry).await {
                    Ok(()) => debug!("Node {} proposed stop of {}", me, stop.paxos_id),
                    Err(ConsensusError::InstanceStopped(_)) => {
                        debug!("{} is already stopping", stop.paxos_id)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            PaxosStatus::Old => {
                let confirm = OldActiveSetStop { receiver: me, ..stop };
                let controller = confirm.controller;
                self.ctx
                    .send(controller, NameServerMessage::OldActiveSetStopConfirm(confirm))
                    .await;
            }
            PaxosStatus::Unknown => {
                warn!("Node {} does not know {} of {}", me, stop.paxos_id, stop.name);
            }
        }
        Ok(())
    }

    /// Applies a decided stop; the member that proposed it confirms to the controller.
    pub async fn apply_active_stop(&self, name: &str, paxos_id: &PaxosId, controller: NodeId, receiver: NodeId) -> Result<()> {
        let stopped = self
            .ctx
            .active_records
            .update(
                name,
                Box::new(|record: &mut ActiveRecord| record.handle_current_active_stop(paxos_id)),
            )
            .await?;
        self.start_infos.lock().await.remove(paxos_id);
        if stopped == Some(true) {
            info!("Node {} stopped {} of {}", self.ctx.node_id, paxos_id, name);
        } else {
            debug!("Stop of {} was not current on {}", paxos_id, self.ctx.node_id);
        }

        if receiver == self.ctx.node_id {
            let confirm = OldActiveSetStop {
                name: name.to_string(),
                paxos_id: paxos_id.clone(),
                controller,
                receiver,
            };
            self.ctx
                .send(controller, NameServerMessage::OldActiveSetStopConfirm(confirm))
                .await;
        }
        Ok(())
    }

    /// Takes on coordination of a start: forwards it to every new active and
    /// collects their responses.
    pub async fn handle_new_active_set_start(&self, mut request: NewActiveSetStart) -> Result<()> {
        let me = self.ctx.node_id;
        if !request.new_actives.contains(&me) {
            error!("Node {} got a start for {} but is not a new active", me, request.new_paxos_id);
            return Ok(());
        }

        {
            let mut start_infos = self.start_infos.lock().await;
            let new_version = request.new_paxos_id.version();
            start_infos.retain(|paxos_id, _| paxos_id.name() != request.name || paxos_id.version() >= new_version);
            if let Some(info) = start_infos.get_mut(&request.new_paxos_id) {
                info.request.controller = request.controller;
                trace!("Already coordinating {} ({} responses)", request.new_paxos_id, info.responded());
                return Ok(());
            }
            request.coordinator = Some(me);
            start_infos.insert(request.new_paxos_id.clone(), NewActiveStartInfo::new(request.clone()));
        }

        debug!("Node {} coordinating start of {}", me, request.new_paxos_id);
        let targets = request.new_actives.clone();
        self.ctx
            .send_to_many(&targets, NameServerMessage::NewActiveSetStartForward(request))
            .await;
        Ok(())
    }

    pub async fn handle_forward(self: &Arc<Self>, request: NewActiveSetStart) -> Result<()> {
        let me = self.ctx.node_id;
        if !request.new_actives.contains(&me) {
            error!("Node {} got a forwarded start for {} but is not a new active", me, request.new_paxos_id);
            return Ok(());
        }

        if let Some(record) = self.ctx.active_records.get(&request.name).await? {
            if record.active_paxos_id.as_ref() == Some(&request.new_paxos_id) {
                self.respond(&request).await;
                return Ok(());
            }
        }

        if let Some(values) = request.previous_value.clone() {
            return self.start_locally(&request, values).await;
        }

        {
            let mut pending = self.pending_copies.lock().await;
            if pending.contains_key(&request.new_paxos_id) {
                trace!("Already fetching the value for {}", request.new_paxos_id);
                return Ok(());
            }
            pending.insert(request.new_paxos_id.clone(), request.clone());
        }

        let new_paxos_id = request.new_paxos_id.clone();
        let key = TaskKey::new(TaskKind::CopyState, new_paxos_id.clone());
        let progress = Arc::new(Mutex::new(CopyProgress::default()));
        let this = self.clone();
        self.ctx
            .tasks
            .spawn_periodic(key, self.ctx.config.value_poll_interval(), move || {
                let this = this.clone();
                let new_paxos_id = new_paxos_id.clone();
                let progress = progress.clone();
                async move { this.copy_tick(&new_paxos_id, &progress).await }
            });
        Ok(())
    }

    async fn copy_tick(&self, new_paxos_id: &PaxosId, progress: &Mutex<CopyProgress>) -> TaskControl {
        let request = match self.pending_copies.lock().await.get(new_paxos_id).cloned() {
            Some(request) => request,
            None => return TaskControl::Done,
        };

        let mut progress = progress.lock().await;
        let mut target = self.ctx.closest_live(&request.old_actives, &progress.queried).await;
        if target.is_none() && !progress.queried.is_empty() {
            progress.rounds += 1;
            if let Some(max_rounds) = self.ctx.config.max_value_poll_rounds {
                if progress.rounds >= max_rounds {
                    error!(
                        "Node {} gave up fetching the value of {} after {} rounds",
                        self.ctx.node_id, request.old_paxos_id, progress.rounds
                    );
                    self.pending_copies.lock().await.remove(new_paxos_id);
                    return TaskControl::Done;
                }
            }
            progress.queried.clear();
            target = self.ctx.closest_live(&request.old_actives, &progress.queried).await;
        }

        let target = match target {
            Some(target) => target,
            None => {
                warn!("No live old active holds {}", request.old_paxos_id);
                return TaskControl::Continue;
            }
        };
        progress.queried.insert(target);

        trace!("Node {} asking {} for the value of {}", self.ctx.node_id, target, request.old_paxos_id);
        let ask = PreviousValueRequest {
            name: request.name.clone(),
            old_paxos_id: request.old_paxos_id.clone(),
            new_paxos_id: request.new_paxos_id.clone(),
            requester: self.ctx.node_id,
            sent_at: Utc::now(),
        };
        self.ctx.send(target, NameServerMessage::PreviousValueRequest(ask)).await;
        TaskControl::Continue
    }

    pub async fn handle_previous_value_request(&self, request: PreviousValueRequest) -> Result<()> {
        let value = self
            .ctx
            .active_records
            .get(&request.name)
            .await?
            .and_then(|record| record.old_values_on_paxos_id_match(&request.old_paxos_id).cloned());
        if value.is_none() {
            debug!("Node {} has no final value for {}", self.ctx.node_id, request.old_paxos_id);
        }

        let response = PreviousValueResponse {
            name: request.name,
            old_paxos_id: request.old_paxos_id,
            new_paxos_id: request.new_paxos_id,
            from: self.ctx.node_id,
            value,
            request_sent_at: request.sent_at,
        };
        self.ctx
            .send(request.requester, NameServerMessage::PreviousValueResponse(response))
            .await;
        Ok(())
    }

    pub async fn handle_previous_value_response(&self, response: PreviousValueResponse) -> Result<()> {
        let round_trip = self
            .ctx
            .network
            .observe_round_trip(response.from, response.request_sent_at)
            .await;
        trace!("Round trip to {} took {:?}", response.from, round_trip);

        let values = match response.value {
            Some(values) => values,
            None => {
                debug!("{} has stale state for {}, trying another", response.from, response.old_paxos_id);
                return Ok(());
            }
        };
        let request = match self.pending_copies.lock().await.remove(&response.new_paxos_id) {
            Some(request) => request,
            None => {
                trace!("Duplicate value for {} from {}", response.new_paxos_id, response.from);
                return Ok(());
            }
        };
        self.ctx
            .tasks
            .cancel(&TaskKey::new(TaskKind::CopyState, response.new_paxos_id.clone()));
        self.start_locally(&request, values).await
    }

    /// Installs the new record and instance here, then tells the coordinator.
    async fn start_locally(&self, request: &NewActiveSetStart, values: ValuesMap) -> Result<()> {
        let new_version = request.new_paxos_id.version().unwrap_or(0);

        let record = loop {
            let mut known_version = None;
            let actives = request.new_actives.clone();
            let paxos_id = request.new_paxos_id.clone();
            let retiring = request.old_paxos_id.clone();
            let start_values = values.clone();
            let updated = self
                .ctx
                .active_records
                .update(
                    &request.name,
                    Box::new(|record: &mut ActiveRecord| {
                        let version = active_version(record);
                        if version >= new_version {
                            known_version = Some(version);
                            return false;
                        }
                        record.archive_final_values(&retiring, &start_values);
                        record.handle_new_active_start(actives, paxos_id, start_values);
                        true
                    }),
                )
                .await?;

            match (updated, known_version) {
                (Some(_), Some(version)) if version > new_version => {
                    warn!("Ignoring start of {}: a newer instance is known", request.new_paxos_id);
                    return Ok(());
                }
                (Some(_), Some(_)) => {
                    trace!("{} already started here", request.new_paxos_id);
                    self.respond(request).await;
                    return Ok(());
                }
                (Some(_), None) => match self.ctx.active_records.get(&request.name).await? {
                    Some(record) => break record,
                    None => continue,
                },
                (None, _) => {
                    let record = ActiveRecord::new(
                        &request.name,
                        request.new_actives.clone(),
                        request.new_paxos_id.clone(),
                        values.clone(),
                    );
                    match self.ctx.active_records.insert(&request.name, record.clone()).await {
                        Ok(()) => break record,
                        Err(StorageError::RecordExists(_)) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        };

        let created = self
            .ctx
            .paxos
            .create_instance(&request.new_paxos_id, request.new_actives.clone(), record.to_snapshot()?)
            .await?;
        if !created {
            self.ctx.paxos.recover(&request.new_paxos_id).await?;
        }
        info!("Node {} started {} for {}", self.ctx.node_id, request.new_paxos_id, request.name);

        self.respond(request).await;
        Ok(())
    }

    async fn respond(&self, request: &NewActiveSetStart) {
        let coordinator = match request.coordinator {
            Some(coordinator) => coordinator,
            None => {
                warn!("Start of {} has no coordinator to answer", request.new_paxos_id);
                return;
            }
        };
        let response = NewActiveSetStartResponse {
            name: request.name.clone(),
            new_paxos_id: request.new_paxos_id.clone(),
            from: self.ctx.node_id,
        };
        self.ctx
            .send(coordinator, NameServerMessage::NewActiveSetStartResponse(response))
            .await;
    }

    /// Number of starts this node is still collecting responses for.
    pub async fn coordinated_starts(&self) -> usize {
        self.start_infos.lock().await.len()
    }

    pub async fn handle_start_response(&self, response: NewActiveSetStartResponse) -> Result<()> {
        let confirm = {
            let mut start_infos = self.start_infos.lock().await;
            match start_infos.get_mut(&response.new_paxos_id) {
                Some(info) => {
                    if info.record_response(response.from) {
                        start_infos.remove(&response.new_paxos_id).map(|info| info.request)
                    } else {
                        None
                    }
                }
                None => {
                    trace!("Start response for unknown {}", response.new_paxos_id);
                    None
                }
            }
        };

        if let Some(request) = confirm {
            info!("Majority of new actives started {}", request.new_paxos_id);
            let controller = request.controller;
            self.ctx
                .send(controller, NameServerMessage::NewActiveSetStartConfirm(request))
                .await;
        }
        Ok(())
    }
}
