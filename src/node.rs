use crate::client::{ClientRequestCoordinator, FieldUpdate};
use crate::config::Config;
use crate::context::NodeContext;
use crate::error::{NameStoreError, Result};
use crate::paxos_interface::PaxosInterface;
use crate::placement::ConsistentHashing;
use crate::reconfig::{ActiveCoordinator, ControllerCoordinator, ReplicaSelectionPolicy};
use consensus::{NodeId, PaxosCluster, PaxosId};
use network::{Envelope, LocalNetwork, MessageHandler, NameServerMessage};
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::{ActiveRecord, RecordStore, ReplicaControllerRecord};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One name server: replica controller for the names that hash to it and
/// active replica for the names placed on it.
#[derive(Clone)]
pub struct Node {
    ctx: Arc<NodeContext>,
    client: Arc<ClientRequestCoordinator>,
    controller: Arc<ControllerCoordinator>,
    active: Arc<ActiveCoordinator>,
}

impl Node {
    pub async fn new(
        config: Config,
        network: Arc<LocalNetwork>,
        cluster: Arc<PaxosCluster>,
        policy: Arc<dyn ReplicaSelectionPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing name server {} at {}", config.node_id, config.bind_address());

        let placement = ConsistentHashing::new(config.membership(), config.controllers_per_name)?;
        let paxos = cluster.manager(config.node_id);
        let messages = MessageHandler::new(config.clone().into(), network);
        let ctx = Arc::new(NodeContext::new(config.clone(), placement, paxos, messages));

        let client = Arc::new(ClientRequestCoordinator::new(ctx.clone()));
        let controller = Arc::new(ControllerCoordinator::new(ctx.clone(), policy));
        let active = Arc::new(ActiveCoordinator::new(ctx.clone()));

        let interface = Arc::new(PaxosInterface::new(
            ctx.clone(),
            client.clone(),
            controller.clone(),
            active.clone(),
        ));
        cluster.register(config.into(), interface).await;

        Ok(Self {
            ctx,
            client,
            controller,
            active,
        })
    }

    /// Runs the message loop and the new-actives scan until one of them stops.
    pub async fn start(&self) -> Result<()> {
        info!("Starting name server {}", self.ctx.node_id);
        let receiver = self.ctx.network.take_receiver().await?;

        let message_task = {
            let node = self.clone();
            tokio::spawn(async move { node.process_messages(receiver).await })
        };

        let scan_task = {
            let node = self.clone();
            tokio::spawn(async move { node.run_reconfiguration_scan().await })
        };

        let result = tokio::select! {
            result = message_task => {
                error!("Message loop of {} stopped: {:?}", self.ctx.node_id, result);
                Err(NameStoreError::Network(network::NetworkError::ConnectionFailed(
                    "message loop stopped".to_string(),
                )))
            }
            result = scan_task => {
                error!("Reconfiguration scan of {} stopped: {:?}", self.ctx.node_id, result);
                Err(NameStoreError::InvalidConfig("reconfiguration scan stopped".to_string()))
            }
        };
        self.ctx.tasks.cancel_all();
        result
    }

    async fn process_messages(&self, mut receiver: mpsc::UnboundedReceiver<Envelope>) {
        while let Some((from, message)) = receiver.recv().await {
            let kind = message.kind();
            let name = message.name().to_string();
            if let Err(e) = self.handle_message(from, message).await {
                warn!(
                    "Node {} failed to handle {} for {} from {}: {}",
                    self.ctx.node_id, kind, name, from, e
                );
            }
        }
        debug!("Inbox of {} closed", self.ctx.node_id);
    }

    async fn handle_message(&self, from: NodeId, message: NameServerMessage) -> Result<()> {
        if !self.ctx.is_up(self.ctx.node_id) {
            debug!("Node {} is down, dropping {} from {}", self.ctx.node_id, message.kind(), from);
            return Ok(());
        }

        match message {
            NameServerMessage::AddRecordRequest(request) => self.client.handle_add_request(request).await,
            NameServerMessage::AddRecordConfirm(confirm) => self.client.handle_add_confirm(confirm).await,
            NameServerMessage::AddRecordComplete(complete) => self.client.handle_add_complete(complete).await,
            NameServerMessage::AddRecordAbort(abort) => self.client.handle_add_abort(abort).await,
            NameServerMessage::UpdateFieldRequest(request) => self.client.handle_update_request(request).await,
            NameServerMessage::UpdateFieldConfirm(confirm) => self.client.handle_update_confirm(confirm).await,
            NameServerMessage::NewActiveSetStart(request) => self.active.handle_new_active_set_start(request).await,
            NameServerMessage::NewActiveSetStartForward(request) => self.active.handle_forward(request).await,
            NameServerMessage::NewActiveSetStartResponse(response) => {
                self.active.handle_start_response(response).await
            }
            NameServerMessage::NewActiveSetStartConfirm(confirm) => {
                self.controller.handle_new_active_start_confirm(confirm).await
            }
            NameServerMessage::PreviousValueRequest(request) => {
                self.active.handle_previous_value_request(request).await
            }
            NameServerMessage::PreviousValueResponse(response) => {
                self.active.handle_previous_value_response(response).await
            }
            NameServerMessage::OldActiveSetStop(stop) => self.active.handle_old_active_stop(stop).await,
            NameServerMessage::OldActiveSetStopConfirm(confirm) => {
                self.controller.handle_old_active_stop_confirm(confirm).await
            }
        }
    }

    async fn run_reconfiguration_scan(&self) {
        let period = match self.ctx.config.reconfiguration_interval() {
            Some(period) => period,
            None => {
                debug!("Reconfiguration scan disabled on {}", self.ctx.node_id);
                std::future::pending::<()>().await;
                return;
            }
        };

        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !self.ctx.is_up(self.ctx.node_id) {
                continue;
            }
            if let Err(e) = self.controller.scan_once().await {
                warn!("Reconfiguration scan on {} failed: {}", self.ctx.node_id, e);
            }
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn next_request_id(&self) -> network::RequestId {
        self.ctx.network.next_request_id()
    }

    pub async fn add(&self, name: &str, field: &str, values: Vec<String>) -> Result<()> {
        self.client.add(name, field, values).await
    }

    pub async fn add_with_request(
        &self,
        request_id: network::RequestId,
        name: &str,
        field: &str,
        values: Vec<String>,
    ) -> Result<()> {
        self.client.add_with_request(request_id, name, field, values).await
    }

    pub async fn update(&self, name: &str, update: FieldUpdate) -> Result<()> {
        self.client.update(name, update).await
    }

    pub async fn lookup(&self, name: &str, field: &str) -> Result<Option<Vec<String>>> {
        self.client.lookup(name, field).await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.client.remove(name).await
    }

    pub async fn propose_new_actives(&self, name: &str, actives: BTreeSet<NodeId>) -> Result<Option<PaxosId>> {
        self.controller.propose_new_actives(name, actives).await
    }

    pub async fn scan_once(&self) -> Result<usize> {
        self.controller.scan_once().await
    }

    pub async fn controller_record(&self, name: &str) -> Result<Option<ReplicaControllerRecord>> {
        Ok(self.ctx.controller_records.get(name).await?)
    }

    pub async fn active_record(&self, name: &str) -> Result<Option<ActiveRecord>> {
        Ok(self.ctx.active_records.get(name).await?)
    }

    pub async fn coordinated_starts(&self) -> usize {
        self.active.coordinated_starts().await
    }

    pub fn pending_tasks(&self) -> usize {
        self.ctx.tasks.len()
    }
}
