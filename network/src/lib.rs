mod communication;
mod transport;

pub use communication::{MessageHandler, PeerState};
pub use transport::{Envelope, LocalNetwork, TransportStats};

use chrono::{DateTime, Utc};
use consensus::{NodeId, PaxosId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use storage::{AddRequestKey, UpdateOperation, ValuesMap};

pub type RequestId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NameServerMessage {
    AddRecordRequest(AddRecordRequest),
    AddRecordConfirm(AddRecordConfirm),
    AddRecordComplete(AddRecordComplete),
    AddRecordAbort(AddRecordAbort),
    UpdateFieldRequest(UpdateFieldRequest),
    UpdateFieldConfirm(UpdateFieldConfirm),
    NewActiveSetStart(NewActiveSetStart),
    NewActiveSetStartForward(NewActiveSetStart),
    NewActiveSetStartResponse(NewActiveSetStartResponse),
    NewActiveSetStartConfirm(NewActiveSetStart),
    PreviousValueRequest(PreviousValueRequest),
    PreviousValueResponse(PreviousValueResponse),
    OldActiveSetStop(OldActiveSetStop),
    OldActiveSetStopConfirm(OldActiveSetStop),
}

impl NameServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NameServerMessage::AddRecordRequest(_) => "AddRecordRequest",
            NameServerMessage::AddRecordConfirm(_) => "AddRecordConfirm",
            NameServerMessage::AddRecordComplete(_) => "AddRecordComplete",
            NameServerMessage::AddRecordAbort(_) => "AddRecordAbort",
            NameServerMessage::UpdateFieldRequest(_) => "UpdateFieldRequest",
            NameServerMessage::UpdateFieldConfirm(_) => "UpdateFieldConfirm",
            NameServerMessage::NewActiveSetStart(_) => "NewActiveSetStart",
            NameServerMessage::NewActiveSetStartForward(_) => "NewActiveSetStartForward",
            NameServerMessage::NewActiveSetStartResponse(_) => "NewActiveSetStartResponse",
            NameServerMessage::NewActiveSetStartConfirm(_) => "NewActiveSetStartConfirm",
            NameServerMessage::PreviousValueRequest(_) => "PreviousValueRequest",
            NameServerMessage::PreviousValueResponse(_) => "PreviousValueResponse",
            NameServerMessage::OldActiveSetStop(_) => "OldActiveSetStop",
            NameServerMessage::OldActiveSetStopConfirm(_) => "OldActiveSetStopConfirm",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NameServerMessage::AddRecordRequest(m) => &m.name,
            NameServerMessage::AddRecordConfirm(m) => &m.name,
            NameServerMessage::AddRecordComplete(m) => &m.name,
            NameServerMessage::AddRecordAbort(m) => &m.name,
            NameServerMessage::UpdateFieldRequest(m) => &m.name,
            NameServerMessage::UpdateFieldConfirm(m) => &m.name,
            NameServerMessage::NewActiveSetStart(m)
            | NameServerMessage::NewActiveSetStartForward(m)
            | NameServerMessage::NewActiveSetStartConfirm(m) => &m.name,
            NameServerMessage::NewActiveSetStartResponse(m) => &m.name,
            NameServerMessage::PreviousValueRequest(m) => &m.name,
            NameServerMessage::PreviousValueResponse(m) => &m.name,
            NameServerMessage::OldActiveSetStop(m) | NameServerMessage::OldActiveSetStopConfirm(m) => &m.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRecordRequest {
    pub request_id: RequestId,
    pub origin: NodeId,
    pub name: String,
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRecordConfirm {
    pub request_id: RequestId,
    pub name: String,
    pub from: NodeId,
    pub accepted: bool,
    /// On a rejection, the pending add this controller holds instead. `None`
    /// when the rejection is final.
    pub holder: Option<AddRequestKey>,
}

/// Sent once a majority accepted; every controller then finalizes the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRecordComplete {
    pub request_id: RequestId,
    pub origin: NodeId,
    pub name: String,
    pub field: String,
    pub values: Vec<String>,
}

/// Sent by an origin whose add lost to a concurrent add; receivers drop the
/// pending record it created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRecordAbort {
    pub request_id: RequestId,
    pub origin: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFieldRequest {
    pub request_id: RequestId,
    pub origin: NodeId,
    pub name: String,
    pub field: String,
    pub operation: UpdateOperation,
    pub new_values: Vec<String>,
    pub old_values: Option<Vec<String>>,
    pub argument: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Applied,
    CompareFailed,
    InvalidName,
    /// The receiving node does not serve the name; carries the actives it knows of.
    NotActive(BTreeSet<NodeId>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFieldConfirm {
    pub request_id: RequestId,
    pub name: String,
    pub outcome: UpdateOutcome,
}

/// Announces a new active set; reused for forwarding and the final
/// confirmation to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActiveSetStart {
    pub name: String,
    pub controller: NodeId,
    pub coordinator: Option<NodeId>,
    pub old_actives: BTreeSet<NodeId>,
    pub new_actives: BTreeSet<NodeId>,
    pub old_paxos_id: PaxosId,
    pub new_paxos_id: PaxosId,
    pub previous_value: Option<ValuesMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActiveSetStartResponse {
    pub name: String,
    pub new_paxos_id: PaxosId,
    pub from: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousValueRequest {
    pub name: String,
    pub old_paxos_id: PaxosId,
    pub new_paxos_id: PaxosId,
    pub requester: NodeId,
    /// Requester's clock at send time, echoed back to measure the round trip.
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousValueResponse {
    pub name: String,
    pub old_paxos_id: PaxosId,
    pub new_paxos_id: PaxosId,
    pub from: NodeId,
    /// `None` when the responder no longer holds the requested instance's values.
    pub value: Option<ValuesMap>,
    pub request_sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OldActiveSetStop {
    pub name: String,
    pub paxos_id: PaxosId,
    pub controller: NodeId,
    pub receiver: NodeId,
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Node unreachable: {0}")]
    NodeUnreachable(NodeId),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub latency_hints: Vec<(NodeId, u64)>,
}
