use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{NodeId, PaxosId};

/// One committed log position, delivered to every live member in slot order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub paxos_id: PaxosId,
    pub slot: u64,
    pub entry: Bytes,
    pub stop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub paxos_id: PaxosId,
    pub members: BTreeSet<NodeId>,
    pub first_slot: u64,
    pub next_slot: u64,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub slot: u64,
    pub entry: Bytes,
    pub stop: bool,
}

impl LogEntry {
    pub(crate) fn to_decision(&self, paxos_id: &PaxosId) -> Decision {
        Decision {
            paxos_id: paxos_id.clone(),
            slot: self.slot,
            entry: self.entry.clone(),
            stop: self.stop,
        }
    }
}
