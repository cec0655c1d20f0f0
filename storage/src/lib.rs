mod record;
mod store;
mod values;

pub use record::{ActiveRecord, AddRequestKey, PaxosStatus, ReplicaControllerRecord};
pub use store::{MemoryRecordStore, Mutation, RecordStore};
pub use values::{UpdateOperation, ValuesMap, NULL_VALUE};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: u64,
    pub reads: u64,
    pub writes: u64,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Record already exists: {0}")]
    RecordExists(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
