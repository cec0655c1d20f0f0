use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::{Result, StorageError, StoreStats};

/// A mutation applied atomically to one record. Returns whether it changed anything.
pub type Mutation<'a, R> = Box<dyn FnOnce(&mut R) -> bool + Send + 'a>;

/// Key-structured record storage.
///
/// `update` runs its mutation while holding that name's entry exclusively, so
/// two mutations of the same name never interleave. Different names never
/// contend with each other.
#[async_trait]
pub trait RecordStore<R>: Send + Sync
where
    R: Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<R>>;

    /// Inserts a record that must not exist yet.
    async fn insert(&self, name: &str, record: R) -> Result<()>;

    async fn put(&self, name: &str, record: R) -> Result<()>;

    /// Returns `None` when no record exists, otherwise the mutation's result.
    async fn update<'a>(&self, name: &str, mutation: Mutation<'a, R>) -> Result<Option<bool>>;

    async fn remove(&self, name: &str) -> Result<Option<R>>;

    async fn scan_all(&self) -> Result<Vec<R>>;

    async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.get(name).await?.is_some())
    }
}

/// In-memory [`RecordStore`] with one lock per name.
pub struct MemoryRecordStore<R> {
    label: &'static str,
    records: RwLock<HashMap<String, Arc<Mutex<R>>>>,
    stats: RwLock<StoreStats>,
}

impl<R> MemoryRecordStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            records: RwLock::new(HashMap::new()),
            stats: RwLock::new(StoreStats::default()),
        }
    }

    pub async fn stats(&self) -> StoreStats {
        let mut stats = self.stats.read().await.clone();
        stats.records = self.records.read().await.len() as u64;
        stats
    }

    async fn entry(&self, name: &str) -> Option<Arc<Mutex<R>>> {
        self.records.read().await.get(name).cloned()
    }
}

#[async_trait]
impl<R> RecordStore<R> for MemoryRecordStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<R>> {
        self.stats.write().await.reads += 1;
        match self.entry(name).await {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn insert(&self, name: &str, record: R) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(name) {
            return Err(StorageError::RecordExists(name.to_string()));
        }
        records.insert(name.to_string(), Arc::new(Mutex::new(record)));
        drop(records);

        self.stats.write().await.writes += 1;
        tracing::debug!("Inserted {} record {}", self.label, name);
        Ok(())
    }

    async fn put(&self, name: &str, record: R) -> Result<()> {
        match self.entry(name).await {
            Some(entry) => *entry.lock().await = record,
            None => {
                self.records
                    .write()
                    .await
                    .insert(name.to_string(), Arc::new(Mutex::new(record)));
            }
        }
        self.stats.write().await.writes += 1;
        Ok(())
    }

    async fn update<'a>(&self, name: &str, mutation: Mutation<'a, R>) -> Result<Option<bool>> {
        let entry = match self.entry(name).await {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let changed = {
            let mut record = entry.lock().await;
            mutation(&mut record)
        };

        if changed {
            self.stats.write().await.writes += 1;
        }
        Ok(Some(changed))
    }

    async fn remove(&self, name: &str) -> Result<Option<R>> {
        let removed = self.records.write().await.remove(name);
        match removed {
            Some(entry) => {
                tracing::debug!("Removed {} record {}", self.label, name);
                self.stats.write().await.writes += 1;
                Ok(Some(entry.lock().await.clone()))
            }
            None => Ok(None),
        }
    }

    async fn scan_all(&self) -> Result<Vec<R>> {
        let entries: Vec<Arc<Mutex<R>>> = self.records.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_rejects_existing_names() {
        let store = MemoryRecordStore::new("test");
        store.insert("a", 1u64).await.unwrap();
        assert!(matches!(store.insert("a", 2).await, Err(StorageError::RecordExists(_))));
        assert_eq!(store.get("a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn update_is_atomic_per_name() {
        let store = Arc::new(MemoryRecordStore::new("test"));
        store.insert("counter", 0u64).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    store
                        .update("counter", Box::new(|value: &mut u64| {
                            *value += 1;
                            true
                        }))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("counter").await.unwrap(), Some(320));
        assert_eq!(store.update("missing", Box::new(|_: &mut u64| true)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_and_scan() {
        let store = MemoryRecordStore::new("test");
        store.put("a", 1u64).await.unwrap();
        store.put("b", 2u64).await.unwrap();
        store.put("a", 3u64).await.unwrap();

        let mut all = store.scan_all().await.unwrap();
        all.sort();
        assert_eq!(all, vec![2, 3]);

        assert_eq!(store.remove("a").await.unwrap(), Some(3));
        assert_eq!(store.remove("a").await.unwrap(), None);
        assert!(!store.contains("a").await.unwrap());
        assert_eq!(store.stats().await.records, 1);
    }
}
