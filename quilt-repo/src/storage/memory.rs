//! In-memory storage adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{StorageAdapter, StorageError, StorageKey, StoredChunk};

/// In-memory storage adapter.
///
/// Stores entries in a thread-safe ordered map. Clones share the same
/// underlying map, so a "restarted" repo handed a clone sees the data the
/// previous repo persisted. Not durable across the process.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    entries: Arc<Mutex<BTreeMap<StorageKey, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create a new empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the adapter holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.clone(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<StoredChunk>, StorageError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| StoredChunk {
                key: key.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
