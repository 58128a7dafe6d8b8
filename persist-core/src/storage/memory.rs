/*!
In-memory storage adapter.
*/

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{PersistedRecord, StorageBackend};
use crate::Result;

/// Memory-based storage adapter
///
/// Records live in a shared map, so clones of a `MemoryStorage` see the same
/// records. Useful for tests and for embedding the engine where durability is
/// provided elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, PersistedRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, PersistedRecord>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every stored record, keyed by storage key
    pub fn snapshot(&self) -> BTreeMap<String, PersistedRecord> {
        self.records().clone()
    }

    /// Insert a record directly, bypassing the async interface
    pub fn insert(&self, key: impl Into<String>, record: PersistedRecord) {
        self.records().insert(key.into(), record);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<PersistedRecord>> {
        Ok(self.records().get(key).cloned())
    }

    async fn set_item(&self, key: &str, record: PersistedRecord) -> Result<()> {
        self.records().insert(key.to_string(), record);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.records().remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.records().keys().cloned().collect())
    }
}
