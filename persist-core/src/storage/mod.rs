/*!
Storage backends for persisted records.

This module defines the storage abstraction (port) the engine writes through,
and in-process implementations (adapters). The engine is indifferent to how a
backend stores records; it only relies on the asynchronous get/set/remove and
key-enumeration operations of [`StorageBackend`].
*/

#[cfg(feature = "local")]
pub mod local;
pub mod memory;

use crate::{PersistError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque value stored under a storage key.
///
/// Encoded records hold serializer output; raw records hold values that pass
/// through storage un-encoded when serialization is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PersistedRecord {
    Encoded(String),
    Raw(Value),
}

impl PersistedRecord {
    /// Short label for the record kind
    pub fn kind(&self) -> &'static str {
        match self {
            PersistedRecord::Encoded(_) => "encoded",
            PersistedRecord::Raw(_) => "raw",
        }
    }

    /// Approximate stored size in bytes
    pub fn size_hint(&self) -> usize {
        match self {
            PersistedRecord::Encoded(text) => text.len(),
            PersistedRecord::Raw(value) => value.to_string().len(),
        }
    }
}

/// Derive the storage key for a substate key.
///
/// The result is the prefix immediately followed by the key, byte for byte,
/// so records written by earlier versions stay readable.
pub fn storage_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

/// Asynchronous key-value storage the persistor writes to.
///
/// Key enumeration is available under two names: implement either
/// [`get_all_keys`](StorageBackend::get_all_keys) or
/// [`keys`](StorageBackend::keys). The engine always calls `get_all_keys`,
/// which falls back to `keys` by default.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the record stored under `key`, or `None` if there is none
    async fn get_item(&self, key: &str) -> Result<Option<PersistedRecord>>;

    /// Store `record` under `key`, replacing any previous record
    async fn set_item(&self, key: &str, record: PersistedRecord) -> Result<()>;

    /// Remove the record stored under `key`. Removing a missing key succeeds.
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// Every key currently stored
    async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.keys().await
    }

    /// Alternate name for key enumeration
    async fn keys(&self) -> Result<Vec<String>> {
        Err(PersistError::storage(
            "storage backend does not support key enumeration",
        ))
    }
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    async fn get_item(&self, key: &str) -> Result<Option<PersistedRecord>> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, record: PersistedRecord) -> Result<()> {
        (**self).set_item(key, record).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key).await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        (**self).get_all_keys().await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        (**self).keys().await
    }
}

// Re-export types for convenience
#[cfg(feature = "local")]
pub use local::LocalFileStorage;
pub use memory::MemoryStorage;
