/*!
# Persist Core Engine

Incremental state persistence for observable stores.

A persistor watches a [`Store`] whose state is a keyed collection of substates
and keeps a storage backend in sync with it:

- Change detection by substate identity, with whitelist/blacklist filtering
- A debounced, single-flight write scheduler (one key in flight at a time)
- A bidirectional transform pipeline applied on write and on read
- Serial rehydration that tolerates corrupt records
- Purging of stored records
- Pluggable asynchronous storage backends (in-memory and local filesystem)

## Architecture

The core follows hexagonal architecture principles:
- Detection, scheduling and transforms are independent of any storage medium
- Storage, serialization and the store itself are ports with swappable adapters

## Usage

```rust,no_run
use std::sync::Arc;
use std::time::Duration;
use persist_core::{
    create_persistor, InMemoryStore, LocalFileStorage, MapAccessor, MapState, PersistConfig,
};
use serde_json::json;

# async fn demo() -> persist_core::Result<()> {
let store = Arc::new(InMemoryStore::new(MapState::new()));
let config = PersistConfig::new(LocalFileStorage::with_base_dir("./persisted"))
    .blacklist(["session"])
    .debounce(Duration::from_millis(50));
let persistor = create_persistor(Arc::clone(&store), config)?;

// Load what was stored previously
persistor.restore().await?;

// Changes are written in the background
store.set_state(MapAccessor::from_value(json!({"todos": ["write docs"]})));
persistor.flush().await?;
# Ok(())
# }
```
*/

pub mod config;
pub mod detect;
pub mod error;
pub mod filter;
pub mod observability;
pub mod persistor;
pub mod purge;
pub mod rehydrate;
pub(crate) mod scheduler;
pub mod serializer;
pub mod state;
pub mod storage;
pub mod store;
pub mod transform;


pub use config::{PersistConfig, PersistSettings, DEFAULT_KEY_PREFIX};
pub use detect::{detect_changes, DirtyQueue};
pub use error::{PersistError, Result};
pub use filter::KeyFilter;
pub use observability::{init_default_observability, init_observability};
pub use persistor::{create_persistor, Persistor};
pub use purge::{get_stored_state, purge_stored_state};
pub use rehydrate::{RehydrateInput, Rehydrator};
pub use serializer::{JsonSerializer, PassthroughSerializer, SerializationPolicy, Serializer};
pub use state::{MapAccessor, MapState, PairsAccessor, PairsState, StateAccessor, Substate};
#[cfg(feature = "local")]
pub use storage::LocalFileStorage;
pub use storage::{storage_key, MemoryStorage, PersistedRecord, StorageBackend};
pub use store::{InMemoryStore, Listener, PersistAction, Store, Subscription, REHYDRATE};
pub use transform::{
    create_async_transform, create_transform, FnTransform, IntegrityTransform, Transform,
    TransformPipeline,
};

#[cfg(feature = "metrics")]
pub use observability::PersistMetrics;
