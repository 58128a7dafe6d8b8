/*!
The persistor: an engine instance bound to one store.

A persistor subscribes to a [`Store`], writes the substates that change to its
storage backend, and reconstructs state from storage on demand.
*/

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::PersistConfig;
use crate::purge::{get_stored_state, purge_stored_state};
use crate::rehydrate::{RehydrateInput, Rehydrator};
use crate::scheduler::Engine;
use crate::state::{MapAccessor, StateAccessor};
use crate::store::{PersistAction, Store, Subscription};
use crate::{PersistError, Result};

/// Handle to a running persistor.
///
/// Dropping the handle unsubscribes from the store and stops the write
/// scheduler. A write already handed to the storage backend still completes.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use persist_core::{create_persistor, InMemoryStore, MapState, MemoryStorage, PersistConfig};
///
/// # async fn demo() -> persist_core::Result<()> {
/// let store = Arc::new(InMemoryStore::new(MapState::new()));
/// let config = PersistConfig::new(MemoryStorage::new()).blacklist(["session"]);
/// let persistor = create_persistor(Arc::clone(&store), config)?;
///
/// // Restore whatever was stored last time, then keep storage in sync
/// persistor.restore().await?;
/// persistor.flush().await?;
/// # Ok(())
/// # }
/// ```
pub struct Persistor<St, A = MapAccessor>
where
    St: Store,
    A: StateAccessor<State = St::State>,
{
    engine: Arc<Engine<St, A>>,
    rehydrator: Rehydrator,
    _subscription: Subscription,
}

/// Create a persistor for `store`.
///
/// Must be called from within a Tokio runtime; the write scheduler runs on it.
///
/// # Errors
/// * `PersistError::Validation` - If the settings are invalid
/// * `PersistError::Configuration` - If no Tokio runtime is available
pub fn create_persistor<St, A>(store: Arc<St>, config: PersistConfig<A>) -> Result<Persistor<St, A>>
where
    St: Store,
    A: StateAccessor<State = St::State>,
{
    config.settings.validate()?;
    let runtime = Handle::try_current().map_err(|_| {
        PersistError::configuration("create_persistor must be called within a Tokio runtime")
    })?;

    let engine = Arc::new(Engine::new(Arc::clone(&store), config, runtime));
    let rehydrator = engine.rehydrator();

    let weak = Arc::downgrade(&engine);
    let subscription = store.subscribe(Arc::new(move || {
        if let Some(engine) = weak.upgrade() {
            engine.on_change();
        }
    }));

    info!(
        key_prefix = %engine.key_prefix,
        transforms = engine.pipeline.len(),
        "Persistor created"
    );

    Ok(Persistor {
        engine,
        rehydrator,
        _subscription: subscription,
    })
}

impl<St, A> Persistor<St, A>
where
    St: Store,
    A: StateAccessor<State = St::State>,
{
    /// Reconstruct state and deliver it to the store.
    ///
    /// Serial input is decoded record by record; records that fail are left
    /// out. Assembled input is passed through unchanged. Either way the store
    /// receives exactly one rehydrate action carrying the returned state.
    ///
    /// # Errors
    /// * `PersistError::Configuration` - If serial input is combined with async
    ///   transforms; nothing is dispatched in that case
    pub fn rehydrate(&self, input: RehydrateInput<St::State>) -> Result<St::State> {
        let state = match input {
            RehydrateInput::Serial(records) => {
                if self.engine.async_transforms {
                    return Err(PersistError::configuration(
                        "async transforms are not supported with serial rehydration",
                    ));
                }
                debug!(records = records.len(), "Rehydrating from serialized records");
                self.rehydrator
                    .rehydrate_records(&self.engine.accessor, records)
            }
            RehydrateInput::State(state) => state,
        };

        self.engine.store.dispatch(PersistAction::Rehydrate {
            payload: state.clone(),
        });
        Ok(state)
    }

    /// Load this persistor's records from storage and rehydrate them serially
    pub async fn restore(&self) -> Result<St::State> {
        let records = get_stored_state(
            self.engine.storage.as_ref(),
            &self.engine.key_prefix,
            &self.engine.filter,
        )
        .await?;
        self.rehydrate(RehydrateInput::Serial(records))
    }

    /// Stop queueing changes. Keys already queued are still written.
    pub fn pause(&self) {
        self.engine.lock().paused = true;
    }

    /// Resume queueing changes
    pub fn resume(&self) {
        self.engine.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.engine.lock().paused
    }

    /// Remove stored records: the named keys, or every record under this
    /// persistor's key prefix when `keys` is `None`
    pub async fn purge(&self, keys: Option<&[String]>) -> Result<()> {
        purge_stored_state(self.engine.storage.as_ref(), &self.engine.key_prefix, keys).await
    }

    /// Wait until every queued key has been processed.
    ///
    /// # Errors
    /// * `PersistError::Halted` - If a fatal error stopped the persistor
    pub async fn flush(&self) -> Result<()> {
        loop {
            let drained = self.engine.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            {
                let state = self.engine.lock();
                if let Some(reason) = &state.halted {
                    return Err(PersistError::Halted(reason.clone()));
                }
                if state.timer.is_none() && !state.writing {
                    return Ok(());
                }
            }

            drained.await;
        }
    }

    /// Keys waiting to be written, in write order
    pub fn pending_keys(&self) -> Vec<String> {
        self.engine.lock().queue.keys()
    }

    /// True when nothing is queued or being written
    pub fn is_idle(&self) -> bool {
        let state = self.engine.lock();
        state.timer.is_none() && !state.writing
    }

    pub fn key_prefix(&self) -> &str {
        &self.engine.key_prefix
    }
}

impl<St, A> Drop for Persistor<St, A>
where
    St: Store,
    A: StateAccessor<State = St::State>,
{
    fn drop(&mut self) {
        self.engine.disarm();
    }
}
