/*!
Debounced, single-flight write scheduling.

Every store notification runs change detection and queues dirty keys. The
first key queued while the scheduler is idle spawns a drain task that ticks
once per debounce interval. Each tick pops at most one key and hands it to a
write job (transforms, serialization, storage). While a write job runs, ticks
are no-ops, so at most one key is being persisted at any moment. The drain task
ends on the first tick that finds the queue empty.
*/

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::PersistConfig;
use crate::detect::{detect_changes, DirtyQueue};
use crate::filter::KeyFilter;
use crate::rehydrate::Rehydrator;
use crate::serializer::{SerializationPolicy, Serializer};
use crate::state::{StateAccessor, Substate};
use crate::storage::{storage_key, PersistedRecord, StorageBackend};
use crate::store::Store;
use crate::transform::TransformPipeline;
use crate::{PersistError, Result};

/// Mutable state owned by one persistor instance.
pub(crate) struct PersistorState<S> {
    /// Snapshot seen at the previous (non-paused) notification
    pub(crate) last_state: S,
    pub(crate) paused: bool,
    pub(crate) queue: DirtyQueue,
    /// Drain task; `Some` while draining
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Single-flight flag
    pub(crate) writing: bool,
    /// Set after a fatal error; the persistor ignores further changes
    pub(crate) halted: Option<String>,
}

enum Tick {
    Busy,
    Idle,
    Write(String),
}

/// Fires every `period`, or after a cooperative yield when `period` is zero.
struct Ticker {
    interval: Option<Interval>,
}

impl Ticker {
    fn new(period: Duration) -> Self {
        if period.is_zero() {
            return Self { interval: None };
        }
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Some(interval),
        }
    }

    fn is_immediate(&self) -> bool {
        self.interval.is_none()
    }

    async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => tokio::task::yield_now().await,
        }
    }
}

/// Shared core of a persistor: configuration plus [`PersistorState`].
pub(crate) struct Engine<St: Store, A: StateAccessor<State = St::State>> {
    pub(crate) store: Arc<St>,
    pub(crate) accessor: A,
    pub(crate) filter: KeyFilter,
    pub(crate) pipeline: TransformPipeline,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) key_prefix: String,
    pub(crate) async_transforms: bool,
    debounce: Duration,
    write_timeout: Option<Duration>,
    policy: SerializationPolicy,
    runtime: Handle,
    state: Mutex<PersistorState<St::State>>,
    write_done: Notify,
    pub(crate) drained: Notify,
}

impl<St, A> Engine<St, A>
where
    St: Store,
    A: StateAccessor<State = St::State>,
{
    pub(crate) fn new(store: Arc<St>, config: PersistConfig<A>, runtime: Handle) -> Self {
        let serializer = config.resolved_serializer();
        let PersistConfig {
            settings,
            storage,
            transforms,
            accessor,
            ..
        } = config;

        let last_state = accessor.init();
        Self {
            store,
            filter: settings.filter(),
            pipeline: TransformPipeline::new(transforms),
            serializer,
            storage,
            key_prefix: settings.key_prefix.clone(),
            async_transforms: settings.async_transforms,
            debounce: settings.debounce(),
            write_timeout: settings.write_timeout(),
            policy: settings.serialization_errors,
            runtime,
            state: Mutex::new(PersistorState {
                last_state,
                paused: false,
                queue: DirtyQueue::new(),
                timer: None,
                writing: false,
                halted: None,
            }),
            write_done: Notify::new(),
            drained: Notify::new(),
            accessor,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PersistorState<St::State>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn rehydrator(&self) -> Rehydrator {
        Rehydrator::new(Arc::clone(&self.serializer), self.pipeline.clone())
    }

    /// Store notification handler: queue dirty keys and arm the drain task.
    pub(crate) fn on_change(self: &Arc<Self>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.paused || state.halted.is_some() {
            return;
        }
        // Read under the lock so concurrent notifications advance the snapshot in order
        let current = self.store.get_state();

        let added = detect_changes(
            &self.accessor,
            &self.filter,
            &state.last_state,
            &current,
            &mut state.queue,
        );
        if added > 0 {
            debug!(added, queued = state.queue.len(), "Queued dirty keys");
        }

        if !state.queue.is_empty() && state.timer.is_none() {
            debug!(debounce = ?self.debounce, "Write scheduler draining");
            state.timer = Some(self.runtime.spawn(Arc::clone(self).drain()));
        }

        state.last_state = current;
    }

    async fn drain(self: Arc<Self>) {
        let mut ticker = Ticker::new(self.debounce);
        loop {
            ticker.tick().await;
            match self.next_tick() {
                Tick::Busy => {
                    // Without a debounce period, wait for the write instead of spinning
                    if ticker.is_immediate() {
                        self.write_done.notified().await;
                    }
                }
                Tick::Idle => break,
                Tick::Write(key) => {
                    let engine = Arc::clone(&self);
                    self.runtime.spawn(async move { engine.write_key(key).await });
                }
            }
        }
    }

    fn next_tick(&self) -> Tick {
        let mut state = self.lock();
        if state.writing {
            return Tick::Busy;
        }
        match state.queue.pop() {
            Some(key) => {
                state.writing = true;
                Tick::Write(key)
            }
            None => {
                state.timer = None;
                drop(state);
                debug!("Write queue drained; scheduler idle");
                self.drained.notify_waiters();
                Tick::Idle
            }
        }
    }

    async fn write_key(self: Arc<Self>, key: String) {
        // Last write wins: read the value at pop time, not at detection time
        let current = self.store.get_state();
        let value = self.accessor.get(&current, &key);
        drop(current);

        match AssertUnwindSafe(self.persist_key(&key, value))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.halt(&key, e),
            Err(panic) => {
                let error = PersistError::transform(&key, panic_message(panic.as_ref()));
                warn!(key = %key, error = %error, "Write job panicked; key skipped");
                note_skipped();
            }
        }

        self.lock().writing = false;
        self.write_done.notify_one();
    }

    /// Transform, serialize and store one substate.
    ///
    /// Only a fatal serialization failure is returned; every other failure is
    /// logged and the key counts as processed.
    async fn persist_key(&self, key: &str, value: Option<Substate>) -> Result<()> {
        let Some(value) = value else {
            debug!(key = %key, "Key no longer in state; nothing to write");
            note_skipped();
            return Ok(());
        };

        let value = value.as_ref().clone();
        let transformed = if self.async_transforms {
            self.pipeline.apply_inbound_async(value, key).await
        } else {
            self.pipeline.apply_inbound(value, key)
        };
        let Some(end_state) = transformed else {
            debug!(key = %key, "Transforms produced no value; skipping write");
            note_skipped();
            return Ok(());
        };

        let record = match self.serializer.serialize(&end_state) {
            Ok(record) => record,
            Err(e) => {
                let error = PersistError::serialization(key, e.to_string());
                if self.policy == SerializationPolicy::Strict {
                    return Err(error);
                }
                warn!(key = %key, error = %error, "Omitting record that could not be serialized");
                note_skipped();
                return Ok(());
            }
        };

        let target = storage_key(&self.key_prefix, key);
        let started = std::time::Instant::now();
        match self.store_record(&target, record).await {
            Ok(()) => {
                debug!(key = %key, storage_key = %target, "Stored record");
                note_write(started.elapsed(), true);
            }
            Err(e) => {
                warn!(key = %key, storage_key = %target, error = %e, "Error storing data for key");
                note_write(started.elapsed(), false);
            }
        }
        Ok(())
    }

    async fn store_record(&self, target: &str, record: PersistedRecord) -> Result<()> {
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, self.storage.set_item(target, record))
                .await
                .map_err(|_| PersistError::Timeout {
                    key: target.to_string(),
                    after: limit,
                })?,
            None => self.storage.set_item(target, record).await,
        }
    }

    fn halt(&self, key: &str, error: PersistError) {
        error!(key = %key, error = %error, "Fatal serialization failure; persistor halted");
        let mut state = self.lock();
        state.queue.clear();
        state.halted = Some(error.to_string());
    }

    /// Stop the drain task, if any
    pub(crate) fn disarm(&self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(feature = "metrics")]
fn note_write(duration: Duration, ok: bool) {
    let metrics = crate::observability::PersistMetrics::global();
    if ok {
        metrics.record_write(duration);
    } else {
        metrics.record_write_error(duration);
    }
}

#[cfg(not(feature = "metrics"))]
fn note_write(_duration: Duration, _ok: bool) {}

#[cfg(feature = "metrics")]
fn note_skipped() {
    crate::observability::PersistMetrics::global().record_skipped_write();
}

#[cfg(not(feature = "metrics"))]
fn note_skipped() {}
