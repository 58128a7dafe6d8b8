/*!
The store contract the persistor observes, and a reference implementation.

A [`Store`] owns the authoritative state. The persistor subscribes to it,
reads snapshots with [`Store::get_state`] after each notification, and reports
rehydration results back through [`Store::dispatch`].
*/

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Action type of the rehydrate event.
pub const REHYDRATE: &str = "persist/REHYDRATE";

/// Store notification callback.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Events the persistor dispatches to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistAction<S> {
    /// State reconstructed from storage
    Rehydrate { payload: S },
}

impl<S> PersistAction<S> {
    pub fn action_type(&self) -> &'static str {
        match self {
            PersistAction::Rehydrate { .. } => REHYDRATE,
        }
    }
}

/// Observable state container.
pub trait Store: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;

    /// Current snapshot
    fn get_state(&self) -> Self::State;

    /// Register `listener` to be called after every state change
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// Deliver a persistor event
    fn dispatch(&self, action: PersistAction<Self::State>);
}

/// Handle that removes a listener when dropped or explicitly unsubscribed.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

type Reducer<S> = Box<dyn Fn(&S, &PersistAction<S>) -> S + Send + Sync>;

struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Minimal in-process [`Store`].
///
/// Listeners run after the state lock is released, so they may read the
/// store. By default a rehydrate replaces the whole state with its payload;
/// [`with_reducer`](InMemoryStore::with_reducer) installs another policy.
pub struct InMemoryStore<S> {
    state: Mutex<S>,
    listeners: Arc<Listeners>,
    reducer: Reducer<S>,
    rehydrations: AtomicUsize,
}

impl<S: Clone + Send + Sync + 'static> InMemoryStore<S> {
    pub fn new(initial: S) -> Self {
        Self::with_reducer(initial, |_, action| match action {
            PersistAction::Rehydrate { payload } => payload.clone(),
        })
    }

    pub fn with_reducer<R>(initial: S, reducer: R) -> Self
    where
        R: Fn(&S, &PersistAction<S>) -> S + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(initial),
            listeners: Arc::new(Listeners {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
            reducer: Box::new(reducer),
            rehydrations: AtomicUsize::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the state through `update` and notify listeners
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&S) -> S,
    {
        {
            let mut state = self.lock_state();
            let next = update(&state);
            *state = next;
        }
        self.notify();
    }

    /// Replace the state and notify listeners
    pub fn set_state(&self, next: S) {
        self.update(|_| next);
    }

    /// Number of rehydrate actions dispatched so far
    pub fn rehydrate_count(&self) -> usize {
        self.rehydrations.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn notify(&self) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener();
        }
    }
}

impl<S: Clone + Send + Sync + 'static> Store for InMemoryStore<S> {
    type State = S;

    fn get_state(&self) -> S {
        self.lock_state().clone()
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));

        let listeners = Arc::clone(&self.listeners);
        Subscription::new(move || {
            listeners.lock().retain(|(entry, _)| *entry != id);
        })
    }

    fn dispatch(&self, action: PersistAction<S>) {
        if matches!(action, PersistAction::Rehydrate { .. }) {
            self.rehydrations.fetch_add(1, Ordering::SeqCst);
        }
        self.update(|state| (self.reducer)(state, &action));
    }
}
