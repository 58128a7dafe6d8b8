/*!
State shape accessors.

The engine never touches a concrete state container directly. It iterates,
reads and writes substates through a [`StateAccessor`], so any container shape
can be persisted as long as an accessor exists for it. Two accessors ship with
the crate: [`MapAccessor`] for sorted maps (the default) and [`PairsAccessor`]
for insertion-ordered key/value lists.
*/

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The portion of state addressed by one top-level key.
///
/// Substates are compared by pointer identity, never structurally: replacing a
/// substate with a new `Arc` marks it dirty, mutating through a shared one does
/// not.
pub type Substate = Arc<Value>;

/// Default state container: substates keyed and iterated in sorted key order.
pub type MapState = BTreeMap<String, Substate>;

/// Insertion-ordered state container.
pub type PairsState = Vec<(String, Substate)>;

/// Capability interface over a concrete state-container shape.
pub trait StateAccessor: Send + Sync + 'static {
    /// The state container type
    type State: Clone + Send + Sync + 'static;

    /// An empty container, used as the initial snapshot and as the seed for
    /// serial rehydration
    fn init(&self) -> Self::State;

    /// Keys of `state`, in the order the engine should visit them
    fn keys(&self, state: &Self::State) -> Vec<String>;

    /// The substate stored under `key`, if any
    fn get(&self, state: &Self::State, key: &str) -> Option<Substate>;

    /// Store `value` under `key`, returning the updated container
    fn set(&self, state: Self::State, key: &str, value: Substate) -> Self::State;
}

/// Identity comparison of two optional substates.
pub fn same_substate(a: Option<&Substate>, b: Option<&Substate>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Accessor for [`MapState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MapAccessor;

impl MapAccessor {
    /// Render a map state as a JSON object
    pub fn to_value(state: &MapState) -> Value {
        let object: Map<String, Value> = state
            .iter()
            .map(|(key, value)| (key.clone(), value.as_ref().clone()))
            .collect();
        Value::Object(object)
    }

    /// Build a map state from a JSON object; non-object values yield an empty state
    pub fn from_value(value: Value) -> MapState {
        match value {
            Value::Object(object) => object
                .into_iter()
                .map(|(key, value)| (key, Arc::new(value)))
                .collect(),
            _ => MapState::new(),
        }
    }
}

impl StateAccessor for MapAccessor {
    type State = MapState;

    fn init(&self) -> MapState {
        MapState::new()
    }

    fn keys(&self, state: &MapState) -> Vec<String> {
        state.keys().cloned().collect()
    }

    fn get(&self, state: &MapState, key: &str) -> Option<Substate> {
        state.get(key).cloned()
    }

    fn set(&self, mut state: MapState, key: &str, value: Substate) -> MapState {
        state.insert(key.to_string(), value);
        state
    }
}

/// Accessor for [`PairsState`]. Setting an existing key replaces it in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairsAccessor;

impl StateAccessor for PairsAccessor {
    type State = PairsState;

    fn init(&self) -> PairsState {
        Vec::new()
    }

    fn keys(&self, state: &PairsState) -> Vec<String> {
        state.iter().map(|(key, _)| key.clone()).collect()
    }

    fn get(&self, state: &PairsState, key: &str) -> Option<Substate> {
        state
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| Arc::clone(value))
    }

    fn set(&self, mut state: PairsState, key: &str, value: Substate) -> PairsState {
        match state.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => state.push((key.to_string(), value)),
        }
        state
    }
}
