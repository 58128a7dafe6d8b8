/*!
Change detection between consecutive store notifications.
*/

use std::collections::{HashSet, VecDeque};

use crate::filter::KeyFilter;
use crate::state::{same_substate, StateAccessor};

/// FIFO of keys waiting to be written. A key is held at most once until it is
/// popped.
#[derive(Debug, Default, Clone)]
pub struct DirtyQueue {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl DirtyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key` unless it is already queued. Returns true if it was added.
    pub fn push(&mut self, key: &str) -> bool {
        if self.members.contains(key) {
            return false;
        }
        self.members.insert(key.to_string());
        self.order.push_back(key.to_string());
        true
    }

    /// Remove and return the earliest queued key
    pub fn pop(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.members.remove(&key);
        Some(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Queued keys in write order
    pub fn keys(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

/// Queue every allowed key whose substate changed identity between `previous`
/// and `current`.
///
/// Keys are visited in the accessor's order for `current`, so keys removed
/// from state are never queued. Returns the number of keys added.
pub fn detect_changes<A: StateAccessor>(
    accessor: &A,
    filter: &KeyFilter,
    previous: &A::State,
    current: &A::State,
    queue: &mut DirtyQueue,
) -> usize {
    let mut added = 0;
    for key in accessor.keys(current) {
        if !filter.allows(&key) {
            continue;
        }
        let before = accessor.get(previous, &key);
        let after = accessor.get(current, &key);
        if same_substate(before.as_ref(), after.as_ref()) {
            continue;
        }
        if queue.push(&key) {
            added += 1;
        }
    }
    added
}
