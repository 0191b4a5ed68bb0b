// Bounded set of already-processed incoming fact ids.
//
// Redelivered frames (hub retries, reconnect replays) are dropped before
// listener dispatch. When the set is full the oldest id is forgotten first,
// so memory stays bounded on long-lived connections.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// How many ids are remembered when no capacity is given.
pub const DEFAULT_SEEN_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct SeenIds {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl SeenIds {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { order: VecDeque::new(), ids: HashSet::new(), capacity: capacity.max(1) }
    }

    /// Records the id. Returns `false` when it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new()
    }
}
