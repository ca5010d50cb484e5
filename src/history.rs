//! Append-only history buffers with a cap-and-trim eviction policy.
//!
//! When a push takes the buffer past `capacity`, the oldest entries are
//! dropped until only the newest `trim_to` remain. With the engine defaults
//! (1000 / 500) this means the buffer shrinks in large steps rather than
//! evicting one entry per push.

use parking_lot::RwLock;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct BoundedHistory<T> {
    capacity: usize,
    trim_to: usize,
    items: RwLock<VecDeque<T>>,
}

impl<T: Clone> BoundedHistory<T> {
    pub fn new(capacity: usize, trim_to: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            trim_to: trim_to.min(capacity),
            items: RwLock::new(VecDeque::new()),
        }
    }

    /// Append an entry, returning how many old entries were evicted.
    pub fn push(&self, item: T) -> usize {
        let mut items = self.items.write();
        items.push_back(item);
        if items.len() > self.capacity {
            let evicted = items.len() - self.trim_to;
            items.drain(..evicted);
            evicted
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().iter().cloned().collect()
    }

    /// The newest `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        self.items.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn clear(&self) {
        self.items.write().clear();
    }
}
