//! Eviction policies for [`SearchCache`](crate::semantic::cache::SearchCache).

use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Chooses which entry leaves the cache when it is full.
pub trait EvictionPolicy: Send {
    /// A key was written (new entry or overwrite).
    fn record_insert(&mut self, key: &str);
    /// A key was read successfully.
    fn record_access(&mut self, key: &str);
    fn record_remove(&mut self, key: &str);
    /// Key that should be evicted next, if any.
    fn victim(&self) -> Option<String>;
    fn clear(&mut self);
}

/// Which policy a cache is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionKind {
    /// Oldest write goes first; reads do not refresh an entry.
    #[default]
    InsertionAge,
    /// Least recently read or written goes first.
    Lru,
}

impl EvictionKind {
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionKind::InsertionAge => Box::new(InsertionAge::default()),
            EvictionKind::Lru => Box::new(LeastRecentlyUsed::default()),
        }
    }
}

/// Keys in recency order; the least recent one is the eviction victim.
struct RecencyOrder {
    keys: LruCache<String, ()>,
}

impl Default for RecencyOrder {
    fn default() -> Self {
        Self {
            keys: LruCache::unbounded(),
        }
    }
}

impl RecencyOrder {
    /// Insert `key`, or move it to the most recent position.
    fn put(&mut self, key: &str) {
        self.keys.put(key.to_string(), ());
    }

    fn promote(&mut self, key: &str) {
        self.keys.promote(key);
    }

    fn remove(&mut self, key: &str) {
        self.keys.pop(key);
    }

    fn oldest(&self) -> Option<String> {
        self.keys.peek_lru().map(|(key, _)| key.clone())
    }

    fn clear(&mut self) {
        self.keys.clear();
    }
}

#[derive(Default)]
pub struct InsertionAge {
    order: RecencyOrder,
}

impl EvictionPolicy for InsertionAge {
    fn record_insert(&mut self, key: &str) {
        self.order.put(key);
    }

    fn record_access(&mut self, _key: &str) {}

    fn record_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn victim(&self) -> Option<String> {
        self.order.oldest()
    }

    fn clear(&mut self) {
        self.order.clear();
    }
}

#[derive(Default)]
pub struct LeastRecentlyUsed {
    order: RecencyOrder,
}

impl EvictionPolicy for LeastRecentlyUsed {
    fn record_insert(&mut self, key: &str) {
        self.order.put(key);
    }

    fn record_access(&mut self, key: &str) {
        self.order.promote(key);
    }

    fn record_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn victim(&self) -> Option<String> {
        self.order.oldest()
    }

    fn clear(&mut self) {
        self.order.clear();
    }
}
