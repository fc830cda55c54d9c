//! Concurrency-safe keyed registry shared by dispatchers and completion tasks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug)]
pub struct Registry<K, V> {
    entries: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for Registry<K, V> {
    fn clone(&self) -> Self {
        Self { entries: Arc::clone(&self.entries) }
    }
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Registry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous value.
    pub fn register(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Removes the entry; only one caller ever gets `Some` for a key.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    pub fn drain(&self) -> Vec<(K, V)> {
        self.entries.write().drain().collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
