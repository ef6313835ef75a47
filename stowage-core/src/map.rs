//! Backing map contract for [`Store`](crate::Store).
//!
//! The store never touches its entries directly; it goes through a
//! [`KeyValueMap`] produced by a [`MapFactory`]. The default is
//! [`MemoryMap`], an insertion-ordered in-process map. Other implementations
//! (an observable map feeding a UI, a map shared between processes) plug in
//! through [`StoreBuilder::map_factory`](crate::StoreBuilder::map_factory).
//!
//! Values are handed out by clone. Store `Arc<T>` when identity matters:
//! equality is then reference equality, and nothing is deep-compared.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::StoreKey;

/// Storage of store entries.
///
/// Implementations must be safe to share between tasks. Every method takes
/// `&self`; interior mutability is the implementation's concern.
pub trait KeyValueMap<V>: Send + Sync {
    /// Returns a clone of the value stored under `key`.
    fn get(&self, key: &StoreKey) -> Option<V>;

    /// Inserts or replaces the value under `key`.
    fn insert(&self, key: StoreKey, value: V);

    /// Removes `key`, returning the previous value.
    fn remove(&self, key: &StoreKey) -> Option<V>;

    /// Whether `key` is present.
    fn contains(&self, key: &StoreKey) -> bool;

    /// Removes every entry.
    fn clear(&self);

    /// Snapshot of all entries in iteration order.
    fn entries(&self) -> Vec<(StoreKey, V)>;

    /// Snapshot of all keys in iteration order.
    fn keys(&self) -> Vec<StoreKey>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the map is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory producing the backing map of a new store.
pub type MapFactory<V> = Arc<dyn Fn() -> Box<dyn KeyValueMap<V>> + Send + Sync>;

/// Returns the factory for [`MemoryMap`].
pub fn memory_map_factory<V>() -> MapFactory<V>
where
    V: Clone + Send + Sync + 'static,
{
    Arc::new(|| Box::new(MemoryMap::<V>::new()) as Box<dyn KeyValueMap<V>>)
}

/// In-memory map preserving insertion order.
#[derive(Debug)]
pub struct MemoryMap<V> {
    entries: RwLock<IndexMap<StoreKey, V>>,
}

impl<V> MemoryMap<V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }
}

impl<V> Default for MemoryMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> KeyValueMap<V> for MemoryMap<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &StoreKey) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    fn insert(&self, key: StoreKey, value: V) {
        self.entries.write().insert(key, value);
    }

    fn remove(&self, key: &StoreKey) -> Option<V> {
        self.entries.write().shift_remove(key)
    }

    fn contains(&self, key: &StoreKey) -> bool {
        self.entries.read().contains_key(key)
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn entries(&self) -> Vec<(StoreKey, V)> {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn keys(&self) -> Vec<StoreKey> {
        self.entries.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
