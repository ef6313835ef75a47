//! The observable key-value store.
//!
//! [`Store`] is the canonical in-memory cache mutated by the application and
//! observed by policies. It owns no network or fetch logic: it reads and
//! writes its [`KeyValueMap`], optionally routes every write through a
//! `mutate` hook (batching, transactions), and broadcasts a [`StoreEvent`]
//! for each change to anyone who called [`Store::subscribe`].
//!
//! ```
//! use stowage_core::{Store, StoreKey};
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Contact { id: u64, name: String }
//!
//! let store = Store::<Contact>::builder()
//!     .index_by(|contact: &Contact| Some(StoreKey::from(contact.id)))
//!     .build();
//!
//! let key = store.sync(Contact { id: 7, name: "Ada".into() });
//! assert_eq!(key, Some(StoreKey::from(7)));
//! assert_eq!(store.get(7).map(|c| c.name), Some("Ada".to_string()));
//! assert!(store.get("missing").is_none());
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::StoreKey;
use crate::map::{KeyValueMap, MapFactory, memory_map_factory};

/// Blanket bound for values held by a store.
pub trait StoreValue: Clone + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Send + Sync + 'static {}

/// Hook wrapping every write performed by the store.
///
/// The hook receives the write as a closure and must call it exactly once,
/// e.g. inside a batch or a transaction. A hook that never calls it drops the
/// write.
pub type MutateHook = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// Extracts the secondary index key of an entity for [`Store::sync`].
pub type IndexFn<V> = Arc<dyn Fn(&V) -> Option<StoreKey> + Send + Sync>;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A change observed on a [`Store`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent<V> {
    /// `key` now holds `value`.
    Set {
        /// Written key.
        key: StoreKey,
        /// Written value.
        value: V,
    },
    /// `key` was deleted.
    Delete {
        /// Deleted key.
        key: StoreKey,
    },
    /// Every entry was removed.
    Clear,
}

/// Shared access to a keyed cache.
///
/// Implemented by [`Store`] and by policy-augmented stores, so that consumers
/// such as view caches can sit on top of either.
pub trait CacheStore<V>: Send + Sync {
    /// Reads `key`.
    fn get(&self, key: &StoreKey) -> Option<V>;

    /// Writes `value` under `key`.
    fn set(&self, key: StoreKey, value: V);

    /// Deletes `key`, returning whether it existed.
    fn delete(&self, key: &StoreKey) -> bool;

    /// Whether `key` is present.
    fn has(&self, key: &StoreKey) -> bool;
}

struct StoreInner<V> {
    map: Box<dyn KeyValueMap<V>>,
    mutate: Option<MutateHook>,
    index_by: Option<IndexFn<V>>,
    events: broadcast::Sender<StoreEvent<V>>,
}

/// Observable key-value map.
///
/// Cloning a `Store` is cheap and yields a handle to the same entries.
pub struct Store<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for Store<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for Store<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.inner.map.len())
            .field("mutate", &self.inner.mutate.is_some())
            .field("index_by", &self.inner.index_by.is_some())
            .finish()
    }
}

impl<V: StoreValue> Default for Store<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: StoreValue> Store<V> {
    /// Creates a store backed by a [`MemoryMap`](crate::MemoryMap).
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a new builder.
    pub fn builder() -> StoreBuilder<V> {
        StoreBuilder::new()
    }

    /// Reads `key`. A missing key yields `None`.
    pub fn get(&self, key: impl Into<StoreKey>) -> Option<V> {
        self.inner.map.get(&key.into())
    }

    /// Writes `value` under `key` through the mutate hook.
    pub fn set(&self, key: impl Into<StoreKey>, value: V) {
        let key = key.into();
        let event = self.has_subscribers().then(|| StoreEvent::Set {
            key: key.clone(),
            value: value.clone(),
        });
        let mut pending = Some((key, value));
        self.run_mutation(&mut || {
            if let Some((key, value)) = pending.take() {
                self.inner.map.insert(key, value);
            }
        });
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Deletes `key`, returning whether it was present.
    pub fn delete(&self, key: impl Into<StoreKey>) -> bool {
        let key = key.into();
        let mut existed = false;
        self.run_mutation(&mut || {
            existed = self.inner.map.remove(&key).is_some();
        });
        if existed {
            self.emit(StoreEvent::Delete { key });
        }
        existed
    }

    /// Whether `key` is present.
    pub fn has(&self, key: impl Into<StoreKey>) -> bool {
        self.inner.map.contains(&key.into())
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.run_mutation(&mut || self.inner.map.clear());
        self.emit(StoreEvent::Clear);
    }

    /// Snapshot of all values in iteration order.
    pub fn to_vec(&self) -> Vec<V> {
        self.inner
            .map
            .entries()
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// Snapshot of all entries in iteration order.
    pub fn entries(&self) -> Vec<(StoreKey, V)> {
        self.inner.map.entries()
    }

    /// Snapshot of all keys in iteration order.
    pub fn keys(&self) -> Vec<StoreKey> {
        self.inner.map.keys()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    /// Returns the index key of `entity`, if an index is configured.
    pub fn index_key(&self, entity: &V) -> Option<StoreKey> {
        self.inner.index_by.as_ref().and_then(|index| index(entity))
    }

    /// Writes `entity` under its own index key.
    ///
    /// Returns the key written, or `None` when no index is configured or the
    /// entity carries no index value.
    pub fn sync(&self, entity: V) -> Option<StoreKey> {
        let key = self.index_key(&entity)?;
        self.set(key.clone(), entity);
        Some(key)
    }

    /// Subscribes to changes made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<V>> {
        self.inner.events.subscribe()
    }

    fn has_subscribers(&self) -> bool {
        self.inner.events.receiver_count() > 0
    }

    fn emit(&self, event: StoreEvent<V>) {
        // Sending fails only when nobody listens.
        let _ = self.inner.events.send(event);
    }

    fn run_mutation(&self, write: &mut dyn FnMut()) {
        match &self.inner.mutate {
            Some(hook) => hook(write),
            None => write(),
        }
    }
}

impl<V: StoreValue> CacheStore<V> for Store<V> {
    fn get(&self, key: &StoreKey) -> Option<V> {
        Store::get(self, key)
    }

    fn set(&self, key: StoreKey, value: V) {
        Store::set(self, key, value)
    }

    fn delete(&self, key: &StoreKey) -> bool {
        Store::delete(self, key)
    }

    fn has(&self, key: &StoreKey) -> bool {
        Store::has(self, key)
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder<V> {
    map_factory: MapFactory<V>,
    mutate: Option<MutateHook>,
    index_by: Option<IndexFn<V>>,
    event_capacity: usize,
}

impl<V: StoreValue> StoreBuilder<V> {
    /// Creates a builder with an in-memory map, no hooks and no index.
    pub fn new() -> Self {
        Self {
            map_factory: memory_map_factory(),
            mutate: None,
            index_by: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Replaces the backing map implementation.
    pub fn map_factory(self, factory: MapFactory<V>) -> Self {
        Self {
            map_factory: factory,
            ..self
        }
    }

    /// Routes every write through `hook`.
    pub fn mutate<F>(self, hook: F) -> Self
    where
        F: Fn(&mut dyn FnMut()) + Send + Sync + 'static,
    {
        Self {
            mutate: Some(Arc::new(hook)),
            ..self
        }
    }

    /// Configures the secondary index used by [`Store::sync`].
    pub fn index_by<F>(self, index: F) -> Self
    where
        F: Fn(&V) -> Option<StoreKey> + Send + Sync + 'static,
    {
        Self {
            index_by: Some(Arc::new(index)),
            ..self
        }
    }

    /// Sets how many unread events a slow subscriber may lag behind.
    pub fn event_capacity(self, capacity: usize) -> Self {
        Self {
            event_capacity: capacity.max(1),
            ..self
        }
    }

    /// Builds the store.
    pub fn build(self) -> Store<V> {
        let (events, _) = broadcast::channel(self.event_capacity);
        Store {
            inner: Arc::new(StoreInner {
                map: (self.map_factory)(),
                mutate: self.mutate,
                index_by: self.index_by,
                events,
            }),
        }
    }
}

impl<V: StoreValue> Default for StoreBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}
