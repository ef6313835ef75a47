//! Memoized computations keyed by their inputs.
//!
//! A [`View`] stores the result of a computation in a [`ViewStore`] under a
//! key derived from the structure of an index value: two deep-equal indexes
//! address the same slot, in this process and in any other. The backing cache
//! is any [`CacheStore`], so a view store backed by a realtime-synced
//! [`PolicyStore`](crate::PolicyStore) shares its views across clients.
//!
//! ```
//! use stowage::view::{View, ViewStore};
//! use stowage_core::Store;
//!
//! let views = ViewStore::new(Store::new());
//! let total = View::new(&views, &("invoices", 2024), || 42u32).unwrap();
//! assert_eq!(total.get(), Some(42));
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use stowage_core::{CacheStore, Store, StoreKey, StoreValue};

/// Canonical structural hash of `index`.
///
/// Object keys are sorted recursively before hashing, so field order does not
/// matter.
pub fn structural_hash<I: Serialize + ?Sized>(index: &I) -> Result<u64, serde_json::Error> {
    let canonical = canonicalize(serde_json::to_value(index)?);
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(prefix))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sorted: Vec<(String, Value)> = fields.into_iter().collect();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Cache holding view results.
pub struct ViewStore<R, S = Store<R>> {
    cache: S,
    _result: std::marker::PhantomData<fn() -> R>,
}

impl<R, S: Clone> Clone for ViewStore<R, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            _result: std::marker::PhantomData,
        }
    }
}

impl<R, S: fmt::Debug> fmt::Debug for ViewStore<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewStore")
            .field("cache", &self.cache)
            .finish()
    }
}

impl<R, S> ViewStore<R, S>
where
    R: StoreValue,
    S: CacheStore<R> + Clone,
{
    /// Creates a view store backed by `cache`.
    pub fn new(cache: S) -> Self {
        Self {
            cache,
            _result: std::marker::PhantomData,
        }
    }

    /// The backing cache.
    pub fn cache(&self) -> &S {
        &self.cache
    }

    /// Reads the slot of `key`.
    pub fn get(&self, key: &StoreKey) -> Option<R> {
        self.cache.get(key)
    }

    /// Creates a view; see [`View::new`].
    pub fn view<I, F>(&self, index: &I, run: F) -> Result<View<R, S>, serde_json::Error>
    where
        I: Serialize + ?Sized,
        F: Fn() -> R + Send + Sync + 'static,
    {
        View::new(self, index, run)
    }
}

/// A memoized computation.
pub struct View<R, S = Store<R>> {
    key: StoreKey,
    cache: S,
    run: Arc<dyn Fn() -> R + Send + Sync>,
}

impl<R, S: fmt::Debug> fmt::Debug for View<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("key", &self.key)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<R, S> View<R, S>
where
    R: StoreValue,
    S: CacheStore<R> + Clone,
{
    /// Computes `run` right away and stores the result under the structural
    /// hash of `index`.
    pub fn new<I, F>(store: &ViewStore<R, S>, index: &I, run: F) -> Result<Self, serde_json::Error>
    where
        I: Serialize + ?Sized,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let key = StoreKey::from(structural_hash(index)?);
        let view = Self {
            key,
            cache: store.cache.clone(),
            run: Arc::new(run),
        };
        view.invalidate();
        Ok(view)
    }

    /// The slot this view writes to.
    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    /// The stored result, if the slot still holds one.
    pub fn get(&self) -> Option<R> {
        self.cache.get(&self.key)
    }

    /// Recomputes and overwrites the stored result.
    pub fn invalidate(&self) {
        self.cache.set(self.key.clone(), (self.run)());
    }

    /// Removes the stored result.
    pub fn dispose(self) {
        self.cache.delete(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({ "filter": { "status": "open", "owner": 7 }, "page": 1 });
        let b = json!({ "page": 1, "filter": { "owner": 7, "status": "open" } });
        assert_eq!(structural_hash(&a).unwrap(), structural_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_keeps_array_order() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(structural_hash(&a).unwrap(), structural_hash(&b).unwrap());
    }
}
