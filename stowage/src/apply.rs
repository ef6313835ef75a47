//! Policy-augmented stores.
//!
//! [`apply_policies`] binds a [`Store`] and a list of policies into a
//! [`PolicyStore`]. Reads go straight to the store; writes go to the store
//! and are then fanned out to every policy.
//!
//! ```ignore
//! let contacts = apply_policies(
//!     Store::new(),
//!     vec![
//!         Arc::new(TtlPolicy::new(TtlConfig::builder().ttl(Duration::from_secs(60)).build())),
//!         Arc::new(FetchPolicy::new(|key| async move { api.contact(key).await })),
//!     ],
//! );
//! contacts.ready().await?;
//! let contact = contacts.get_or_fetch(7).await;
//! ```

use std::fmt;
use std::sync::Arc;

use stowage_core::{CacheStore, Store, StoreKey, StoreValue};

use crate::error::PolicyError;
use crate::manager::{PendingChanges, PolicyManager, StoreHandle};
use crate::offload::OffloadConfig;
use crate::policies::aggregate::Aggregate;
use crate::policy::{ChangeOrigin, Policy};

/// Registers every policy of `policies`, in order, against `store`.
///
/// Must be called inside a tokio runtime: attach work is spawned right away.
pub fn apply_policies<V, I>(store: Store<V>, policies: I) -> PolicyStore<V>
where
    V: StoreValue,
    I: IntoIterator<Item = Arc<dyn Policy<V>>>,
{
    PolicyStore::with_manager(PolicyManager::new(store), policies)
}

/// A [`Store`] whose writes are observed by policies.
///
/// Cloning is cheap; clones share the store and the manager.
pub struct PolicyStore<V> {
    handle: StoreHandle<V>,
    manager: Arc<PolicyManager<V>>,
}

impl<V> Clone for PolicyStore<V> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<V: StoreValue> fmt::Debug for PolicyStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore")
            .field("manager", &self.manager)
            .finish()
    }
}

impl<V: StoreValue> PolicyStore<V> {
    /// Like [`apply_policies`], with a custom task tracker configuration.
    pub fn with_offload<I>(store: Store<V>, policies: I, config: OffloadConfig) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Policy<V>>>,
    {
        Self::with_manager(PolicyManager::with_offload(store, config), policies)
    }

    fn with_manager<I>(manager: Arc<PolicyManager<V>>, policies: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Policy<V>>>,
    {
        for policy in policies {
            manager.register(policy);
        }
        Self {
            handle: manager.handle(),
            manager,
        }
    }

    /// The raw store. Writes through it bypass every policy.
    pub fn inner(&self) -> &Store<V> {
        self.handle.store()
    }

    /// The policy manager.
    pub fn manager(&self) -> &Arc<PolicyManager<V>> {
        &self.manager
    }

    /// Reads `key` without consulting any policy.
    pub fn get(&self, key: impl Into<StoreKey>) -> Option<V> {
        self.inner().get(key)
    }

    /// Writes `value` and notifies every policy.
    pub fn set(&self, key: impl Into<StoreKey>, value: V) -> PendingChanges {
        self.handle.set(key, value, ChangeOrigin::Local)
    }

    /// Deletes `key` and notifies every policy.
    pub fn delete(&self, key: impl Into<StoreKey>) -> PendingChanges {
        self.handle.delete(key, ChangeOrigin::Local)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: impl Into<StoreKey>) -> bool {
        self.inner().has(key)
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<StoreKey> {
        self.inner().keys()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }

    /// Snapshot of all values.
    pub fn to_vec(&self) -> Vec<V> {
        self.inner().to_vec()
    }

    /// Writes `entity` under its index key and notifies every policy.
    ///
    /// Returns `None` when the store has no index or the entity carries no
    /// index value; nothing is written then.
    pub fn sync(&self, entity: V) -> Option<(StoreKey, PendingChanges)> {
        let key = self.inner().index_key(&entity)?;
        let pending = self.set(key.clone(), entity);
        Some((key, pending))
    }

    /// Removes every entry, notifying policies once per removed key.
    pub fn clear(&self) -> PendingChanges {
        self.handle.clear(ChangeOrigin::Local)
    }

    /// Returns `key`, fetching it first if any policy asks for it.
    pub async fn get_or_fetch(&self, key: impl Into<StoreKey>) -> Option<V> {
        self.manager.maybe_fetch(&key.into()).await
    }

    /// Refetches `key` through every policy that wants to revalidate it.
    pub async fn revalidate(&self, key: impl Into<StoreKey>) -> Option<V> {
        self.manager.revalidate(&key.into()).await
    }

    /// The aggregate view of `key`.
    pub fn get_aggregate(&self, key: impl Into<StoreKey>) -> Option<Aggregate<V>> {
        self.manager.get_aggregate(&key.into())
    }

    /// Waits for every policy's attach work.
    pub async fn ready(&self) -> Result<(), PolicyError> {
        self.manager.ready().await
    }

    /// Waits for every change continuation in flight, including ones spawned
    /// while waiting.
    pub async fn flush(&self) {
        self.manager.offload().wait_all().await;
    }

    /// Detaches every policy.
    pub async fn destroy(&self) -> Result<(), PolicyError> {
        self.manager.detach_all().await
    }
}

impl<V: StoreValue> CacheStore<V> for PolicyStore<V> {
    fn get(&self, key: &StoreKey) -> Option<V> {
        PolicyStore::get(self, key)
    }

    fn set(&self, key: StoreKey, value: V) {
        PolicyStore::set(self, key, value);
    }

    fn delete(&self, key: &StoreKey) -> bool {
        let existed = self.has(key);
        PolicyStore::delete(self, key);
        existed
    }

    fn has(&self, key: &StoreKey) -> bool {
        PolicyStore::has(self, key)
    }
}
