//! Policy orchestration.
//!
//! [`PolicyManager`] is the composition root binding an ordered list of
//! policies to one [`Store`]. Registration order matters twice: the first
//! policy declaring [`Capabilities::fetch`](crate::Capabilities) serves reads,
//! and `on_change` hooks fire in that order.
//!
//! ## Change fan-out
//!
//! [`PolicyManager::on_change`] applies the change to the store, then calls
//! every policy's hook synchronously.
//! Hooks that need I/O return a continuation which is spawned, not awaited;
//! the caller receives the handles as [`PendingChanges`] and may await them
//! or drop them. Continuations of different policies are not ordered
//! relative to each other.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use stowage_core::{Store, StoreKey, StoreValue};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::PolicyError;
use crate::metrics;
use crate::offload::{OffloadConfig, OffloadManager};
use crate::policies::aggregate::Aggregate;
use crate::policy::{ChangeContext, ChangeOrigin, FetchContext, Policy};

type PolicyTask = JoinHandle<Result<(), PolicyError>>;

/// Handles of the continuations spawned by one change.
///
/// Dropping this value does not cancel anything.
#[derive(Debug, Default)]
pub struct PendingChanges {
    tasks: Vec<PolicyTask>,
}

impl PendingChanges {
    /// Number of spawned continuations.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no policy spawned a continuation.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn push(&mut self, task: PolicyTask) {
        self.tasks.push(task);
    }

    fn extend(&mut self, other: PendingChanges) {
        self.tasks.extend(other.tasks);
    }

    /// Awaits every continuation and returns each result.
    pub async fn settled(self) -> Vec<Result<(), PolicyError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            results.push(task.await.unwrap_or_else(|error| Err(error.into())));
        }
        results
    }

    /// Awaits every continuation, returning the first error.
    pub async fn wait(self) -> Result<(), PolicyError> {
        self.settled().await.into_iter().collect()
    }
}

/// Write access to a store whose changes are fanned out to its policies.
///
/// Policies receive a handle on attach and with every change. It holds only a
/// weak reference to the manager, so a policy keeping a handle in a
/// background task does not keep the manager alive.
pub struct StoreHandle<V> {
    store: Store<V>,
    manager: Weak<PolicyManager<V>>,
}

impl<V> Clone for StoreHandle<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            manager: Weak::clone(&self.manager),
        }
    }
}

impl<V> fmt::Debug for StoreHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store", &self.store)
            .field("attached", &(self.manager.strong_count() > 0))
            .finish()
    }
}

impl<V: StoreValue> StoreHandle<V> {
    /// The raw store.
    pub fn store(&self) -> &Store<V> {
        &self.store
    }

    /// Reads `key`.
    pub fn get(&self, key: impl Into<StoreKey>) -> Option<V> {
        self.store.get(key)
    }

    /// Writes `value` and notifies every policy.
    pub fn set(&self, key: impl Into<StoreKey>, value: V, origin: ChangeOrigin) -> PendingChanges {
        let key = key.into();
        let previous = self.store.get(&key);
        self.store.set(key.clone(), value.clone());
        self.notify(&key, Some(&value), previous.as_ref(), origin)
    }

    /// Deletes `key` and notifies every policy.
    pub fn delete(&self, key: impl Into<StoreKey>, origin: ChangeOrigin) -> PendingChanges {
        let key = key.into();
        let previous = self.store.get(&key);
        self.store.delete(&key);
        self.notify(&key, None, previous.as_ref(), origin)
    }

    /// Removes every entry, notifying policies once per removed key.
    pub fn clear(&self, origin: ChangeOrigin) -> PendingChanges {
        let entries = self.store.entries();
        self.store.clear();
        let mut pending = PendingChanges::default();
        for (key, previous) in entries {
            pending.extend(self.notify(&key, None, Some(&previous), origin));
        }
        pending
    }

    fn notify(
        &self,
        key: &StoreKey,
        value: Option<&V>,
        previous: Option<&V>,
        origin: ChangeOrigin,
    ) -> PendingChanges {
        match self.manager.upgrade() {
            Some(manager) => manager.notify(key, value, previous, origin),
            None => PendingChanges::default(),
        }
    }
}

/// Composition root binding policies to one store.
pub struct PolicyManager<V> {
    store: Store<V>,
    this: Weak<PolicyManager<V>>,
    policies: RwLock<Vec<Arc<dyn Policy<V>>>>,
    aggregate: RwLock<Option<Arc<dyn Policy<V>>>>,
    attaching: Mutex<Vec<PolicyTask>>,
    offload: OffloadManager,
}

impl<V: StoreValue> fmt::Debug for PolicyManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .policies
            .read()
            .iter()
            .map(|policy| policy.name().to_owned())
            .collect();
        f.debug_struct("PolicyManager")
            .field("store", &self.store)
            .field("policies", &names)
            .field("offload", &self.offload)
            .finish()
    }
}

impl<V: StoreValue> PolicyManager<V> {
    /// Creates a manager for `store` with no policies.
    pub fn new(store: Store<V>) -> Arc<Self> {
        Self::with_offload(store, OffloadConfig::default())
    }

    /// Creates a manager whose continuations run under `config`.
    pub fn with_offload(store: Store<V>, config: OffloadConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            this: Weak::clone(this),
            policies: RwLock::new(Vec::new()),
            aggregate: RwLock::new(None),
            attaching: Mutex::new(Vec::new()),
            offload: OffloadManager::new(config),
        })
    }

    /// The managed store.
    pub fn store(&self) -> &Store<V> {
        &self.store
    }

    /// Tracker running change continuations.
    pub fn offload(&self) -> &OffloadManager {
        &self.offload
    }

    /// A write handle whose changes are fanned out by this manager.
    pub fn handle(&self) -> StoreHandle<V> {
        StoreHandle {
            store: self.store.clone(),
            manager: Weak::clone(&self.this),
        }
    }

    /// Number of registered policies.
    pub fn policy_count(&self) -> usize {
        self.policies.read().len()
    }

    /// Registers `policy` and starts its attach work.
    ///
    /// A policy declaring [`Capabilities::aggregate`](crate::Capabilities)
    /// becomes the aggregate policy as well. Must be called inside a tokio
    /// runtime.
    pub fn register(&self, policy: Arc<dyn Policy<V>>) {
        if policy.capabilities().aggregate {
            self.register_aggregate(Arc::clone(&policy));
        }
        self.policies.write().push(Arc::clone(&policy));

        let handle = self.handle();
        let span = info_span!("policy_attach", policy = %policy.name());
        let task = tokio::spawn(async move { policy.on_attach(&handle).await }.instrument(span));
        self.attaching.lock().push(task);
    }

    /// Makes `policy` the one serving [`get_aggregate`](Self::get_aggregate).
    ///
    /// The policy is not added to the change fan-out; use
    /// [`register`](Self::register) for that.
    pub fn register_aggregate(&self, policy: Arc<dyn Policy<V>>) {
        if let Some(previous) = self.aggregate.write().replace(policy) {
            warn!(replaced = %previous.name(), "Aggregate policy replaced");
        }
    }

    /// Waits until every attach started so far has finished.
    ///
    /// All attaches are awaited; the first error is returned.
    pub async fn ready(&self) -> Result<(), PolicyError> {
        let tasks = std::mem::take(&mut *self.attaching.lock());
        let mut first_error = None;
        for task in tasks {
            let result = task.await.unwrap_or_else(|error| Err(error.into()));
            if let Err(error) = result {
                warn!(%error, "Policy attach failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Policy<V>>> {
        self.policies.read().clone()
    }

    /// Returns the cached value of `key`, fetching it first if any policy
    /// asks for it.
    ///
    /// The first policy able to fetch serves the read and its result is
    /// written through the fan-out. Fetch errors are logged and the current,
    /// possibly stale, cached value is returned.
    pub async fn maybe_fetch(&self, key: &StoreKey) -> Option<V> {
        let policies = self.snapshot();
        let current = self.store.get(key);
        let ctx = FetchContext {
            key,
            value: current.as_ref(),
            store: &self.store,
        };
        if !policies.iter().any(|policy| policy.should_fetch(&ctx)) {
            return current;
        }

        let Some(fetcher) = policies.iter().find(|p| p.capabilities().fetch) else {
            debug!(%key, "Fetch requested but no policy can fetch");
            return self.store.get(key);
        };

        self.fetch_through(fetcher.as_ref(), key).await;
        self.store.get(key)
    }

    /// Fetches `key` through every fetching policy that wants to revalidate.
    ///
    /// Policies run sequentially; the last successful fetch wins.
    pub async fn revalidate(&self, key: &StoreKey) -> Option<V> {
        for policy in self.snapshot() {
            if !policy.capabilities().fetch {
                continue;
            }
            let current = self.store.get(key);
            let ctx = FetchContext {
                key,
                value: current.as_ref(),
                store: &self.store,
            };
            if policy.should_revalidate(&ctx) {
                self.fetch_through(policy.as_ref(), key).await;
            }
        }
        self.store.get(key)
    }

    async fn fetch_through(&self, policy: &dyn Policy<V>, key: &StoreKey) {
        metrics::record_fetch(policy.name());
        match policy.fetch(key).await {
            Ok(Some(value)) => {
                self.handle().set(key.clone(), value, ChangeOrigin::Fetch);
            }
            Ok(None) => debug!(%key, policy = %policy.name(), "Fetch returned nothing"),
            Err(error) => {
                metrics::record_fetch_error(policy.name());
                warn!(%key, policy = %policy.name(), %error, "Fetch failed, serving cached value");
            }
        }
    }

    /// Applies a local change of `key` and fans it out to every policy.
    ///
    /// `Some` writes the value and `None` deletes the key before any hook
    /// runs, so readers see the change before its continuations settle. The
    /// value held until then is reported as the previous value.
    pub fn on_change(&self, key: &StoreKey, value: Option<&V>) -> PendingChanges {
        let handle = self.handle();
        match value {
            Some(value) => handle.set(key.clone(), value.clone(), ChangeOrigin::Local),
            None => handle.delete(key.clone(), ChangeOrigin::Local),
        }
    }

    pub(crate) fn notify(
        &self,
        key: &StoreKey,
        value: Option<&V>,
        previous: Option<&V>,
        origin: ChangeOrigin,
    ) -> PendingChanges {
        let handle = self.handle();
        let ctx = ChangeContext {
            key,
            value,
            previous,
            origin,
            handle: &handle,
        };
        let mut pending = PendingChanges::default();
        for policy in self.snapshot() {
            if let Some(task) = policy.on_change(&ctx) {
                pending.push(self.offload.spawn(policy.name().to_owned(), task));
            }
        }
        pending
    }

    /// Builds the aggregate view of `key`, if an aggregate policy is
    /// registered and the key holds a value.
    pub fn get_aggregate(&self, key: &StoreKey) -> Option<Aggregate<V>> {
        let policy = self.aggregate.read().clone()?;
        let base = self.store.get(key)?;
        policy.aggregate(key, base)
    }

    /// Detaches every policy in registration order.
    ///
    /// The first error aborts the sweep and is returned.
    pub async fn detach_all(&self) -> Result<(), PolicyError> {
        for policy in self.snapshot() {
            policy.on_detach().await?;
        }
        Ok(())
    }
}
