//! The policy contract.
//!
//! A [`Policy`] is a pluggable unit of caching, sync or persistence behavior
//! attached to a [`Store`]. Every hook has a default implementation meaning
//! "no opinion", so a policy implements only the capabilities it has:
//!
//! | Hook | Called when | Default |
//! |------|-------------|---------|
//! | [`on_attach`](Policy::on_attach) | the policy is registered | no-op |
//! | [`on_change`](Policy::on_change) | a key is written or deleted | no continuation |
//! | [`should_fetch`](Policy::should_fetch) | a read asks whether to fetch | `false` |
//! | [`should_revalidate`](Policy::should_revalidate) | a revalidation runs | `false` |
//! | [`fetch`](Policy::fetch) | this policy is the chosen fetcher | `Ok(None)` |
//! | [`aggregate`](Policy::aggregate) | an aggregate view is requested | `None` |
//! | [`on_detach`](Policy::on_detach) | the store is destroyed | no-op |
//!
//! Whether `fetch` and `aggregate` are consulted at all is declared up front
//! through [`Capabilities`]; the manager never probes a policy by calling a
//! hook to see what happens.

use async_trait::async_trait;
use futures::future::BoxFuture;
use stowage_core::{Store, StoreKey, StoreValue};

use crate::error::{FetchError, PolicyError};
use crate::manager::StoreHandle;
use crate::policies::aggregate::Aggregate;

/// Async continuation of an [`on_change`](Policy::on_change) hook.
pub type ChangeTask = BoxFuture<'static, Result<(), PolicyError>>;

/// Capabilities a policy offers beyond the plain hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The policy can fetch values; the first such policy in registration
    /// order serves [`maybe_fetch`](crate::PolicyManager::maybe_fetch).
    pub fetch: bool,
    /// The policy builds aggregate views; at most one is active per manager.
    pub aggregate: bool,
}

impl Capabilities {
    /// Capabilities of a fetching policy.
    pub const FETCH: Self = Self {
        fetch: true,
        aggregate: false,
    };

    /// Capabilities of an aggregate policy.
    pub const AGGREGATE: Self = Self {
        fetch: false,
        aggregate: true,
    };
}

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// Application code wrote through the policy store.
    Local,
    /// A policy wrote a freshly fetched value.
    Fetch,
    /// A remote client's change arrived over the realtime channel.
    Remote,
    /// A failed optimistic mutation restored the previous value.
    Rollback,
}

/// A change being fanned out to policies.
pub struct ChangeContext<'a, V> {
    /// Changed key.
    pub key: &'a StoreKey,
    /// New value, `None` for a deletion.
    pub value: Option<&'a V>,
    /// Value the key held before the change.
    pub previous: Option<&'a V>,
    /// Who caused the change.
    pub origin: ChangeOrigin,
    /// Handle for writes that must be fanned out in turn.
    pub handle: &'a StoreHandle<V>,
}

impl<V: StoreValue> ChangeContext<'_, V> {
    /// The raw store. Writes through it are not seen by other policies.
    pub fn store(&self) -> &Store<V> {
        self.handle.store()
    }
}

/// A read asking whether the cached value should be (re)fetched.
pub struct FetchContext<'a, V> {
    /// Key being read.
    pub key: &'a StoreKey,
    /// Currently cached value.
    pub value: Option<&'a V>,
    /// The raw store.
    pub store: &'a Store<V>,
}

/// Pluggable caching, sync or persistence behavior.
#[async_trait]
pub trait Policy<V: StoreValue>: Send + Sync {
    /// Name used in logs and task labels.
    fn name(&self) -> &str;

    /// Capabilities beyond the plain hooks.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once when the policy is registered.
    ///
    /// The manager awaits every attach in
    /// [`ready`](crate::PolicyManager::ready).
    async fn on_attach(&self, _handle: &StoreHandle<V>) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Called synchronously for every change.
    ///
    /// Work that must wait on I/O is returned as a continuation, which the
    /// manager spawns without awaiting it.
    fn on_change(&self, _ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        None
    }

    /// Whether a read of `ctx.key` should fetch.
    fn should_fetch(&self, _ctx: &FetchContext<'_, V>) -> bool {
        false
    }

    /// Whether a revalidation of `ctx.key` should fetch through this policy.
    fn should_revalidate(&self, _ctx: &FetchContext<'_, V>) -> bool {
        false
    }

    /// Fetches the value of `key`. Consulted only when
    /// [`Capabilities::fetch`] is set.
    async fn fetch(&self, _key: &StoreKey) -> Result<Option<V>, FetchError> {
        Ok(None)
    }

    /// Wraps `base` with derived fields. Consulted only when
    /// [`Capabilities::aggregate`] is set.
    fn aggregate(&self, _key: &StoreKey, _base: V) -> Option<Aggregate<V>> {
        None
    }

    /// Called when the store is destroyed.
    async fn on_detach(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}
