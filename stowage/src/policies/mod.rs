//! Concrete policies.
//!
//! Each policy is independently attachable; combine them with
//! [`apply_policies`](crate::apply_policies) in the order they should be
//! consulted.
//!
//! | Policy | Does |
//! |--------|------|
//! | [`FetchPolicy`] | fetches missing values through a closure |
//! | [`TtlPolicy`] | marks values stale after a time-to-live, optionally evicting them |
//! | [`BackgroundRefreshPolicy`] | refetches keys on a timer |
//! | [`OptimisticMutationPolicy`] | sends local writes upstream with retry and rollback |
//! | [`PersistencePolicy`] | mirrors entries into durable storage |
//! | [`MutationPersistencePolicy`] | persists and replays a mutation queue |
//! | [`RealtimePolicy`] | syncs changes with other clients over a channel |
//! | [`ServiceWorkerFetchPolicy`] | fetches through an out-of-process worker |
//! | [`QueuedMutationPolicy`] | sends mutations through a worker, queueing them offline |
//! | [`AggregatePolicy`] | exposes derived fields over stored values |
//! | [`ChangePolicy`] | runs a callback for every change |

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use stowage_core::StoreKey;

use crate::error::FetchError;

pub mod aggregate;
pub mod background;
pub mod change;
pub mod fetch;
pub mod mutation_persistence;
pub mod optimistic;
pub mod persistence;
pub mod realtime;
pub mod ttl;
pub mod worker;

pub use aggregate::{Aggregate, AggregatePolicy};
pub use background::BackgroundRefreshPolicy;
pub use change::ChangePolicy;
pub use fetch::FetchPolicy;
pub use mutation_persistence::{
    MUTATION_DB_NAME, MUTATION_STORE_NAME, MemoryMutationDatabase, MutationDatabase,
    MutationPersistencePolicy, MutationQueue, QueueBackend, ReplayOutcome,
};
pub use optimistic::{MutationFn, OptimisticMutationPolicy, RetryEvent};
pub use persistence::PersistencePolicy;
pub use realtime::{
    Channel, ChannelEvent, ChannelSource, MemoryChannel, RealtimePolicy, RealtimePolicyBuilder,
    VersionBy,
};
pub use ttl::TtlPolicy;
pub use worker::{
    ControllerSource, HttpMethod, QueuedMutation, QueuedMutationPolicy, RequestPayload,
    SendOutcome, ServiceWorkerFetchPolicy, Transport, WorkerController, WorkerReply,
    WorkerRequest, WorkerRequestType,
};

/// Shared async fetch function.
pub type Fetcher<V> =
    Arc<dyn Fn(StoreKey) -> BoxFuture<'static, Result<Option<V>, FetchError>> + Send + Sync>;

/// Boxes an async closure into a [`Fetcher`].
pub fn fetcher<V, F, Fut>(fetch: F) -> Fetcher<V>
where
    F: Fn(StoreKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
{
    Arc::new(move |key| fetch(key).boxed())
}
