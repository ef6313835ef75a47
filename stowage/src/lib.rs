#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Binding a store and its policies into a [`PolicyStore`].
mod apply;

/// Policy configuration.
///
/// Every policy takes a `*Config` struct that deserializes from YAML or JSON
/// (durations as `"1s"`, `"500ms"`) and has a builder. [`StoreConfig`]
/// bundles the sections of one store.
///
/// [`StoreConfig`]: config::StoreConfig
pub mod config;

/// Error types for fetches, mutations and policy hooks.
pub mod error;

/// Policy orchestration.
mod manager;

/// Metrics collection for policy observability.
///
/// When the `metrics` feature is enabled, this module provides counters for:
/// - Fetches and fetch failures
/// - Mutation retries and rollbacks
/// - Applied and rejected realtime events
/// - Replayed queued mutations
pub mod metrics;

/// Background execution of policy continuations.
pub mod offload;

/// Concrete policies.
pub mod policies;

/// The policy contract.
mod policy;

/// Memoized computations keyed by their inputs.
pub mod view;

pub use apply::{PolicyStore, apply_policies};
pub use error::{BoxError, FetchError, MutationError, PolicyError, RequestError};
pub use manager::{PendingChanges, PolicyManager, StoreHandle};
pub use policy::{Capabilities, ChangeContext, ChangeOrigin, ChangeTask, FetchContext, Policy};
pub use view::{View, ViewStore, structural_hash};

pub use stowage_core::{
    CacheStore, Clock, KeyValueMap, ManualClock, MemoryMap, MemoryStorage, Storage, StorageError,
    Store, StoreBuilder, StoreEvent, StoreKey, StoreValue, SystemClock,
};
