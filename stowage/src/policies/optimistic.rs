//! Optimistic writes with retry and rollback.
//!
//! A local write is visible in the store before the upstream confirms it.
//! The policy then drives the upstream mutation through a small state
//! machine per key:
//!
//! ```text
//! Idle -> Applied -> Confirmed
//!            |   \
//!            |    RetryWait -> Applied (retry n waits retry_delay * 2^(n-1))
//!            v
//!        RolledBack
//! ```
//!
//! Before the mutation starts, the value the key held is kept as a snapshot.
//! Success drops the snapshot. A non-retryable error, or running out of
//! retries, restores it (deleting the key if it was absent) and fails the
//! change continuation with [`MutationError::RolledBack`]. The snapshot of a
//! rolled back key is kept until the key's next successful mutation.
//!
//! Only writes with [`ChangeOrigin::Local`] are sent upstream; fetched, remote
//! and rollback writes are already authoritative.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use stowage_core::{StoreKey, StoreValue};
use tracing::{Instrument, debug, info_span, warn};

use crate::config::OptimisticConfig;
use crate::error::{MutationError, PolicyError, RequestError};
use crate::manager::StoreHandle;
use crate::metrics;
use crate::policy::{ChangeContext, ChangeOrigin, ChangeTask, Policy};

/// Upstream mutation: `None` as the value means the key was deleted.
pub type MutationFn<V> =
    Arc<dyn Fn(StoreKey, Option<V>) -> BoxFuture<'static, Result<(), RequestError>> + Send + Sync>;

type RetryPredicate = Arc<dyn Fn(&RequestError) -> bool + Send + Sync>;
type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// A retry about to be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// Key being mutated.
    pub key: StoreKey,
    /// The attempt that just failed, counting from 1.
    pub attempt: u32,
    /// Wait before the next attempt.
    pub delay: Duration,
}

/// Sends local writes upstream, retrying with exponential backoff and
/// rolling back on permanent failure.
pub struct OptimisticMutationPolicy<V> {
    config: OptimisticConfig,
    mutation_fn: MutationFn<V>,
    is_retryable: RetryPredicate,
    on_retry: Option<RetryObserver>,
    snapshots: Arc<DashMap<StoreKey, Option<V>>>,
}

impl<V> fmt::Debug for OptimisticMutationPolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticMutationPolicy")
            .field("config", &self.config)
            .field("snapshots", &self.snapshots.len())
            .finish_non_exhaustive()
    }
}

impl<V: StoreValue> OptimisticMutationPolicy<V> {
    /// Creates a policy sending every local write through `mutate`.
    ///
    /// Every error is retryable until [`is_retryable`](Self::is_retryable)
    /// says otherwise.
    pub fn new<F, Fut>(config: OptimisticConfig, mutate: F) -> Self
    where
        F: Fn(StoreKey, Option<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RequestError>> + Send + 'static,
    {
        Self {
            config,
            mutation_fn: Arc::new(move |key, value| mutate(key, value).boxed()),
            is_retryable: Arc::new(|_| true),
            on_retry: None,
            snapshots: Arc::new(DashMap::new()),
        }
    }

    /// Decides which errors are worth a retry.
    pub fn is_retryable<P>(self, predicate: P) -> Self
    where
        P: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        Self {
            is_retryable: Arc::new(predicate),
            ..self
        }
    }

    /// Observes every scheduled retry.
    pub fn on_retry<O>(self, observer: O) -> Self
    where
        O: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        Self {
            on_retry: Some(Arc::new(observer)),
            ..self
        }
    }

    /// Number of keys holding a snapshot.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether `key` holds a snapshot, i.e. a mutation is in flight or was
    /// rolled back.
    pub fn has_snapshot(&self, key: &StoreKey) -> bool {
        self.snapshots.contains_key(key)
    }
}

struct Mutation<V> {
    key: StoreKey,
    value: Option<V>,
    snapshot: Option<V>,
    handle: StoreHandle<V>,
    config: OptimisticConfig,
    mutation_fn: MutationFn<V>,
    is_retryable: RetryPredicate,
    on_retry: Option<RetryObserver>,
    snapshots: Arc<DashMap<StoreKey, Option<V>>>,
}

impl<V: StoreValue> Mutation<V> {
    async fn run(self) -> Result<(), MutationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match (self.mutation_fn)(self.key.clone(), self.value.clone()).await {
                Ok(()) => {
                    self.snapshots.remove(&self.key);
                    debug!(key = %self.key, attempt, "Mutation confirmed");
                    return Ok(());
                }
                Err(error) => error,
            };

            if !(self.is_retryable)(&error) || attempt > self.config.max_retries {
                self.rollback();
                return Err(MutationError::RolledBack {
                    key: self.key,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.config.backoff(attempt);
            debug!(key = %self.key, attempt, ?delay, %error, "Scheduling mutation retry");
            metrics::record_mutation_retry();
            if let Some(on_retry) = &self.on_retry {
                on_retry(&RetryEvent {
                    key: self.key.clone(),
                    attempt,
                    delay,
                });
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn rollback(&self) {
        // A newer write may have replaced the snapshot taken for this one.
        let snapshot = self
            .snapshots
            .get(&self.key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.snapshot.clone());

        warn!(key = %self.key, restored = snapshot.is_some(), "Rolling back mutation");
        metrics::record_mutation_rollback();
        match snapshot {
            Some(previous) => {
                self.handle
                    .set(self.key.clone(), previous, ChangeOrigin::Rollback);
            }
            None => {
                self.handle.delete(self.key.clone(), ChangeOrigin::Rollback);
            }
        }
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for OptimisticMutationPolicy<V> {
    fn name(&self) -> &str {
        "optimistic_mutation"
    }

    fn on_change(&self, ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        if ctx.origin != ChangeOrigin::Local {
            return None;
        }

        let snapshot = ctx.previous.cloned();
        self.snapshots.insert(ctx.key.clone(), snapshot.clone());

        let mutation = Mutation {
            key: ctx.key.clone(),
            value: ctx.value.cloned(),
            snapshot,
            handle: ctx.handle.clone(),
            config: self.config.clone(),
            mutation_fn: Arc::clone(&self.mutation_fn),
            is_retryable: Arc::clone(&self.is_retryable),
            on_retry: self.on_retry.clone(),
            snapshots: Arc::clone(&self.snapshots),
        };
        let span = info_span!("optimistic_mutation", key = %ctx.key);
        Some(
            async move { mutation.run().await.map_err(PolicyError::from) }
                .instrument(span)
                .boxed(),
        )
    }
}
