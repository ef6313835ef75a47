//! Scheduled revalidation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stowage_core::{StoreKey, StoreValue};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::BackgroundRefreshConfig;
use crate::error::{FetchError, PolicyError};
use crate::manager::StoreHandle;
use crate::policy::{Capabilities, ChangeOrigin, FetchContext, Policy};

use super::{Fetcher, fetcher};

type RevalidatePredicate<V> = Arc<dyn Fn(&StoreKey, Option<&V>) -> bool + Send + Sync>;

/// Refetches keys on a fixed interval.
///
/// The timer starts on attach and stops on detach. Every tick sweeps either
/// the configured keys or every key currently in the store, in its own task:
/// a slow sweep does not delay the next tick, so sweeps may overlap.
/// Stopping the timer aborts the sweeps still running.
pub struct BackgroundRefreshPolicy<V> {
    config: BackgroundRefreshConfig,
    fetcher: Fetcher<V>,
    should_revalidate: Option<RevalidatePredicate<V>>,
    timer: Mutex<Option<AbortHandle>>,
}

impl<V> fmt::Debug for BackgroundRefreshPolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundRefreshPolicy")
            .field("config", &self.config)
            .field("running", &self.timer.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl<V: StoreValue> BackgroundRefreshPolicy<V> {
    /// Creates a policy refetching through `fetch`.
    pub fn new<F, Fut>(config: BackgroundRefreshConfig, fetch: F) -> Self
    where
        F: Fn(StoreKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
    {
        Self {
            config,
            fetcher: fetcher(fetch),
            should_revalidate: None,
            timer: Mutex::new(None),
        }
    }

    /// Refetch only keys for which `predicate` holds. Without a predicate
    /// every key is refetched.
    pub fn revalidate_when<P>(self, predicate: P) -> Self
    where
        P: Fn(&StoreKey, Option<&V>) -> bool + Send + Sync + 'static,
    {
        let mut this = self;
        this.should_revalidate = Some(Arc::new(predicate));
        this
    }

    /// Whether the timer is running.
    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

async fn sweep<V: StoreValue>(
    handle: StoreHandle<V>,
    keys: Vec<StoreKey>,
    fetcher: Fetcher<V>,
    predicate: Option<RevalidatePredicate<V>>,
) {
    for key in keys {
        if let Some(predicate) = &predicate {
            let current = handle.get(&key);
            if !predicate(&key, current.as_ref()) {
                continue;
            }
        }
        match fetcher(key.clone()).await {
            Ok(Some(value)) => {
                handle.set(key, value, ChangeOrigin::Fetch);
            }
            Ok(None) => debug!(%key, "Background refresh returned nothing"),
            Err(error) => warn!(%key, %error, "Background refresh failed"),
        }
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for BackgroundRefreshPolicy<V> {
    fn name(&self) -> &str {
        "background_refresh"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FETCH
    }

    async fn on_attach(&self, handle: &StoreHandle<V>) -> Result<(), PolicyError> {
        self.stop();

        let handle = handle.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let predicate = self.should_revalidate.clone();
        let configured = self.config.keys.clone();
        // A zero period would make `interval` panic.
        let period = self.config.interval.max(Duration::from_millis(1));

        let timer = tokio::spawn(
            async move {
                // Owned by the timer task, so aborting the timer drops it and
                // aborts every sweep in flight.
                let mut sweeps = JoinSet::new();
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    while sweeps.try_join_next().is_some() {}
                    let keys = configured
                        .clone()
                        .unwrap_or_else(|| handle.store().keys());
                    debug!(keys = keys.len(), "Background refresh tick");
                    sweeps.spawn(
                        sweep(
                            handle.clone(),
                            keys,
                            Arc::clone(&fetcher),
                            predicate.clone(),
                        )
                        .in_current_span(),
                    );
                }
            }
            .instrument(info_span!("background_refresh", interval = ?period)),
        );
        *self.timer.lock() = Some(timer.abort_handle());
        Ok(())
    }

    fn should_revalidate(&self, ctx: &FetchContext<'_, V>) -> bool {
        self.should_revalidate
            .as_ref()
            .is_none_or(|predicate| predicate(ctx.key, ctx.value))
    }

    async fn fetch(&self, key: &StoreKey) -> Result<Option<V>, FetchError> {
        (self.fetcher)(key.clone()).await
    }

    async fn on_detach(&self) -> Result<(), PolicyError> {
        self.stop();
        Ok(())
    }
}

impl<V> Drop for BackgroundRefreshPolicy<V> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}
