//! Closure-backed fetching.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use stowage_core::{StoreKey, StoreValue};

use crate::error::FetchError;
use crate::policy::{Capabilities, FetchContext, Policy};

use super::{Fetcher, fetcher};

/// Fetches values through an async closure.
///
/// By default a read fetches only when the key holds no value; freshness is
/// left to policies such as [`TtlPolicy`](super::TtlPolicy), which can ask
/// for a fetch on their own. Revalidation always fetches.
pub struct FetchPolicy<V> {
    fetcher: Fetcher<V>,
    always_fetch: bool,
}

impl<V> fmt::Debug for FetchPolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPolicy")
            .field("always_fetch", &self.always_fetch)
            .finish_non_exhaustive()
    }
}

impl<V: StoreValue> FetchPolicy<V> {
    /// Creates a policy fetching through `fetch`.
    ///
    /// `Ok(None)` from the closure means "nothing upstream" and leaves the
    /// store untouched.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(StoreKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
    {
        Self::from_fetcher(fetcher(fetch))
    }

    /// Creates a policy from an already boxed fetcher.
    pub fn from_fetcher(fetcher: Fetcher<V>) -> Self {
        Self {
            fetcher,
            always_fetch: false,
        }
    }

    /// Fetch on every read, even when a value is cached.
    pub fn always_fetch(self, always_fetch: bool) -> Self {
        Self {
            always_fetch,
            ..self
        }
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for FetchPolicy<V> {
    fn name(&self) -> &str {
        "fetch"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FETCH
    }

    fn should_fetch(&self, ctx: &FetchContext<'_, V>) -> bool {
        self.always_fetch || ctx.value.is_none()
    }

    fn should_revalidate(&self, _ctx: &FetchContext<'_, V>) -> bool {
        true
    }

    async fn fetch(&self, key: &StoreKey) -> Result<Option<V>, FetchError> {
        (self.fetcher)(key.clone()).await
    }
}
