//! Callback on every change.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stowage_core::{StoreKey, StoreValue};

use crate::policy::{ChangeContext, ChangeOrigin, ChangeTask, Policy};

type Callback<V> = Arc<dyn Fn(&ChangeContext<'_, V>) -> Option<ChangeTask> + Send + Sync>;

/// Runs a callback for every change, optionally only for some keys.
///
/// ```ignore
/// let audit = ChangePolicy::observe(|key, value: Option<&Contact>, origin| {
///     tracing::info!(%key, deleted = value.is_none(), ?origin, "contact changed");
/// });
/// ```
pub struct ChangePolicy<V> {
    name: String,
    callback: Callback<V>,
    keys: Option<HashSet<StoreKey>>,
}

impl<V> fmt::Debug for ChangePolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangePolicy")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl<V: StoreValue> ChangePolicy<V> {
    /// Runs `callback` for every change; it may return a continuation.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&ChangeContext<'_, V>) -> Option<ChangeTask> + Send + Sync + 'static,
    {
        Self {
            name: "change".to_owned(),
            callback: Arc::new(callback),
            keys: None,
        }
    }

    /// Runs `observer` for every change.
    pub fn observe<F>(observer: F) -> Self
    where
        F: Fn(&StoreKey, Option<&V>, ChangeOrigin) + Send + Sync + 'static,
    {
        Self::new(move |ctx| {
            observer(ctx.key, ctx.value, ctx.origin);
            None
        })
    }

    /// Names the policy in logs.
    pub fn named(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Restricts the callback to `keys`.
    pub fn keys<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<StoreKey>,
    {
        Self {
            keys: Some(keys.into_iter().map(Into::into).collect()),
            ..self
        }
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for ChangePolicy<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_change(&self, ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        if let Some(keys) = &self.keys
            && !keys.contains(ctx.key)
        {
            return None;
        }
        (self.callback)(ctx)
    }
}
