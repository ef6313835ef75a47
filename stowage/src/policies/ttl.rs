//! Time-to-live freshness.
//!
//! [`TtlPolicy`] stamps every write with the current epoch time and reports a
//! value stale once it is older than the configured TTL. Freshness is checked
//! only on reads; with `auto_delete` the stale entry is removed by that same
//! check, there is no background sweep.
//!
//! A value without a stamp has unknown freshness and is always refetched.
//! When timestamps are mirrored into [`Storage`], a missing in-memory stamp is
//! looked up there first, so freshness survives a restart together with the
//! persisted data.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use stowage_core::{Clock, Storage, StoreKey, StoreValue, SystemClock};
use tracing::{debug, warn};

use crate::config::TtlConfig;
use crate::policy::{ChangeContext, ChangeTask, FetchContext, Policy};

/// Marks values stale after a time-to-live.
pub struct TtlPolicy {
    config: TtlConfig,
    clock: Arc<dyn Clock>,
    storage: Option<Arc<dyn Storage>>,
    stamps: DashMap<StoreKey, i64>,
}

impl std::fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlPolicy")
            .field("config", &self.config)
            .field("stamps", &self.stamps.len())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl TtlPolicy {
    /// Creates a policy reading the system clock.
    pub fn new(config: TtlConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            storage: None,
            stamps: DashMap::new(),
        }
    }

    /// Reads time from `clock` instead of the system clock.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    /// Mirrors timestamps into `storage` when `persist_prefix` is configured.
    pub fn with_storage(self, storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..self
        }
    }

    /// The configuration.
    pub fn config(&self) -> &TtlConfig {
        &self.config
    }

    /// Epoch millis of the last write of `key`, if known.
    pub fn last_write(&self, key: &StoreKey) -> Option<i64> {
        if let Some(stamp) = self.stamps.get(key) {
            return Some(*stamp);
        }
        let (storage, prefix) = self.mirror()?;
        let raw = storage.get_item(&key.storage_key(prefix))?;
        match raw.parse::<i64>() {
            Ok(stamp) => {
                self.stamps.insert(key.clone(), stamp);
                Some(stamp)
            }
            Err(error) => {
                warn!(%key, %error, "Ignoring unparsable TTL timestamp");
                None
            }
        }
    }

    /// Whether the value of `key` is older than the TTL.
    ///
    /// Unknown freshness counts as expired.
    pub fn is_expired(&self, key: &StoreKey) -> bool {
        let Some(stamp) = self.last_write(key) else {
            return true;
        };
        let ttl = i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_sub(stamp) > ttl
    }

    fn mirror(&self) -> Option<(&Arc<dyn Storage>, &str)> {
        let storage = self.storage.as_ref()?;
        let prefix = self.config.persist_prefix.as_deref()?;
        Some((storage, prefix))
    }

    fn stamp(&self, key: &StoreKey) {
        let now = self.clock.now_millis();
        self.stamps.insert(key.clone(), now);
        if let Some((storage, prefix)) = self.mirror()
            && let Err(error) = storage.set_item(&key.storage_key(prefix), &now.to_string())
        {
            warn!(%key, %error, "Failed to persist TTL timestamp");
        }
    }

    fn forget(&self, key: &StoreKey) {
        self.stamps.remove(key);
        if let Some((storage, prefix)) = self.mirror()
            && let Err(error) = storage.remove_item(&key.storage_key(prefix))
        {
            warn!(%key, %error, "Failed to remove TTL timestamp");
        }
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for TtlPolicy {
    fn name(&self) -> &str {
        "ttl"
    }

    fn on_change(&self, ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        match ctx.value {
            Some(_) => self.stamp(ctx.key),
            None => self.forget(ctx.key),
        }
        None
    }

    fn should_fetch(&self, ctx: &FetchContext<'_, V>) -> bool {
        if ctx.value.is_none() {
            return true;
        }
        if !self.is_expired(ctx.key) {
            return false;
        }
        if self.config.auto_delete {
            debug!(key = %ctx.key, "Evicting expired entry");
            ctx.store.delete(ctx.key);
            self.forget(ctx.key);
        }
        true
    }

    fn should_revalidate(&self, ctx: &FetchContext<'_, V>) -> bool {
        self.should_fetch(ctx)
    }
}
