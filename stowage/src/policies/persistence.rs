//! Entry persistence.
//!
//! [`PersistencePolicy`] mirrors every entry into a [`Storage`] as JSON under
//! `prefix:key`. The storage has no prefix index, so attaching scans every
//! key in it and seeds the store with the entries under the prefix. Entries
//! that fail to parse are skipped with a warning.
//!
//! Seeding writes the raw store: values loaded from storage are not changes,
//! and other policies do not see them.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stowage_core::{Storage, StoreKey, StoreValue};
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::error::PolicyError;
use crate::manager::StoreHandle;
use crate::policy::{ChangeContext, ChangeTask, Policy};

/// Mirrors entries into durable storage.
pub struct PersistencePolicy<V> {
    config: PersistenceConfig,
    storage: Arc<dyn Storage>,
    _value: PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for PersistencePolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistencePolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V> PersistencePolicy<V>
where
    V: StoreValue + Serialize + DeserializeOwned,
{
    /// Creates a policy persisting into `storage`.
    pub fn new(config: PersistenceConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            _value: PhantomData,
        }
    }

    /// Reads every persisted entry under the prefix.
    pub fn load(&self) -> Vec<(StoreKey, V)> {
        let prefix = self.config.prefix.as_str();
        self.storage
            .keys()
            .into_iter()
            .filter_map(|raw| {
                let key = StoreKey::strip_prefix(&raw, prefix)?;
                let text = self.storage.get_item(&raw)?;
                match serde_json::from_str(&text) {
                    Ok(value) => Some((key, value)),
                    Err(error) => {
                        warn!(storage_key = %raw, %error, "Skipping unparsable persisted entry");
                        None
                    }
                }
            })
            .collect()
    }

    fn write(&self, key: &StoreKey, value: Option<&V>) -> Result<(), PolicyError> {
        let storage_key = key.storage_key(&self.config.prefix);
        match value {
            Some(value) => {
                let text = serde_json::to_string(value)?;
                self.storage.set_item(&storage_key, &text)?;
            }
            None => self.storage.remove_item(&storage_key)?,
        }
        Ok(())
    }
}

#[async_trait]
impl<V> Policy<V> for PersistencePolicy<V>
where
    V: StoreValue + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        "persistence"
    }

    async fn on_attach(&self, handle: &StoreHandle<V>) -> Result<(), PolicyError> {
        let entries = self.load();
        debug!(prefix = %self.config.prefix, entries = entries.len(), "Seeding store from storage");
        for (key, value) in entries {
            handle.store().set(key, value);
        }
        Ok(())
    }

    fn on_change(&self, ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        if let Err(error) = self.write(ctx.key, ctx.value) {
            warn!(key = %ctx.key, %error, "Failed to persist entry");
        }
        None
    }
}
