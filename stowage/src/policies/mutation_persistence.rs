//! Mutation queue persistence.
//!
//! [`MutationPersistencePolicy`] keeps an opaque snapshot of a
//! [`MutationQueue`] in durable storage, so mutations queued while offline
//! survive a restart. It does not persist store entries.
//!
//! Two backends are supported:
//!
//! - [`QueueBackend::Sync`] - a [`Storage`], the snapshot stored as JSON text
//!   under the configured storage key;
//! - [`QueueBackend::Async`] - a [`MutationDatabase`], an object database with
//!   one record per storage key in the [`MUTATION_STORE_NAME`] object store of
//!   the [`MUTATION_DB_NAME`] database.
//!
//! Attaching loads the snapshot, restores it into the queue and immediately
//! replays the queue. The snapshot is written again after every change and
//! whenever the queue reports that it changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use stowage_core::{Storage, StorageError, StoreValue};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::MutationPersistenceConfig;
use crate::error::PolicyError;
use crate::manager::StoreHandle;
use crate::policy::{ChangeContext, ChangeTask, Policy};

/// Name of the database holding persisted queues.
pub const MUTATION_DB_NAME: &str = "MutationPersistenceDB";

/// Name of the object store holding persisted queues.
pub const MUTATION_STORE_NAME: &str = "mutations";

/// Result of one replay of a mutation queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Mutations sent successfully and removed from the queue.
    pub replayed: usize,
    /// Mutations that failed and went back into the queue.
    pub requeued: usize,
}

/// A queue of pending mutations that can be snapshotted and replayed.
#[async_trait]
pub trait MutationQueue: Send + Sync {
    /// Serializable snapshot of the queue.
    fn queue_snapshot(&self) -> Result<Value, serde_json::Error>;

    /// Adds the mutations of `snapshot` ahead of anything queued since.
    fn restore_queue(&self, snapshot: Value) -> Result<(), serde_json::Error>;

    /// Sends every queued mutation, re-queueing the ones that fail.
    async fn replay_queue(&self) -> ReplayOutcome;

    /// Notifications of queue changes, if the queue offers them.
    fn watch_queue(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Asynchronous object database, modelled on a browser object store.
#[async_trait]
pub trait MutationDatabase: Send + Sync {
    /// Reads the record `key` of object store `store`.
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StorageError>;

    /// Writes the record `key` of object store `store`.
    async fn put(&self, store: &str, key: &str, value: Value) -> Result<(), StorageError>;
}

/// In-memory [`MutationDatabase`].
#[derive(Debug)]
pub struct MemoryMutationDatabase {
    name: String,
    records: RwLock<HashMap<(String, String), Value>>,
}

impl Default for MemoryMutationDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMutationDatabase {
    /// Creates an empty database named [`MUTATION_DB_NAME`].
    pub fn new() -> Self {
        Self {
            name: MUTATION_DB_NAME.to_owned(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// The database name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl MutationDatabase for MemoryMutationDatabase {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .records
            .read()
            .get(&(store.to_owned(), key.to_owned()))
            .cloned())
    }

    async fn put(&self, store: &str, key: &str, value: Value) -> Result<(), StorageError> {
        self.records
            .write()
            .insert((store.to_owned(), key.to_owned()), value);
        Ok(())
    }
}

/// Where a queue snapshot is kept.
#[derive(Clone)]
pub enum QueueBackend {
    /// Synchronous string storage.
    Sync(Arc<dyn Storage>),
    /// Asynchronous object database.
    Async(Arc<dyn MutationDatabase>),
}

impl fmt::Debug for QueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("QueueBackend::Sync"),
            Self::Async(_) => f.write_str("QueueBackend::Async"),
        }
    }
}

#[derive(Clone)]
struct Persister {
    storage_key: String,
    backend: QueueBackend,
    queue: Arc<dyn MutationQueue>,
}

impl Persister {
    async fn load(&self) -> Result<Option<Value>, PolicyError> {
        match &self.backend {
            QueueBackend::Sync(storage) => match storage.get_item(&self.storage_key) {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            },
            QueueBackend::Async(database) => Ok(database
                .get(MUTATION_STORE_NAME, &self.storage_key)
                .await?),
        }
    }

    async fn persist(&self) -> Result<(), PolicyError> {
        let snapshot = self.queue.queue_snapshot()?;
        match &self.backend {
            QueueBackend::Sync(storage) => {
                let text = serde_json::to_string(&snapshot)?;
                storage.set_item(&self.storage_key, &text)?;
            }
            QueueBackend::Async(database) => {
                database
                    .put(MUTATION_STORE_NAME, &self.storage_key, snapshot)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Persists a mutation queue and replays it on attach.
pub struct MutationPersistencePolicy {
    persister: Persister,
    watcher: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for MutationPersistencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationPersistencePolicy")
            .field("storage_key", &self.persister.storage_key)
            .field("backend", &self.persister.backend)
            .finish_non_exhaustive()
    }
}

impl MutationPersistencePolicy {
    /// Creates a policy persisting `queue` into `backend`.
    pub fn new(
        config: MutationPersistenceConfig,
        backend: QueueBackend,
        queue: Arc<dyn MutationQueue>,
    ) -> Self {
        Self {
            persister: Persister {
                storage_key: config.storage_key,
                backend,
                queue,
            },
            watcher: Mutex::new(None),
        }
    }

    /// Reads the persisted snapshot.
    pub async fn load(&self) -> Result<Option<Value>, PolicyError> {
        self.persister.load().await
    }

    /// Writes the current queue snapshot.
    pub async fn persist(&self) -> Result<(), PolicyError> {
        self.persister.persist().await
    }

    fn watch(&self) {
        let Some(mut changes) = self.persister.queue.watch_queue() else {
            return;
        };
        let persister = self.persister.clone();
        let task = tokio::spawn(
            async move {
                while changes.changed().await.is_ok() {
                    if let Err(error) = persister.persist().await {
                        warn!(%error, "Failed to persist mutation queue");
                    }
                }
            }
            .instrument(info_span!("mutation_queue_watch")),
        );
        if let Some(previous) = self.watcher.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for MutationPersistencePolicy {
    fn name(&self) -> &str {
        "mutation_persistence"
    }

    async fn on_attach(&self, _handle: &StoreHandle<V>) -> Result<(), PolicyError> {
        // An unreadable snapshot is dropped; the queue starts empty and the
        // next persist overwrites it.
        match self.load().await {
            Ok(Some(snapshot)) => {
                if let Err(error) = self.persister.queue.restore_queue(snapshot) {
                    warn!(%error, "Discarding unparsable mutation queue snapshot");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "Failed to load mutation queue snapshot"),
        }
        let outcome = self.persister.queue.replay_queue().await;
        debug!(
            replayed = outcome.replayed,
            requeued = outcome.requeued,
            "Restored mutation queue replayed"
        );
        self.watch();
        self.persist().await
    }

    fn on_change(&self, _ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        let persister = self.persister.clone();
        Some(async move { persister.persist().await }.boxed())
    }

    async fn on_detach(&self) -> Result<(), PolicyError> {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        Ok(())
    }
}

impl Drop for MutationPersistencePolicy {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}
