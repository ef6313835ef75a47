//! Tracking of spawned continuations.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use smol_str::SmolStr;
use stowage_core::StoreKey;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::PolicyError;

use super::config::{ContinuationTimeout, OffloadConfig};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

type TaskResult = Result<(), PolicyError>;

/// Identity of a tracked continuation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OffloadKey {
    /// Work on one store key. At most one runs per kind and key.
    Keyed {
        /// What the continuation does, such as `"invalidate"`.
        kind: SmolStr,
        /// Store key the continuation works on.
        key: StoreKey,
    },
    /// Fire-and-forget work, numbered within the manager.
    Anonymous {
        /// Name of the spawning policy.
        kind: SmolStr,
        /// Sequence number within the manager.
        seq: u64,
    },
}

impl OffloadKey {
    /// Key for `kind` work on store key `key`.
    pub fn keyed(kind: impl Into<SmolStr>, key: impl Into<StoreKey>) -> Self {
        Self::Keyed {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// What the continuation does, for tracing.
    pub fn kind(&self) -> &str {
        match self {
            Self::Keyed { kind, .. } | Self::Anonymous { kind, .. } => kind,
        }
    }
}

#[derive(Debug)]
struct Tracker {
    config: OffloadConfig,
    running: DashMap<OffloadKey, AbortHandle>,
    seq: AtomicU64,
}

impl Tracker {
    /// Forgets `key` unless a newer task has replaced this one.
    fn release(&self, key: &OffloadKey) {
        let current = tokio::task::try_id();
        self.running
            .remove_if(key, |_, handle| Some(handle.id()) == current);
    }

    fn prune(&self) {
        self.running.retain(|_, handle| !handle.is_finished());
    }
}

/// Spawns policy continuations and keeps track of the ones still running.
///
/// Clones share one task table.
#[derive(Clone, Debug)]
pub struct OffloadManager {
    tracker: Arc<Tracker>,
}

impl OffloadManager {
    /// Creates a manager with an empty task table.
    pub fn new(config: OffloadConfig) -> Self {
        Self {
            tracker: Arc::new(Tracker {
                config,
                running: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Spawns an anonymous continuation. Dropping the handle does not abort it.
    pub fn spawn<F>(&self, kind: impl Into<SmolStr>, task: F) -> JoinHandle<TaskResult>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let seq = self.tracker.seq.fetch_add(1, Ordering::Relaxed);
        self.launch(
            OffloadKey::Anonymous {
                kind: kind.into(),
                seq,
            },
            task,
        )
    }

    /// Spawns a continuation for `key`, or returns `None` when deduplication
    /// is on and one for the same key is still running.
    pub fn spawn_keyed<F>(&self, key: OffloadKey, task: F) -> Option<JoinHandle<TaskResult>>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        if self.tracker.config.deduplicate && self.is_in_flight(&key) {
            debug!(kind = key.kind(), ?key, "skipping duplicate continuation");
            return None;
        }
        Some(self.launch(key, task))
    }

    /// Whether a continuation for `key` is still running.
    pub fn is_in_flight(&self, key: &OffloadKey) -> bool {
        self.tracker
            .running
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of continuations that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker
            .running
            .iter()
            .filter(|entry| !entry.is_finished())
            .count()
    }

    /// Waits until nothing is running, including continuations spawned in
    /// the meantime.
    ///
    /// Polls on a timer rather than yielding so tasks sleeping on a paused
    /// clock are driven forward.
    pub async fn wait_all(&self) {
        loop {
            self.tracker.prune();
            if self.tracker.running.is_empty() {
                return;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    fn launch<F>(&self, key: OffloadKey, task: F) -> JoinHandle<TaskResult>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let tracker = Arc::clone(&self.tracker);
        let timeout = self.tracker.config.timeout;
        let span = info_span!("continuation", kind = key.kind());
        let own_key = key.clone();

        let handle = tokio::spawn(
            async move {
                let result = run_bounded(timeout, task).await;
                if let Err(error) = &result {
                    debug!(key = ?own_key, %error, "continuation failed");
                }
                tracker.release(&own_key);
                result
            }
            .instrument(span),
        );

        self.tracker.running.insert(key, handle.abort_handle());
        handle
    }
}

async fn run_bounded<F>(timeout: ContinuationTimeout, task: F) -> TaskResult
where
    F: Future<Output = TaskResult>,
{
    match timeout {
        ContinuationTimeout::Unbounded => task.await,
        ContinuationTimeout::Abort(limit) => tokio::time::timeout(limit, task)
            .await
            .unwrap_or_else(|_| {
                warn!(limit_ms = limit.as_millis(), "continuation aborted after timeout");
                Err(PolicyError::TaskTimeout(limit))
            }),
        ContinuationTimeout::WarnAfter(limit) => {
            let started = Instant::now();
            let result = task.await;
            let elapsed = started.elapsed();
            if elapsed > limit {
                warn!(
                    elapsed_ms = elapsed.as_millis(),
                    limit_ms = limit.as_millis(),
                    "continuation ran past its limit"
                );
            }
            result
        }
    }
}

impl Default for OffloadManager {
    fn default() -> Self {
        Self::new(OffloadConfig::default())
    }
}
