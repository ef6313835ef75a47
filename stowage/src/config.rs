//! Policy configuration.
//!
//! Every policy takes a small `*Config` struct. All of them deserialize from
//! human-friendly documents, with durations written as `"1s"`, `"500ms"` or
//! `"5m"`, and all of them have a builder for use from code:
//!
//! ```
//! use std::time::Duration;
//! use stowage::config::TtlConfig;
//!
//! let config = TtlConfig::builder()
//!     .ttl(Duration::from_secs(30))
//!     .auto_delete(true)
//!     .build();
//! assert!(config.auto_delete);
//! ```
//!
//! [`StoreConfig`] bundles the sections of one store so that a whole setup
//! can live in a YAML file:
//!
//! ```yaml
//! ttl:
//!   ttl: 30s
//!   auto_delete: true
//! optimistic:
//!   max_retries: 5
//!   retry_delay: 250ms
//! realtime:
//!   version_by: updatedAt
//!   missing_channel: error
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_core::StoreKey;

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default namespace of persisted entries.
pub const DEFAULT_PERSISTENCE_PREFIX: &str = "store";

/// Default storage key of a persisted mutation queue.
pub const DEFAULT_QUEUE_STORAGE_KEY: &str = "mutation-queue";

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_worker_timeout() -> Duration {
    DEFAULT_WORKER_TIMEOUT
}

fn default_prefix() -> String {
    DEFAULT_PERSISTENCE_PREFIX.to_owned()
}

fn default_storage_key() -> String {
    DEFAULT_QUEUE_STORAGE_KEY.to_owned()
}

/// Freshness settings of [`TtlPolicy`](crate::policies::TtlPolicy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtlConfig {
    /// Age after which a value is stale (e.g., "30s", "5m").
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    /// Delete a stale entry when a freshness check finds it.
    #[serde(default)]
    pub auto_delete: bool,
    /// Mirror write timestamps into durable storage under `prefix:key`.
    #[serde(default)]
    pub persist_prefix: Option<String>,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            auto_delete: false,
            persist_prefix: None,
        }
    }
}

impl TtlConfig {
    /// Create a new builder.
    pub fn builder() -> TtlConfigBuilder {
        TtlConfigBuilder::default()
    }
}

/// Builder for [`TtlConfig`].
#[derive(Debug, Clone, Default)]
pub struct TtlConfigBuilder {
    config: TtlConfig,
}

impl TtlConfigBuilder {
    /// Set the time-to-live.
    pub fn ttl(self, ttl: Duration) -> Self {
        Self {
            config: TtlConfig { ttl, ..self.config },
        }
    }

    /// Delete stale entries on check.
    pub fn auto_delete(self, auto_delete: bool) -> Self {
        Self {
            config: TtlConfig {
                auto_delete,
                ..self.config
            },
        }
    }

    /// Mirror timestamps into storage under `prefix`.
    pub fn persist_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            config: TtlConfig {
                persist_prefix: Some(prefix.into()),
                ..self.config
            },
        }
    }

    /// Build the config.
    pub fn build(self) -> TtlConfig {
        self.config
    }
}

/// Schedule of [`BackgroundRefreshPolicy`](crate::policies::BackgroundRefreshPolicy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackgroundRefreshConfig {
    /// Time between two refresh sweeps.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Keys to refresh; every key in the store when absent.
    #[serde(default)]
    pub keys: Option<Vec<StoreKey>>,
}

impl Default for BackgroundRefreshConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            keys: None,
        }
    }
}

impl BackgroundRefreshConfig {
    /// Create a new builder.
    pub fn builder() -> BackgroundRefreshConfigBuilder {
        BackgroundRefreshConfigBuilder::default()
    }
}

/// Builder for [`BackgroundRefreshConfig`].
#[derive(Debug, Clone, Default)]
pub struct BackgroundRefreshConfigBuilder {
    config: BackgroundRefreshConfig,
}

impl BackgroundRefreshConfigBuilder {
    /// Set the sweep interval.
    pub fn interval(self, interval: Duration) -> Self {
        Self {
            config: BackgroundRefreshConfig {
                interval,
                ..self.config
            },
        }
    }

    /// Restrict sweeps to `keys`.
    pub fn keys<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<StoreKey>,
    {
        Self {
            config: BackgroundRefreshConfig {
                keys: Some(keys.into_iter().map(Into::into).collect()),
                ..self.config
            },
        }
    }

    /// Build the config.
    pub fn build(self) -> BackgroundRefreshConfig {
        self.config
    }
}

/// Retry schedule of [`OptimisticMutationPolicy`](crate::policies::OptimisticMutationPolicy).
///
/// The n-th retry waits `retry_delay * 2^(n-1)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptimisticConfig {
    /// Retries after the first attempt; the mutation runs at most
    /// `max_retries + 1` times.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl OptimisticConfig {
    /// Create a new builder.
    pub fn builder() -> OptimisticConfigBuilder {
        OptimisticConfigBuilder::default()
    }

    /// Delay before retry number `attempt`, counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_delay.saturating_mul(1u32 << exponent)
    }
}

/// Builder for [`OptimisticConfig`].
#[derive(Debug, Clone, Default)]
pub struct OptimisticConfigBuilder {
    config: OptimisticConfig,
}

impl OptimisticConfigBuilder {
    /// Set the retry budget.
    pub fn max_retries(self, max_retries: u32) -> Self {
        Self {
            config: OptimisticConfig {
                max_retries,
                ..self.config
            },
        }
    }

    /// Set the first retry delay.
    pub fn retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            config: OptimisticConfig {
                retry_delay,
                ..self.config
            },
        }
    }

    /// Build the config.
    pub fn build(self) -> OptimisticConfig {
        self.config
    }
}

/// Namespace of [`PersistencePolicy`](crate::policies::PersistencePolicy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Entries live under `prefix:key`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

impl PersistenceConfig {
    /// Config with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// Location of a persisted mutation queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationPersistenceConfig {
    /// Key of the single record holding the queue.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

impl Default for MutationPersistenceConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
        }
    }
}

/// Request settings of the worker-delegating policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long to wait for the worker's reply.
    #[serde(default = "default_worker_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Config with a custom reply timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// What a realtime policy does when no channel can be resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingChannel {
    /// Log a warning and skip the broadcast.
    #[default]
    Warn,
    /// Fail with [`PolicyError::ChannelUnavailable`](crate::PolicyError).
    Error,
}

/// Settings of [`RealtimePolicy`](crate::policies::RealtimePolicy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RealtimeConfig {
    /// Identifier tagged onto outgoing events; random when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Field of the value holding its version (a date string or a number).
    #[serde(default)]
    pub version_by: Option<String>,
    /// Behavior without a channel.
    #[serde(default)]
    pub missing_channel: MissingChannel,
}

impl RealtimeConfig {
    /// Create a new builder.
    pub fn builder() -> RealtimeConfigBuilder {
        RealtimeConfigBuilder::default()
    }
}

/// Builder for [`RealtimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RealtimeConfigBuilder {
    config: RealtimeConfig,
}

impl RealtimeConfigBuilder {
    /// Set the client identifier.
    pub fn client_id(self, client_id: impl Into<String>) -> Self {
        Self {
            config: RealtimeConfig {
                client_id: Some(client_id.into()),
                ..self.config
            },
        }
    }

    /// Compare values by `field`.
    pub fn version_by(self, field: impl Into<String>) -> Self {
        Self {
            config: RealtimeConfig {
                version_by: Some(field.into()),
                ..self.config
            },
        }
    }

    /// Set the missing channel behavior.
    pub fn missing_channel(self, missing_channel: MissingChannel) -> Self {
        Self {
            config: RealtimeConfig {
                missing_channel,
                ..self.config
            },
        }
    }

    /// Build the config.
    pub fn build(self) -> RealtimeConfig {
        self.config
    }
}

/// Every policy section of one store.
///
/// Absent sections mean the policy is not used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoreConfig {
    /// Freshness.
    #[serde(default)]
    pub ttl: Option<TtlConfig>,
    /// Scheduled revalidation.
    #[serde(default)]
    pub background_refresh: Option<BackgroundRefreshConfig>,
    /// Optimistic writes.
    #[serde(default)]
    pub optimistic: Option<OptimisticConfig>,
    /// Entry persistence.
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
    /// Mutation queue persistence.
    #[serde(default)]
    pub mutation_persistence: Option<MutationPersistenceConfig>,
    /// Worker-delegated I/O.
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    /// Realtime sync.
    #[serde(default)]
    pub realtime: Option<RealtimeConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let config = OptimisticConfig::builder()
            .retry_delay(Duration::from_millis(100))
            .build();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_saturates() {
        let config = OptimisticConfig::default();
        assert_eq!(config.backoff(200), Duration::from_secs(1).saturating_mul(1 << 31));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(WorkerConfig::default().timeout, Duration::from_secs(5));
        assert_eq!(OptimisticConfig::default().max_retries, 3);
        assert_eq!(PersistenceConfig::default().prefix, "store");
        assert_eq!(
            MutationPersistenceConfig::default().storage_key,
            "mutation-queue"
        );
        assert_eq!(RealtimeConfig::default().missing_channel, MissingChannel::Warn);
    }
}
