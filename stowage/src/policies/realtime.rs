//! Realtime sync between clients.
//!
//! [`RealtimePolicy`] publishes every change of the local store on a shared
//! [`Channel`] and applies the changes other clients publish. Every event
//! carries the `source` id of the client that emitted it; a client ignores
//! its own echoes.
//!
//! # Events
//!
//! ```json
//! { "type": "store:set", "key": "7", "value": { .. }, "source": "a1b2", "updatedAt": "2024-05-01T10:00:00Z" }
//! { "type": "store:delete", "key": "7", "source": "a1b2" }
//! { "type": "store:clear", "source": "a1b2" }
//! { "type": "store:invalidate", "key": "7", "source": "a1b2" }
//! ```
//!
//! `store:set` repeats the version field of the value, if one is configured,
//! next to it.
//!
//! # Conflict resolution
//!
//! With a version configured, an incoming value is applied only if it is at
//! least as new as the cached one: ties go to the remote value, and a value
//! without a (parsable) version is always applied. Versions are read from a
//! field holding either a date string or a number of milliseconds.
//!
//! Remote changes are applied with local publishing suspended, so applying
//! them never echoes them back onto the channel.
//!
//! # Invalidation
//!
//! On `store:invalidate` the key is refetched through `fetch_on_invalidate`,
//! at most one fetch per key at a time. The fetched value goes through the
//! same version check and is additionally dropped when the cached version is
//! newer than the moment the fetch started.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stowage_core::{Clock, StoreKey, StoreValue, SystemClock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::{MissingChannel, RealtimeConfig};
use crate::error::{FetchError, PolicyError};
use crate::manager::StoreHandle;
use crate::metrics;
use crate::offload::{OffloadKey, OffloadManager};
use crate::policy::{ChangeContext, ChangeOrigin, ChangeTask, Policy};

use super::{Fetcher, fetcher};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

tokio::task_local! {
    static SUSPENDED: bool;
}

fn is_suspended() -> bool {
    SUSPENDED.try_with(|suspended| *suspended).unwrap_or(false)
}

/// Runs `apply` with publishing of local changes suspended.
fn suspended<R>(apply: impl FnOnce() -> R) -> R {
    SUSPENDED.sync_scope(true, apply)
}

/// A change published on a realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    /// `key` now holds `value`.
    #[serde(rename = "store:set")]
    Set {
        /// Written key.
        key: StoreKey,
        /// Written value.
        value: Value,
        /// Emitting client.
        source: String,
        /// Version fields copied from the value.
        #[serde(flatten)]
        versions: Map<String, Value>,
    },
    /// `key` was deleted.
    #[serde(rename = "store:delete")]
    Delete {
        /// Deleted key.
        key: StoreKey,
        /// Emitting client.
        source: String,
    },
    /// Every entry was removed.
    #[serde(rename = "store:clear")]
    Clear {
        /// Emitting client.
        source: String,
    },
    /// `key` is stale and should be refetched.
    #[serde(rename = "store:invalidate")]
    Invalidate {
        /// Stale key.
        key: StoreKey,
        /// Emitting client.
        source: String,
    },
}

impl ChannelEvent {
    /// The emitting client.
    pub fn source(&self) -> &str {
        match self {
            Self::Set { source, .. }
            | Self::Delete { source, .. }
            | Self::Clear { source }
            | Self::Invalidate { source, .. } => source,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "store:set",
            Self::Delete { .. } => "store:delete",
            Self::Clear { .. } => "store:clear",
            Self::Invalidate { .. } => "store:invalidate",
        }
    }
}

/// A publish/subscribe channel shared by clients.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publishes `event` to every subscriber, the publisher included.
    async fn publish(&self, event: ChannelEvent) -> Result<(), PolicyError>;

    /// Subscribes to events published from now on.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// In-process [`Channel`].
///
/// Clones share the same subscribers.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    sender: broadcast::Sender<ChannelEvent>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    /// Creates a channel with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a channel letting subscribers lag `capacity` events behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn publish(&self, event: ChannelEvent) -> Result<(), PolicyError> {
        // Nobody listening is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }
}

/// How the policy finds its channel.
#[derive(Clone)]
pub enum ChannelSource {
    /// Always this channel.
    Direct(Arc<dyn Channel>),
    /// Asked every time; `None` means no channel right now.
    Resolver(Arc<dyn Fn() -> Option<Arc<dyn Channel>> + Send + Sync>),
}

impl fmt::Debug for ChannelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("ChannelSource::Direct"),
            Self::Resolver(_) => f.write_str("ChannelSource::Resolver"),
        }
    }
}

impl ChannelSource {
    /// A source resolving through `resolve`.
    pub fn resolver<F>(resolve: F) -> Self
    where
        F: Fn() -> Option<Arc<dyn Channel>> + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(resolve))
    }

    /// The current channel.
    pub fn resolve(&self) -> Option<Arc<dyn Channel>> {
        match self {
            Self::Direct(channel) => Some(Arc::clone(channel)),
            Self::Resolver(resolve) => resolve(),
        }
    }
}

impl<C: Channel + 'static> From<Arc<C>> for ChannelSource {
    fn from(channel: Arc<C>) -> Self {
        Self::Direct(channel)
    }
}

/// Where the version of a value comes from.
pub enum VersionBy<V> {
    /// A field of the serialized value.
    Field(String),
    /// A closure returning epoch millis.
    Extract(Arc<dyn Fn(&V) -> Option<i64> + Send + Sync>),
}

impl<V> Clone for VersionBy<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Field(field) => Self::Field(field.clone()),
            Self::Extract(extract) => Self::Extract(Arc::clone(extract)),
        }
    }
}

impl<V> fmt::Debug for VersionBy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => f.debug_tuple("Field").field(field).finish(),
            Self::Extract(_) => f.write_str("Extract"),
        }
    }
}

impl<V: Serialize> VersionBy<V> {
    /// Versions read from `field`.
    pub fn field(field: impl Into<String>) -> Self {
        Self::Field(field.into())
    }

    /// Versions computed by `extract`.
    pub fn extract<F>(extract: F) -> Self
    where
        F: Fn(&V) -> Option<i64> + Send + Sync + 'static,
    {
        Self::Extract(Arc::new(extract))
    }

    /// Version of `value` in epoch millis.
    pub fn version_of(&self, value: &V) -> Option<i64> {
        match self {
            Self::Field(field) => {
                let json = serde_json::to_value(value).ok()?;
                parse_version(json.get(field)?)
            }
            Self::Extract(extract) => extract(value),
        }
    }
}

/// Reads a version: numbers pass through, strings are parsed as dates.
pub fn parse_version(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64)),
        Value::String(text) => parse_date(text),
        _ => None,
    }
}

fn parse_date(text: &str) -> Option<i64> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.timestamp_millis());
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(date.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc().timestamp_millis())
}

/// Last-writer-wins: unknown versions never block, ties go to the incoming
/// value.
fn accepts(incoming: Option<i64>, current: Option<i64>) -> bool {
    match (incoming, current) {
        (Some(incoming), Some(current)) => incoming >= current,
        _ => true,
    }
}

type ReadySignal = BoxFuture<'static, ()>;

struct Shared<V> {
    client_id: String,
    channel: ChannelSource,
    version_by: Option<VersionBy<V>>,
    fetch_on_invalidate: Option<Fetcher<V>>,
    missing_channel: MissingChannel,
    clock: Arc<dyn Clock>,
    offload: OffloadManager,
    handle: OnceLock<StoreHandle<V>>,
}

impl<V> Shared<V>
where
    V: StoreValue + Serialize + DeserializeOwned,
{
    fn version_of(&self, value: &V) -> Option<i64> {
        self.version_by.as_ref()?.version_of(value)
    }

    fn channel(&self) -> Result<Option<Arc<dyn Channel>>, PolicyError> {
        match self.channel.resolve() {
            Some(channel) => Ok(Some(channel)),
            None => match self.missing_channel {
                MissingChannel::Warn => {
                    warn!(client_id = %self.client_id, "No realtime channel, skipping");
                    Ok(None)
                }
                MissingChannel::Error => Err(PolicyError::ChannelUnavailable),
            },
        }
    }

    async fn publish(&self, event: ChannelEvent) -> Result<(), PolicyError> {
        match self.channel()? {
            Some(channel) => channel.publish(event).await,
            None => Ok(()),
        }
    }

    fn outgoing(&self, key: &StoreKey, value: Option<&V>) -> Result<ChannelEvent, PolicyError> {
        let source = self.client_id.clone();
        let Some(value) = value else {
            return Ok(ChannelEvent::Delete {
                key: key.clone(),
                source,
            });
        };
        let value = serde_json::to_value(value)?;
        let mut versions = Map::new();
        if let Some(VersionBy::Field(field)) = &self.version_by
            && let Some(version) = value.get(field)
        {
            versions.insert(field.clone(), version.clone());
        }
        Ok(ChannelEvent::Set {
            key: key.clone(),
            value,
            source,
            versions,
        })
    }

    fn incoming_version(&self, value: &V, versions: &Map<String, Value>) -> Option<i64> {
        if let Some(VersionBy::Field(field)) = &self.version_by
            && let Some(version) = versions.get(field).and_then(parse_version)
        {
            return Some(version);
        }
        self.version_of(value)
    }

    fn apply_value(&self, handle: &StoreHandle<V>, key: StoreKey, value: V, version: Option<i64>) {
        let current = handle.get(&key).and_then(|current| self.version_of(&current));
        if !accepts(version, current) {
            debug!(%key, ?version, ?current, "Rejecting older remote value");
            metrics::record_realtime_rejected();
            return;
        }
        suspended(|| handle.set(key, value, ChangeOrigin::Remote));
        metrics::record_realtime_applied("store:set");
    }

    fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        if event.source() == self.client_id {
            return;
        }
        let Some(handle) = self.handle.get() else {
            return;
        };
        let kind = event.kind();
        debug!(event = kind, source = %event.source(), "Remote event");

        match event {
            ChannelEvent::Set {
                key,
                value,
                versions,
                ..
            } => match serde_json::from_value::<V>(value) {
                Ok(value) => {
                    let version = self.incoming_version(&value, &versions);
                    self.apply_value(handle, key, value, version);
                }
                Err(error) => warn!(%key, %error, "Dropping undecodable remote value"),
            },
            ChannelEvent::Delete { key, .. } => {
                suspended(|| handle.delete(key, ChangeOrigin::Remote));
                metrics::record_realtime_applied(kind);
            }
            ChannelEvent::Clear { .. } => {
                suspended(|| handle.clear(ChangeOrigin::Remote));
                metrics::record_realtime_applied(kind);
            }
            ChannelEvent::Invalidate { key, .. } => self.refetch(handle.clone(), key),
        }
    }

    fn refetch(self: &Arc<Self>, handle: StoreHandle<V>, key: StoreKey) {
        let Some(fetch) = self.fetch_on_invalidate.clone() else {
            return;
        };
        let shared = Arc::clone(self);
        let task_key = key.clone();
        let spawned = self.offload.spawn_keyed(
            OffloadKey::keyed("invalidate", key.clone()),
            async move {
                let started = shared.clock.now_millis();
                let Some(value) = fetch(key.clone()).await? else {
                    return Ok(());
                };
                let current = handle.get(&key).and_then(|current| shared.version_of(&current));
                if current.is_some_and(|current| started < current) {
                    debug!(%key, started, current, "Dropping fetch older than cached value");
                    metrics::record_realtime_rejected();
                    return Ok(());
                }
                let version = shared.version_of(&value);
                shared.apply_value(&handle, key, value, version);
                Ok::<(), PolicyError>(())
            },
        );
        if spawned.is_none() {
            debug!(key = %task_key, "Invalidation fetch already pending");
        }
    }
}

/// Syncs a store with other clients over a [`Channel`].
pub struct RealtimePolicy<V> {
    shared: Arc<Shared<V>>,
    wait_for: Mutex<Option<ReadySignal>>,
    subscription: Mutex<Option<AbortHandle>>,
}

impl<V> fmt::Debug for RealtimePolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimePolicy")
            .field("client_id", &self.shared.client_id)
            .field("channel", &self.shared.channel)
            .field("version_by", &self.shared.version_by)
            .field("missing_channel", &self.shared.missing_channel)
            .finish_non_exhaustive()
    }
}

impl<V> RealtimePolicy<V>
where
    V: StoreValue + Serialize + DeserializeOwned,
{
    /// Creates a builder publishing on `channel`.
    pub fn builder(channel: impl Into<ChannelSource>) -> RealtimePolicyBuilder<V> {
        RealtimePolicyBuilder::new(channel.into())
    }

    /// Identifier tagged onto this client's events.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Whether a refetch of `key` triggered by an invalidation is running.
    pub fn is_fetch_pending(&self, key: impl Into<StoreKey>) -> bool {
        self.shared
            .offload
            .is_in_flight(&OffloadKey::keyed("invalidate", key))
    }

    /// Asks other clients to refetch `key`.
    pub async fn invalidate(&self, key: impl Into<StoreKey>) -> Result<(), PolicyError> {
        self.shared
            .publish(ChannelEvent::Invalidate {
                key: key.into(),
                source: self.shared.client_id.clone(),
            })
            .await
    }

    /// Asks other clients to clear their stores.
    pub async fn broadcast_clear(&self) -> Result<(), PolicyError> {
        self.shared
            .publish(ChannelEvent::Clear {
                source: self.shared.client_id.clone(),
            })
            .await
    }

    fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.abort();
        }
    }
}

#[async_trait]
impl<V> Policy<V> for RealtimePolicy<V>
where
    V: StoreValue + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        "realtime"
    }

    async fn on_attach(&self, handle: &StoreHandle<V>) -> Result<(), PolicyError> {
        if self.shared.handle.set(handle.clone()).is_err() {
            warn!(client_id = %self.shared.client_id, "Realtime policy attached twice");
        }

        let wait_for = self.wait_for.lock().take();
        if let Some(ready) = wait_for {
            ready.await;
        }

        let Some(channel) = self.shared.channel()? else {
            return Ok(());
        };
        let mut events = channel.subscribe();
        let shared = Arc::clone(&self.shared);
        let span = info_span!("realtime_subscription", client_id = %shared.client_id);
        let task = tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => shared.handle_event(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Realtime subscription lagged, events lost");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Realtime channel closed");
            }
            .instrument(span),
        );
        if let Some(previous) = self.subscription.lock().replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn on_change(&self, ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        if ctx.origin == ChangeOrigin::Remote || is_suspended() {
            return None;
        }
        let event = match self.shared.outgoing(ctx.key, ctx.value) {
            Ok(event) => event,
            Err(error) => return Some(futures::future::ready(Err(error)).boxed()),
        };
        let channel = match self.shared.channel() {
            Ok(Some(channel)) => channel,
            Ok(None) => return None,
            Err(error) => return Some(futures::future::ready(Err(error)).boxed()),
        };
        Some(async move { channel.publish(event).await }.boxed())
    }

    async fn on_detach(&self) -> Result<(), PolicyError> {
        self.stop();
        Ok(())
    }
}

impl<V> Drop for RealtimePolicy<V> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.abort();
        }
    }
}

/// Builder for [`RealtimePolicy`].
pub struct RealtimePolicyBuilder<V> {
    channel: ChannelSource,
    config: RealtimeConfig,
    version_by: Option<VersionBy<V>>,
    fetch_on_invalidate: Option<Fetcher<V>>,
    wait_for: Option<ReadySignal>,
    clock: Arc<dyn Clock>,
}

impl<V> RealtimePolicyBuilder<V>
where
    V: StoreValue + Serialize + DeserializeOwned,
{
    fn new(channel: ChannelSource) -> Self {
        Self {
            channel,
            config: RealtimeConfig::default(),
            version_by: None,
            fetch_on_invalidate: None,
            wait_for: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Applies `config`. A `version_by` field in it is used unless
    /// [`version_by`](Self::version_by) is called.
    pub fn config(self, config: RealtimeConfig) -> Self {
        Self { config, ..self }
    }

    /// Sets how versions are read.
    pub fn version_by(self, version_by: VersionBy<V>) -> Self {
        Self {
            version_by: Some(version_by),
            ..self
        }
    }

    /// Refetches invalidated keys through `fetch`.
    pub fn fetch_on_invalidate<F, Fut>(self, fetch: F) -> Self
    where
        F: Fn(StoreKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
    {
        Self {
            fetch_on_invalidate: Some(fetcher(fetch)),
            ..self
        }
    }

    /// Delays subscribing until `ready` completes.
    pub fn wait_for<F>(self, ready: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            wait_for: Some(ready.boxed()),
            ..self
        }
    }

    /// Reads time from `clock`.
    pub fn clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    /// Builds the policy.
    pub fn build(self) -> RealtimePolicy<V> {
        let client_id = self
            .config
            .client_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let version_by = self
            .version_by
            .or_else(|| self.config.version_by.map(VersionBy::Field));
        RealtimePolicy {
            shared: Arc::new(Shared {
                client_id,
                channel: self.channel,
                version_by,
                fetch_on_invalidate: self.fetch_on_invalidate,
                missing_channel: self.config.missing_channel,
                clock: self.clock,
                offload: OffloadManager::default(),
                handle: OnceLock::new(),
            }),
            wait_for: Mutex::new(self.wait_for),
            subscription: Mutex::new(None),
        }
    }
}
