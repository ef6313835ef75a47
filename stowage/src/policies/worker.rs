//! Network I/O delegated to an out-of-process worker.
//!
//! Each request is posted to the current [`WorkerController`] together with
//! a dedicated reply port (a `oneshot` channel) and waits for exactly one
//! reply, bounded by the configured timeout.
//!
//! # Wire format
//!
//! Requests:
//!
//! ```json
//! { "type": "FETCH_REQUEST", "payload": { "key": "7", "url": "/api/contacts/7" } }
//! { "type": "MUTATION_REQUEST", "payload": { "key": "7", "url": "/api/contacts/7", "method": "PUT", "body": {} } }
//! ```
//!
//! Replies are one of `{ "response": .. }`, `{ "success": .. }` or
//! `{ "error": "message" }`. Any other shape is a
//! [`RequestError::InvalidResponse`], distinct from transport failures.
//!
//! # Offline behavior
//!
//! Without a controller, [`ServiceWorkerFetchPolicy`] falls back to a direct
//! [`Transport`] if one is configured and fails otherwise.
//! [`QueuedMutationPolicy`] queues the mutation instead and sends it on the
//! next [`replay_queue`](MutationQueue::replay_queue).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_core::{StoreKey, StoreValue};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::error::{FetchError, MutationError, PolicyError, RequestError};
use crate::metrics;
use crate::policy::{Capabilities, ChangeContext, ChangeOrigin, ChangeTask, FetchContext, Policy};

use super::mutation_persistence::{MutationQueue, ReplayOutcome};

/// Kind of a worker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRequestType {
    /// Read a resource.
    FetchRequest,
    /// Change a resource.
    MutationRequest,
}

/// HTTP method of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Create.
    Post,
    /// Replace.
    Put,
    /// Remove.
    Delete,
}

/// Body of a worker request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Store key the request is about.
    pub key: StoreKey,
    /// Resource location.
    pub url: String,
    /// Method of a mutation; absent for fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    /// Body of a mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A message posted to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Request kind.
    #[serde(rename = "type")]
    pub kind: WorkerRequestType,
    /// Request body.
    pub payload: RequestPayload,
}

/// A mutation waiting to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Store key the mutation is about.
    pub key: StoreKey,
    /// Resource location.
    pub url: String,
    /// Method.
    pub method: HttpMethod,
    /// Body.
    #[serde(default)]
    pub body: Option<Value>,
}

impl From<QueuedMutation> for WorkerRequest {
    fn from(mutation: QueuedMutation) -> Self {
        Self {
            kind: WorkerRequestType::MutationRequest,
            payload: RequestPayload {
                key: mutation.key,
                url: mutation.url,
                method: Some(mutation.method),
                body: mutation.body,
            },
        }
    }
}

/// A well-formed worker reply.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// `{ "response": .. }`
    Response(Value),
    /// `{ "success": .. }`
    Success(Value),
}

impl WorkerReply {
    /// Parses a raw reply message.
    pub fn parse(message: Value) -> Result<Self, RequestError> {
        let Value::Object(mut fields) = message else {
            return Err(RequestError::InvalidResponse);
        };
        if let Some(error) = fields.remove("error") {
            let message = match error {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Err(RequestError::Remote(message));
        }
        if let Some(response) = fields.remove("response") {
            return Ok(Self::Response(response));
        }
        if let Some(success) = fields.remove("success") {
            return Ok(Self::Success(success));
        }
        Err(RequestError::InvalidResponse)
    }
}

/// The out-of-process worker.
pub trait WorkerController: Send + Sync {
    /// Posts `request`; the worker answers once through `reply`.
    ///
    /// Dropping `reply` without answering is reported as a transport error.
    fn post_message(&self, request: WorkerRequest, reply: oneshot::Sender<Value>);
}

/// Returns the worker currently in control, if any.
pub type ControllerSource = Arc<dyn Fn() -> Option<Arc<dyn WorkerController>> + Send + Sync>;

/// Direct network access used when no worker is available.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches the resource at `url`. `Value::Null` means "not found".
    async fn fetch(&self, url: &str) -> Result<Value, RequestError>;
}

async fn send_request(
    controller: &dyn WorkerController,
    request: WorkerRequest,
    timeout: Duration,
) -> Result<WorkerReply, RequestError> {
    let (reply_port, reply) = oneshot::channel();
    controller.post_message(request, reply_port);
    match tokio::time::timeout(timeout, reply).await {
        Ok(Ok(message)) => WorkerReply::parse(message),
        Ok(Err(_)) => Err(RequestError::Transport(
            "reply port closed without a response".to_owned(),
        )),
        Err(_) => Err(RequestError::Timeout(timeout)),
    }
}

fn decode<V: DeserializeOwned>(value: Value) -> Result<Option<V>, FetchError> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

type UrlFn = Arc<dyn Fn(&StoreKey) -> String + Send + Sync>;

/// Fetches values through the worker.
pub struct ServiceWorkerFetchPolicy<V> {
    config: WorkerConfig,
    controller: ControllerSource,
    url_for: UrlFn,
    fallback: Option<Arc<dyn Transport>>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for ServiceWorkerFetchPolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerFetchPolicy")
            .field("config", &self.config)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

impl<V> ServiceWorkerFetchPolicy<V>
where
    V: StoreValue + DeserializeOwned,
{
    /// Creates a policy fetching `url_for(key)` through `controller`.
    pub fn new<U>(config: WorkerConfig, controller: ControllerSource, url_for: U) -> Self
    where
        U: Fn(&StoreKey) -> String + Send + Sync + 'static,
    {
        Self {
            config,
            controller,
            url_for: Arc::new(url_for),
            fallback: None,
            _value: std::marker::PhantomData,
        }
    }

    /// Fetches directly through `transport` when no worker is available.
    pub fn fallback(self, transport: Arc<dyn Transport>) -> Self {
        Self {
            fallback: Some(transport),
            ..self
        }
    }
}

#[async_trait]
impl<V> Policy<V> for ServiceWorkerFetchPolicy<V>
where
    V: StoreValue + DeserializeOwned,
{
    fn name(&self) -> &str {
        "service_worker_fetch"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FETCH
    }

    fn should_fetch(&self, ctx: &FetchContext<'_, V>) -> bool {
        ctx.value.is_none()
    }

    fn should_revalidate(&self, _ctx: &FetchContext<'_, V>) -> bool {
        true
    }

    async fn fetch(&self, key: &StoreKey) -> Result<Option<V>, FetchError> {
        let url = (self.url_for)(key);
        let Some(controller) = (self.controller)() else {
            let Some(transport) = &self.fallback else {
                return Err(RequestError::ControllerUnavailable);
            };
            debug!(%key, %url, "No worker, fetching directly");
            return decode(transport.fetch(&url).await?);
        };

        let request = WorkerRequest {
            kind: WorkerRequestType::FetchRequest,
            payload: RequestPayload {
                key: key.clone(),
                url,
                method: None,
                body: None,
            },
        };
        match send_request(controller.as_ref(), request, self.config.timeout).await? {
            WorkerReply::Response(value) => decode(value),
            WorkerReply::Success(_) => Err(RequestError::InvalidResponse),
        }
    }
}

/// How a mutation left [`QueuedMutationPolicy::mutate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The worker confirmed it.
    Sent,
    /// No worker was available; it waits in the queue.
    Queued,
}

type RequestFor<V> = Arc<dyn Fn(&StoreKey, Option<&V>) -> Option<QueuedMutation> + Send + Sync>;

struct QueueState {
    config: WorkerConfig,
    controller: ControllerSource,
    queue: Mutex<VecDeque<QueuedMutation>>,
    version: watch::Sender<u64>,
}

impl QueueState {
    fn changed(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    fn enqueue(&self, mutation: QueuedMutation) {
        debug!(key = %mutation.key, url = %mutation.url, "Queueing mutation");
        self.queue.lock().push_back(mutation);
        self.changed();
    }

    async fn send(
        &self,
        controller: &dyn WorkerController,
        mutation: QueuedMutation,
    ) -> Result<(), RequestError> {
        send_request(controller, mutation.into(), self.config.timeout)
            .await
            .map(drop)
    }

    async fn mutate(&self, mutation: QueuedMutation) -> Result<SendOutcome, MutationError> {
        let Some(controller) = (self.controller)() else {
            self.enqueue(mutation);
            return Ok(SendOutcome::Queued);
        };
        match self.send(controller.as_ref(), mutation.clone()).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(error) => {
                warn!(key = %mutation.key, %error, "Mutation failed, queued for replay");
                self.enqueue(mutation);
                Err(error.into())
            }
        }
    }

    async fn replay(&self) -> ReplayOutcome {
        let pending: Vec<QueuedMutation> = self.queue.lock().drain(..).collect();
        let mut outcome = ReplayOutcome::default();
        if pending.is_empty() {
            return outcome;
        }
        self.changed();

        for mutation in pending {
            let result = match (self.controller)() {
                Some(controller) => self.send(controller.as_ref(), mutation.clone()).await,
                None => Err(RequestError::ControllerUnavailable),
            };
            match result {
                Ok(()) => {
                    outcome.replayed += 1;
                    metrics::record_queue_replayed(true);
                }
                Err(error) => {
                    debug!(key = %mutation.key, %error, "Replay failed, re-queueing");
                    outcome.requeued += 1;
                    metrics::record_queue_replayed(false);
                    self.enqueue(mutation);
                }
            }
        }
        outcome
    }
}

/// Sends mutations through the worker, queueing them while it is away.
///
/// Local changes become mutations through the `request_for` closure; a
/// closure returning `None` skips the change. Mutations can also be sent
/// directly with [`mutate`](Self::mutate).
pub struct QueuedMutationPolicy<V> {
    state: Arc<QueueState>,
    request_for: Option<RequestFor<V>>,
}

impl<V> fmt::Debug for QueuedMutationPolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMutationPolicy")
            .field("config", &self.state.config)
            .field("queued", &self.state.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl<V: StoreValue> QueuedMutationPolicy<V> {
    /// Creates a policy posting mutations to `controller`.
    pub fn new(config: WorkerConfig, controller: ControllerSource) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(QueueState {
                config,
                controller,
                queue: Mutex::new(VecDeque::new()),
                version,
            }),
            request_for: None,
        }
    }

    /// Turns local changes into mutations.
    pub fn request_for<F>(self, request_for: F) -> Self
    where
        F: Fn(&StoreKey, Option<&V>) -> Option<QueuedMutation> + Send + Sync + 'static,
    {
        Self {
            request_for: Some(Arc::new(request_for)),
            ..self
        }
    }

    /// Sends `mutation`, or queues it when no worker is available.
    ///
    /// A mutation that the worker rejects is queued as well, and the error is
    /// returned.
    pub async fn mutate(&self, mutation: QueuedMutation) -> Result<SendOutcome, MutationError> {
        self.state.mutate(mutation).await
    }

    /// Number of queued mutations.
    pub fn queue_len(&self) -> usize {
        self.state.queue.lock().len()
    }

    /// Snapshot of the queued mutations, oldest first.
    pub fn queued(&self) -> Vec<QueuedMutation> {
        self.state.queue.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl<V: StoreValue> MutationQueue for QueuedMutationPolicy<V> {
    fn queue_snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self.queued())
    }

    fn restore_queue(&self, snapshot: Value) -> Result<(), serde_json::Error> {
        let restored: Vec<QueuedMutation> = serde_json::from_value(snapshot)?;
        if restored.is_empty() {
            return Ok(());
        }
        {
            let mut queue = self.state.queue.lock();
            for mutation in restored.into_iter().rev() {
                queue.push_front(mutation);
            }
        }
        self.state.changed();
        Ok(())
    }

    async fn replay_queue(&self) -> ReplayOutcome {
        self.state.replay().await
    }

    fn watch_queue(&self) -> Option<watch::Receiver<u64>> {
        Some(self.state.version.subscribe())
    }
}

#[async_trait]
impl<V: StoreValue> Policy<V> for QueuedMutationPolicy<V> {
    fn name(&self) -> &str {
        "queued_mutation"
    }

    fn on_change(&self, ctx: &ChangeContext<'_, V>) -> Option<ChangeTask> {
        if ctx.origin != ChangeOrigin::Local {
            return None;
        }
        let request_for = self.request_for.as_ref()?;
        let mutation = request_for(ctx.key, ctx.value)?;

        if (self.state.controller)().is_none() {
            self.state.enqueue(mutation);
            return None;
        }
        let state = Arc::clone(&self.state);
        Some(
            async move {
                state
                    .mutate(mutation)
                    .await
                    .map(drop)
                    .map_err(PolicyError::from)
            }
            .boxed(),
        )
    }
}
