mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use stowage::config::{MutationPersistenceConfig, WorkerConfig};
use stowage::policies::{
    ControllerSource, HttpMethod, MUTATION_STORE_NAME, MemoryMutationDatabase, MutationDatabase,
    MutationPersistencePolicy, MutationQueue, QueueBackend, QueuedMutation, QueuedMutationPolicy,
    ReplayOutcome, SendOutcome, ServiceWorkerFetchPolicy, Transport, WorkerController,
    WorkerRequest, WorkerRequestType,
};
use stowage::{
    MemoryStorage, MutationError, Policy, RequestError, Storage, Store, StoreKey, apply_policies,
};
use tokio::sync::oneshot;

use common::{Contact, boxed, contact, key, settle, shared};

/// What the scripted worker does with the next request.
enum Step {
    Reply(Value),
    /// Keep the reply port open and never answer.
    Silent,
    /// Drop the reply port.
    Hangup,
}

/// Worker answering from a script; replies `{ "success": true }` once the
/// script runs out.
#[derive(Default)]
struct ScriptedWorker {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<WorkerRequest>>,
    parked: Mutex<Vec<oneshot::Sender<Value>>>,
}

impl ScriptedWorker {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().clone()
    }
}

impl WorkerController for ScriptedWorker {
    fn post_message(&self, request: WorkerRequest, reply: oneshot::Sender<Value>) {
        self.requests.lock().push(request);
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Step::Reply(json!({ "success": true })));
        match step {
            Step::Reply(message) => {
                let _ = reply.send(message);
            }
            Step::Silent => self.parked.lock().push(reply),
            Step::Hangup => drop(reply),
        }
    }
}

/// Controller slot that can be emptied and refilled.
#[derive(Clone, Default)]
struct Slot(Arc<Mutex<Option<Arc<dyn WorkerController>>>>);

impl Slot {
    fn online(worker: &Arc<ScriptedWorker>) -> Self {
        let slot = Self::default();
        slot.connect(worker);
        slot
    }

    fn connect(&self, worker: &Arc<ScriptedWorker>) {
        *self.0.lock() = Some(Arc::clone(worker) as Arc<dyn WorkerController>);
    }

    fn source(&self) -> ControllerSource {
        let slot = Arc::clone(&self.0);
        Arc::new(move || slot.lock().clone())
    }
}

struct StaticTransport(Value);

#[async_trait]
impl Transport for StaticTransport {
    async fn fetch(&self, _url: &str) -> Result<Value, RequestError> {
        Ok(self.0.clone())
    }
}

fn fetch_policy(slot: &Slot, timeout: Duration) -> ServiceWorkerFetchPolicy<Contact> {
    ServiceWorkerFetchPolicy::new(WorkerConfig::with_timeout(timeout), slot.source(), |key| {
        format!("/contacts/{key}")
    })
}

async fn fetch(policy: &ServiceWorkerFetchPolicy<Contact>, id: u64) -> Result<Option<Contact>, RequestError> {
    Policy::<Contact>::fetch(policy, &key(id)).await
}

fn put(id: u64, name: &str) -> QueuedMutation {
    QueuedMutation {
        key: key(id),
        url: format!("/contacts/{id}"),
        method: HttpMethod::Put,
        body: Some(json!({ "name": name })),
    }
}

fn queue_policy(slot: &Slot) -> QueuedMutationPolicy<Contact> {
    QueuedMutationPolicy::new(WorkerConfig::default(), slot.source()).request_for(
        |key: &StoreKey, value: Option<&Contact>| {
            Some(QueuedMutation {
                key: key.clone(),
                url: format!("/contacts/{key}"),
                method: if value.is_some() {
                    HttpMethod::Put
                } else {
                    HttpMethod::Delete
                },
                body: value.map(|contact| json!({ "name": contact.name })),
            })
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_fetch_through_worker() {
    let worker = ScriptedWorker::new([Step::Reply(json!({ "response": { "id": 1, "name": "Ada" } }))]);
    let slot = Slot::online(&worker);
    let contacts = apply_policies(Store::new(), vec![boxed(fetch_policy(&slot, Duration::from_secs(5)))]);

    assert_eq!(contacts.get_or_fetch(1).await, Some(contact(1, "Ada")));

    let requests = worker.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, WorkerRequestType::FetchRequest);
    assert_eq!(requests[0].payload.url, "/contacts/1");
    assert_eq!(requests[0].payload.method, None);
}

#[tokio::test(start_paused = true)]
async fn test_null_response_is_not_found() {
    let worker = ScriptedWorker::new([Step::Reply(json!({ "response": null }))]);
    let policy = fetch_policy(&Slot::online(&worker), Duration::from_secs(5));

    assert_eq!(fetch(&policy, 1).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_times_out() {
    let worker = ScriptedWorker::new([Step::Silent]);
    let policy = fetch_policy(&Slot::online(&worker), Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let result = fetch(&policy, 1).await;

    assert!(matches!(result, Err(RequestError::Timeout(timeout)) if timeout == Duration::from_millis(100)));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_replies_are_invalid_responses() {
    let worker = ScriptedWorker::new([
        Step::Reply(json!({ "status": 200 })),
        Step::Reply(json!({ "success": true })),
    ]);
    let policy = fetch_policy(&Slot::online(&worker), Duration::from_secs(5));

    assert!(matches!(fetch(&policy, 1).await, Err(RequestError::InvalidResponse)));
    assert!(matches!(fetch(&policy, 1).await, Err(RequestError::InvalidResponse)));
}

#[tokio::test(start_paused = true)]
async fn test_worker_errors_are_distinguished() {
    let worker = ScriptedWorker::new([Step::Reply(json!({ "error": "not allowed" })), Step::Hangup]);
    let policy = fetch_policy(&Slot::online(&worker), Duration::from_secs(5));

    assert!(matches!(
        fetch(&policy, 1).await,
        Err(RequestError::Remote(message)) if message == "not allowed"
    ));
    assert!(matches!(fetch(&policy, 1).await, Err(RequestError::Transport(_))));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_keeps_cached_value() {
    let worker = ScriptedWorker::new([Step::Hangup]);
    let slot = Slot::online(&worker);
    let contacts = apply_policies(Store::new(), vec![boxed(fetch_policy(&slot, Duration::from_secs(5)))]);
    contacts.inner().set(1, contact(1, "Cached"));

    assert_eq!(contacts.revalidate(1).await, Some(contact(1, "Cached")));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_without_worker() {
    let offline = Slot::default();
    let direct = fetch_policy(&offline, Duration::from_secs(5))
        .fallback(Arc::new(StaticTransport(json!({ "id": 2, "name": "Direct" }))));
    assert_eq!(fetch(&direct, 2).await.unwrap(), Some(contact(2, "Direct")));

    let stranded = fetch_policy(&offline, Duration::from_secs(5));
    assert!(matches!(fetch(&stranded, 2).await, Err(RequestError::ControllerUnavailable)));
}

#[tokio::test(start_paused = true)]
async fn test_mutate_outcomes() {
    let worker = ScriptedWorker::new([
        Step::Reply(json!({ "success": true })),
        Step::Reply(json!({ "error": "conflict" })),
    ]);
    let slot = Slot::default();
    let policy = queue_policy(&slot);

    assert_eq!(policy.mutate(put(1, "Offline")).await.unwrap(), SendOutcome::Queued);
    assert_eq!(policy.queue_len(), 1);

    slot.connect(&worker);
    assert_eq!(policy.mutate(put(2, "Sent")).await.unwrap(), SendOutcome::Sent);
    assert!(matches!(
        policy.mutate(put(3, "Rejected")).await,
        Err(MutationError::Request(RequestError::Remote(_)))
    ));
    assert_eq!(
        policy.queued().iter().map(|m| m.key.clone()).collect::<Vec<_>>(),
        vec![key(1), key(3)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_local_changes_queue_offline_and_replay() {
    let worker = ScriptedWorker::new([
        Step::Reply(json!({ "error": "busy" })),
    ]);
    let slot = Slot::default();
    let policy = Arc::new(queue_policy(&slot));
    let contacts = apply_policies(Store::new(), vec![shared(&policy)]);

    assert!(contacts.set(1, contact(1, "Ada")).is_empty());
    assert!(contacts.delete(1).is_empty());
    assert_eq!(policy.queue_len(), 2);

    slot.connect(&worker);
    assert_eq!(
        policy.replay_queue().await,
        ReplayOutcome {
            replayed: 1,
            requeued: 1,
        }
    );
    // The failed PUT went to the back of the queue.
    assert_eq!(policy.queued(), vec![QueuedMutation {
        key: key(1),
        url: "/contacts/1".to_owned(),
        method: HttpMethod::Put,
        body: Some(json!({ "name": "Ada" })),
    }]);

    assert_eq!(
        policy.replay_queue().await,
        ReplayOutcome {
            replayed: 1,
            requeued: 0,
        }
    );
    assert_eq!(policy.queue_len(), 0);
    assert_eq!(worker.requests().len(), 3);
    assert!(
        worker
            .requests()
            .iter()
            .all(|request| request.kind == WorkerRequestType::MutationRequest)
    );
}

#[tokio::test(start_paused = true)]
async fn test_online_changes_are_sent_right_away() {
    let worker = ScriptedWorker::new([]);
    let policy = Arc::new(queue_policy(&Slot::online(&worker)));
    let contacts = apply_policies(Store::new(), vec![shared(&policy)]);

    contacts.set(1, contact(1, "Ada")).wait().await.unwrap();

    assert_eq!(policy.queue_len(), 0);
    assert_eq!(worker.requests()[0].payload.method, Some(HttpMethod::Put));
}

#[tokio::test(start_paused = true)]
async fn test_queue_survives_restart_in_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let backend = QueueBackend::Sync(Arc::clone(&storage) as Arc<dyn Storage>);

    // First run: offline, the write is queued and the queue persisted.
    let offline = Slot::default();
    let queue = Arc::new(queue_policy(&offline));
    let persistence = MutationPersistencePolicy::new(
        MutationPersistenceConfig::default(),
        backend.clone(),
        Arc::clone(&queue) as Arc<dyn MutationQueue>,
    );
    let contacts = apply_policies(Store::new(), vec![shared(&queue), boxed(persistence)]);
    contacts.ready().await.unwrap();
    contacts.set(1, contact(1, "Ada")).wait().await.unwrap();

    let persisted: Value =
        serde_json::from_str(&storage.get_item("mutation-queue").unwrap()).unwrap();
    assert_eq!(persisted.as_array().map(Vec::len), Some(1));
    contacts.destroy().await.unwrap();

    // Second run: the worker is back and the restored queue is replayed.
    let worker = ScriptedWorker::new([]);
    let queue = Arc::new(queue_policy(&Slot::online(&worker)));
    let persistence = MutationPersistencePolicy::new(
        MutationPersistenceConfig::default(),
        backend,
        Arc::clone(&queue) as Arc<dyn MutationQueue>,
    );
    let contacts = apply_policies(Store::new(), vec![shared(&queue), boxed(persistence)]);
    contacts.ready().await.unwrap();

    assert_eq!(worker.requests().len(), 1);
    assert_eq!(worker.requests()[0].payload.key, key(1));
    assert_eq!(queue.queue_len(), 0);
    assert_eq!(storage.get_item("mutation-queue").as_deref(), Some("[]"));
}

#[tokio::test(start_paused = true)]
async fn test_queue_persisted_in_object_database() {
    let database = Arc::new(MemoryMutationDatabase::new());
    let slot = Slot::default();
    let queue = Arc::new(queue_policy(&slot));
    let persistence = MutationPersistencePolicy::new(
        MutationPersistenceConfig::default(),
        QueueBackend::Async(Arc::clone(&database) as Arc<dyn MutationDatabase>),
        Arc::clone(&queue) as Arc<dyn MutationQueue>,
    );
    let contacts = apply_policies(Store::<Contact>::new(), vec![boxed(persistence)]);
    contacts.ready().await.unwrap();

    // Queued outside any store change: the queue watcher persists it.
    queue.mutate(put(5, "Eve")).await.unwrap();
    settle().await;

    let record = database
        .get(MUTATION_STORE_NAME, "mutation-queue")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(serde_json::from_value::<Vec<QueuedMutation>>(record).unwrap(), vec![put(5, "Eve")]);
    assert_eq!(database.name(), "MutationPersistenceDB");
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_queue_snapshot_is_discarded() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_item("mutation-queue", "{not json").unwrap();

    let queue = Arc::new(queue_policy(&Slot::default()));
    let persistence = MutationPersistencePolicy::new(
        MutationPersistenceConfig::default(),
        QueueBackend::Sync(Arc::clone(&storage) as Arc<dyn Storage>),
        Arc::clone(&queue) as Arc<dyn MutationQueue>,
    );
    let contacts = apply_policies(Store::<Contact>::new(), vec![boxed(persistence)]);

    contacts.ready().await.unwrap();
    assert_eq!(queue.queue_len(), 0);
    assert_eq!(storage.get_item("mutation-queue").as_deref(), Some("[]"));

    // The queue watcher still runs after the bad snapshot.
    queue.mutate(put(5, "Eve")).await.unwrap();
    settle().await;
    let persisted: Vec<QueuedMutation> =
        serde_json::from_str(&storage.get_item("mutation-queue").unwrap()).unwrap();
    assert_eq!(persisted, vec![put(5, "Eve")]);
}
