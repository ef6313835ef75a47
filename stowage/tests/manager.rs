//! Tests for policy orchestration and the policy-augmented store.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use stowage::policies::{AggregatePolicy, ChangePolicy, FetchPolicy};
use stowage::{
    ChangeOrigin, FetchError, Policy, PolicyError, PolicyManager, RequestError, Store, StoreHandle,
    StoreKey, apply_policies,
};

use common::{Contact, Counter, boxed, contact, settle};

fn counting_fetch(name: &'static str, calls: Counter) -> FetchPolicy<Contact> {
    FetchPolicy::new(move |key: StoreKey| {
        let calls = calls.clone();
        async move {
            calls.hit();
            let id = key.as_str().parse().unwrap_or_default();
            Ok(Some(contact(id, name)))
        }
    })
}

fn recorder(log: Arc<Mutex<Vec<(StoreKey, Option<String>, ChangeOrigin)>>>) -> ChangePolicy<Contact> {
    ChangePolicy::observe(move |key, value: Option<&Contact>, origin| {
        log.lock()
            .push((key.clone(), value.map(|c| c.name.clone()), origin));
    })
}

struct FailingAttach;

#[async_trait]
impl Policy<Contact> for FailingAttach {
    fn name(&self) -> &str {
        "failing_attach"
    }

    async fn on_attach(&self, _handle: &StoreHandle<Contact>) -> Result<(), PolicyError> {
        Err(PolicyError::ChannelUnavailable)
    }

    async fn on_detach(&self) -> Result<(), PolicyError> {
        Err(PolicyError::ChannelUnavailable)
    }
}

#[tokio::test]
async fn test_get_or_fetch_fetches_missing_value() {
    let calls = Counter::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let contacts = apply_policies(
        Store::new(),
        vec![
            boxed(counting_fetch("Ada", calls.clone())),
            boxed(recorder(Arc::clone(&log))),
        ],
    );
    contacts.ready().await.unwrap();

    assert_eq!(contacts.get_or_fetch(7).await, Some(contact(7, "Ada")));
    assert_eq!(contacts.get(7), Some(contact(7, "Ada")));

    // Cached now, no second fetch.
    assert_eq!(contacts.get_or_fetch(7).await, Some(contact(7, "Ada")));
    assert_eq!(calls.get(), 1);

    assert_eq!(
        *log.lock(),
        vec![(StoreKey::from(7), Some("Ada".to_owned()), ChangeOrigin::Fetch)]
    );
}

#[tokio::test]
async fn test_no_policy_asking_returns_cached_value() {
    let contacts = apply_policies(Store::new(), vec![boxed(recorder(Default::default()))]);
    contacts.inner().set(1, contact(1, "Cached"));

    assert_eq!(contacts.get_or_fetch(1).await, Some(contact(1, "Cached")));
    assert_eq!(contacts.get_or_fetch(2).await, None);
}

#[tokio::test]
async fn test_fetch_error_serves_stale_value() {
    let failing = FetchPolicy::new(|_key: StoreKey| async {
        Err::<Option<Contact>, FetchError>(RequestError::Transport("offline".to_owned()))
    })
    .always_fetch(true);
    let contacts = apply_policies(Store::new(), vec![boxed(failing)]);
    contacts.inner().set(1, contact(1, "Stale"));

    assert_eq!(contacts.get_or_fetch(1).await, Some(contact(1, "Stale")));
    assert_eq!(contacts.get_or_fetch(2).await, None);
}

#[tokio::test]
async fn test_first_fetching_policy_wins() {
    let first = Counter::new();
    let second = Counter::new();
    let contacts = apply_policies(
        Store::new(),
        vec![
            boxed(recorder(Default::default())),
            boxed(counting_fetch("first", first.clone())),
            boxed(counting_fetch("second", second.clone())),
        ],
    );

    assert_eq!(contacts.get_or_fetch(3).await.map(|c| c.name), Some("first".to_owned()));
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 0);
}

#[tokio::test]
async fn test_revalidate_last_policy_wins() {
    let first = Counter::new();
    let second = Counter::new();
    let contacts = apply_policies(
        Store::new(),
        vec![
            boxed(counting_fetch("first", first.clone())),
            boxed(counting_fetch("second", second.clone())),
        ],
    );
    contacts.inner().set(3, contact(3, "old"));

    assert_eq!(contacts.revalidate(3).await.map(|c| c.name), Some("second".to_owned()));
    assert_eq!((first.get(), second.get()), (1, 1));
}

#[tokio::test]
async fn test_set_and_delete_fan_out_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let first_order = Arc::clone(&order);
    let second_order = Arc::clone(&order);

    let contacts = apply_policies(
        Store::new(),
        vec![
            boxed(ChangePolicy::observe(move |_, _: Option<&Contact>, _| {
                first_order.lock().push("first")
            })),
            boxed(ChangePolicy::observe(move |_, _: Option<&Contact>, _| {
                second_order.lock().push("second")
            })),
            boxed(recorder(Arc::clone(&log))),
        ],
    );

    contacts.set(1, contact(1, "Ada"));
    contacts.delete(1);

    assert_eq!(*order.lock(), vec!["first", "second", "first", "second"]);
    assert_eq!(
        *log.lock(),
        vec![
            (StoreKey::from(1), Some("Ada".to_owned()), ChangeOrigin::Local),
            (StoreKey::from(1), None, ChangeOrigin::Local),
        ]
    );
    assert!(!contacts.has(1));
}

#[tokio::test]
async fn test_pending_changes_resolve_continuations() {
    let done = Counter::new();
    let observed = done.clone();
    let contacts = apply_policies(
        Store::new(),
        vec![
            boxed(ChangePolicy::new(move |_ctx| {
                let observed = observed.clone();
                Some(
                    async move {
                        tokio::task::yield_now().await;
                        observed.hit();
                        Ok::<_, PolicyError>(())
                    }
                    .boxed(),
                )
            })),
            boxed(recorder(Default::default())),
        ],
    );

    let pending = contacts.set(1, contact(1, "Ada"));
    assert_eq!(pending.len(), 1);
    pending.wait().await.unwrap();
    assert_eq!(done.get(), 1);
}

#[tokio::test]
async fn test_dropped_pending_changes_still_run() {
    let done = Counter::new();
    let observed = done.clone();
    let contacts = apply_policies(
        Store::new(),
        vec![boxed(ChangePolicy::new(move |_ctx| {
            let observed = observed.clone();
            Some(
                async move {
                    observed.hit();
                    Ok::<_, PolicyError>(())
                }
                .boxed(),
            )
        }))],
    );

    drop(contacts.set(1, contact(1, "Ada")));
    contacts.flush().await;
    assert_eq!(done.get(), 1);
}

#[tokio::test]
async fn test_clear_notifies_each_removed_key() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let contacts = apply_policies(Store::new(), vec![boxed(recorder(Arc::clone(&log)))]);
    contacts.inner().set(1, contact(1, "A"));
    contacts.inner().set(2, contact(2, "B"));

    contacts.clear();

    assert!(contacts.is_empty());
    assert_eq!(
        *log.lock(),
        vec![
            (StoreKey::from(1), None, ChangeOrigin::Local),
            (StoreKey::from(2), None, ChangeOrigin::Local),
        ]
    );
}

#[tokio::test]
async fn test_sync_writes_under_index_key() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Store::<Contact>::builder()
        .index_by(|c: &Contact| Some(StoreKey::from(c.id)))
        .build();
    let contacts = apply_policies(store, vec![boxed(recorder(Arc::clone(&log)))]);

    let (key, _) = contacts.sync(contact(5, "Eve")).unwrap();
    assert_eq!(key, StoreKey::from(5));
    assert_eq!(contacts.get(5).map(|c| c.name), Some("Eve".to_owned()));
    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn test_ready_reports_attach_error() {
    let contacts = apply_policies(
        Store::<Contact>::new(),
        vec![boxed(recorder(Default::default())), boxed(FailingAttach)],
    );

    assert!(matches!(
        contacts.ready().await,
        Err(PolicyError::ChannelUnavailable)
    ));
    // Attach work is consumed by the first wait.
    assert!(contacts.ready().await.is_ok());
}

#[tokio::test]
async fn test_destroy_propagates_detach_error() {
    let contacts = apply_policies(Store::<Contact>::new(), vec![boxed(FailingAttach)]);
    assert!(matches!(
        contacts.destroy().await,
        Err(PolicyError::ChannelUnavailable)
    ));
}

#[tokio::test]
async fn test_get_aggregate() {
    let aggregate = AggregatePolicy::new().field("name", |name: &Value| {
        json!(name.as_str().map(|name| name.len()))
    });

    let plain = apply_policies(Store::new(), vec![boxed(recorder(Default::default()))]);
    plain.inner().set(1, contact(1, "Ada"));
    assert!(plain.get_aggregate(1).is_none());

    let contacts = apply_policies(Store::new(), vec![boxed(aggregate)]);
    contacts.set(1, contact(1, "Ada"));

    let view = contacts.get_aggregate(1).unwrap();
    assert_eq!(view.base(), &contact(1, "Ada"));
    assert_eq!(view.get("name"), Some(json!(3)));
    assert!(contacts.get_aggregate(2).is_none());
}

#[tokio::test]
async fn test_register_aggregate_without_fan_out() {
    let manager = PolicyManager::new(Store::<Contact>::new());
    manager.register_aggregate(Arc::new(AggregatePolicy::new()));
    assert_eq!(manager.policy_count(), 0);

    manager.store().set(1, contact(1, "Ada"));
    assert!(manager.get_aggregate(&StoreKey::from(1)).is_some());
}

#[tokio::test]
async fn test_manager_on_change_reports_previous_value() {
    let previous = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&previous);
    let manager = PolicyManager::new(Store::<Contact>::new());
    manager.register(boxed(ChangePolicy::new(move |ctx| {
        *seen.lock() = ctx.previous.map(|c: &Contact| c.name.clone());
        None
    })));
    manager.store().set(1, contact(1, "Before"));

    let pending = manager.on_change(&StoreKey::from(1), Some(&contact(1, "After")));

    assert!(pending.is_empty());
    assert_eq!(previous.lock().as_deref(), Some("Before"));
    assert_eq!(manager.store().get(1), Some(contact(1, "After")));

    manager.on_change(&StoreKey::from(1), None);
    assert!(!manager.store().has(1));
    settle().await;
}

#[tokio::test]
async fn test_debug_lists_policy_names() {
    let contacts = apply_policies(
        Store::<Contact>::new(),
        vec![boxed(recorder(Default::default())), boxed(FailingAttach)],
    );
    let rendered = format!("{contacts:?}");
    assert!(rendered.contains("PolicyStore"));
    assert!(rendered.contains("failing_attach"));
}
