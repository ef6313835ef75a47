//! Tests for the observable store and its backing contracts.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use stowage_core::{
    CacheStore, KeyValueMap, MemoryMap, MemoryStorage, Storage, Store, StoreEvent, StoreKey,
};

#[derive(Debug, Clone, PartialEq)]
struct Contact {
    id: u64,
    name: &'static str,
}

fn contact(id: u64, name: &'static str) -> Contact {
    Contact { id, name }
}

#[test]
fn test_get_missing_key_returns_none() {
    let store = Store::<Contact>::new();
    assert_eq!(store.get(1), None);
    assert!(!store.has("1"));
}

#[test]
fn test_set_get_delete() {
    let store = Store::new();
    store.set(1, contact(1, "Ada"));

    assert_eq!(store.get("1"), Some(contact(1, "Ada")));
    assert!(store.delete(1));
    assert!(!store.delete(1));
    assert!(store.is_empty());
}

#[test]
fn test_to_vec_keeps_insertion_order() {
    let store = Store::new();
    store.set(3, contact(3, "C"));
    store.set(1, contact(1, "A"));
    store.set(2, contact(2, "B"));
    store.delete(1);

    let names: Vec<_> = store.to_vec().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["C", "B"]);
    assert_eq!(store.keys(), vec![StoreKey::from(3), StoreKey::from(2)]);
}

#[test]
fn test_clear_removes_everything() {
    let store = Store::new();
    store.set(1, contact(1, "A"));
    store.set(2, contact(2, "B"));
    store.clear();
    assert_eq!(store.len(), 0);
}

#[test]
fn test_sync_uses_index() {
    let store = Store::<Contact>::builder()
        .index_by(|c: &Contact| Some(StoreKey::from(c.id)))
        .build();

    assert_eq!(store.sync(contact(9, "Grace")), Some(StoreKey::from(9)));
    assert_eq!(store.get(9).map(|c| c.name), Some("Grace"));
}

#[test]
fn test_sync_without_index_is_noop() {
    let store = Store::<Contact>::new();
    assert_eq!(store.sync(contact(9, "Grace")), None);
    assert!(store.is_empty());
}

#[test]
fn test_mutate_hook_wraps_every_write() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let store = Store::<Contact>::builder()
        .mutate(move |write| {
            counter.fetch_add(1, Ordering::SeqCst);
            write();
        })
        .build();

    store.set(1, contact(1, "A"));
    store.delete(1);
    store.clear();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_mutate_hook_can_drop_writes() {
    let store = Store::<Contact>::builder().mutate(|_write| {}).build();
    store.set(1, contact(1, "A"));
    assert!(!store.has(1));
}

#[test]
fn test_custom_map_factory() {
    let store = Store::<Contact>::builder()
        .map_factory(Arc::new(|| {
            Box::new(MemoryMap::<Contact>::new()) as Box<dyn KeyValueMap<Contact>>
        }))
        .build();
    store.set(1, contact(1, "A"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_subscribe_receives_events() {
    let store = Store::new();
    let mut events = store.subscribe();

    store.set(1, contact(1, "A"));
    store.delete(1);
    store.delete(1);
    store.clear();

    assert_eq!(
        events.recv().await.unwrap(),
        StoreEvent::Set {
            key: StoreKey::from(1),
            value: contact(1, "A"),
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        StoreEvent::Delete {
            key: StoreKey::from(1)
        }
    );
    assert_eq!(events.recv().await.unwrap(), StoreEvent::Clear);
}

#[test]
fn test_cache_store_trait_object() {
    let store: Box<dyn CacheStore<Contact>> = Box::new(Store::new());
    let key = StoreKey::from("k");
    store.set(key.clone(), contact(1, "A"));
    assert!(store.has(&key));
    assert!(store.delete(&key));
    assert_eq!(store.get(&key), None);
}

#[test]
fn test_memory_map_direct() {
    let map = MemoryMap::new();
    map.insert(StoreKey::from("a"), 1);
    map.insert(StoreKey::from("b"), 2);
    assert_eq!(map.remove(&StoreKey::from("a")), Some(1));
    assert_eq!(map.entries(), vec![(StoreKey::from("b"), 2)]);
}

#[test]
fn test_memory_storage_enumeration() {
    let storage = MemoryStorage::new();
    storage.set_item("store:1", "{}").unwrap();
    storage.set_item("other:2", "{}").unwrap();
    storage.set_item("store:3", "{}").unwrap();
    storage.remove_item("other:2").unwrap();

    assert_eq!(storage.length(), 2);
    assert_eq!(storage.key(0).as_deref(), Some("store:1"));
    assert_eq!(storage.key(1).as_deref(), Some("store:3"));
    assert_eq!(storage.key(2), None);
    assert_eq!(storage.get_item("store:3").as_deref(), Some("{}"));
}
