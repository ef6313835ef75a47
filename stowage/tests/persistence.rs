mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use stowage::config::PersistenceConfig;
use stowage::policies::{ChangePolicy, PersistencePolicy};
use stowage::{MemoryStorage, Storage, Store, StoreKey, apply_policies};

use common::{Contact, Counter, boxed, contact};

fn policy(storage: &Arc<MemoryStorage>) -> PersistencePolicy<Contact> {
    PersistencePolicy::new(
        PersistenceConfig::with_prefix("contacts"),
        Arc::clone(storage) as Arc<dyn Storage>,
    )
}

#[tokio::test]
async fn test_attach_seeds_store_from_prefix() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .set_item("contacts:1", r#"{"id":1,"name":"Ada"}"#)
        .unwrap();
    storage.set_item("contacts:2", "{not json").unwrap();
    storage
        .set_item("invoices:3", r#"{"id":3,"name":"Other namespace"}"#)
        .unwrap();
    storage.set_item("contacts", "no separator").unwrap();

    let changes = Counter::new();
    let seen = changes.clone();
    let contacts = apply_policies(
        Store::new(),
        vec![
            boxed(policy(&storage)),
            boxed(ChangePolicy::observe(move |_, _: Option<&Contact>, _| {
                seen.hit();
            })),
        ],
    );
    contacts.ready().await.unwrap();

    assert_eq!(contacts.keys(), vec![StoreKey::from(1)]);
    assert_eq!(contacts.get(1), Some(contact(1, "Ada")));
    // Seeding is not a change.
    assert_eq!(changes.get(), 0);
}

#[tokio::test]
async fn test_writes_are_mirrored() {
    let storage = Arc::new(MemoryStorage::new());
    let contacts = apply_policies(Store::new(), vec![boxed(policy(&storage))]);
    contacts.ready().await.unwrap();

    contacts.set(7, contact(7, "Eve"));
    assert_eq!(
        storage.get_item("contacts:7").as_deref(),
        Some(r#"{"id":7,"name":"Eve"}"#)
    );

    contacts.delete(7);
    assert_eq!(storage.get_item("contacts:7"), None);
    assert_eq!(storage.length(), 0);
}

#[tokio::test]
async fn test_entries_survive_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let first = apply_policies(Store::new(), vec![boxed(policy(&storage))]);
    first.ready().await.unwrap();
    first.set(1, contact(1, "Ada"));
    first.set(2, contact(2, "Grace"));
    first.clear();
    first.set(3, contact(3, "Edsger"));

    let second = apply_policies(Store::new(), vec![boxed(policy(&storage))]);
    second.ready().await.unwrap();

    assert_eq!(second.to_vec(), vec![contact(3, "Edsger")]);
}

#[test]
fn test_load_reads_without_a_store() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .set_item("contacts:9", r#"{"id":9,"name":"Barbara","updatedAt":5}"#)
        .unwrap();

    let loaded = policy(&storage).load();

    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].0, StoreKey::from(9));
    assert_eq!(loaded[0].1.updated_at, Some(5));
}
