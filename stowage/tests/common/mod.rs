//! Shared fixtures for policy tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage::{Policy, StoreKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: u64,
    pub name: String,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

pub fn contact(id: u64, name: &str) -> Contact {
    Contact {
        id,
        name: name.to_owned(),
        updated_at: None,
    }
}

pub fn versioned(id: u64, name: &str, updated_at: i64) -> Contact {
    Contact {
        updated_at: Some(updated_at),
        ..contact(id, name)
    }
}

/// Lets every spawned task run until it blocks.
///
/// Under a paused clock the sleep only completes once the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn boxed<P>(policy: P) -> Arc<dyn Policy<Contact>>
where
    P: Policy<Contact> + 'static,
{
    Arc::new(policy)
}

/// Shares a policy the test keeps inspecting.
pub fn shared<P>(policy: &Arc<P>) -> Arc<dyn Policy<Contact>>
where
    P: Policy<Contact> + 'static,
{
    Arc::clone(policy) as Arc<dyn Policy<Contact>>
}

/// Counts calls of a closure.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn key(raw: impl Into<StoreKey>) -> StoreKey {
    raw.into()
}
