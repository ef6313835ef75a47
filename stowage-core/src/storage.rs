//! Synchronous durable storage contract.
//!
//! [`Storage`] is a flat string namespace with ordered key enumeration:
//! `length` plus `key(index)` is the only way to scan it, so consumers that
//! need "every key under a prefix" walk the whole namespace.

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::StorageError;

/// Flat key/value storage with ordered key enumeration.
pub trait Storage: Send + Sync {
    /// Reads the item stored under `key`.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Number of stored items.
    fn length(&self) -> usize;

    /// Name of the `index`-th key, if any.
    fn key(&self, index: usize) -> Option<String>;

    /// Every key, in enumeration order.
    fn keys(&self) -> Vec<String> {
        (0..self.length()).filter_map(|index| self.key(index)).collect()
    }
}

/// In-memory [`Storage`] keeping insertion order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<IndexMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.write().shift_remove(key);
        Ok(())
    }

    fn length(&self) -> usize {
        self.items.read().len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.items
            .read()
            .get_index(index)
            .map(|(key, _)| key.clone())
    }
}
