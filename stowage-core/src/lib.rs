#![warn(missing_docs)]
//! # stowage-core
//!
//! Foundational types for the stowage reactive cache.
//!
//! This crate holds everything a policy or a storage integration needs
//! without pulling in the policy engine itself:
//!
//! - [`StoreKey`] - canonical key form shared by the map, storage and channel
//! - [`Store`] - observable key-value map with mutate hook and secondary index
//! - [`KeyValueMap`] - swappable backing map, [`MemoryMap`] by default
//! - [`CacheStore`] - read/write surface shared by plain and augmented stores
//! - [`Storage`] - synchronous durable storage contract, [`MemoryStorage`]
//! - [`Clock`] - injectable wall clock, [`SystemClock`] and [`ManualClock`]

pub mod clock;
pub mod error;
pub mod key;
pub mod map;
pub mod storage;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StorageError;
pub use key::StoreKey;
pub use map::{KeyValueMap, MapFactory, MemoryMap, memory_map_factory};
pub use storage::{MemoryStorage, Storage};
pub use store::{
    CacheStore, IndexFn, MutateHook, Store, StoreBuilder, StoreEvent, StoreValue,
};
#[doc(hidden)]
pub use smol_str::SmolStr;
