//! Background execution of policy continuations.
//!
//! Policy hooks run synchronously and hand back async continuations for
//! their I/O. The [`OffloadManager`] spawns those on the tokio runtime,
//! tracks what is still running, and drops keyed work that is already in
//! flight, such as a second refetch of key 7 after two invalidations.
//!
//! ```ignore
//! use stowage::offload::{OffloadKey, OffloadManager};
//!
//! let offload = OffloadManager::default();
//! let handle = offload.spawn("persistence", async { Ok(()) });
//! let refetch = offload.spawn_keyed(OffloadKey::keyed("invalidate", 7), async { Ok(()) });
//! ```

mod config;
mod manager;

pub use config::{ContinuationTimeout, OffloadConfig};
pub use manager::{OffloadKey, OffloadManager};
