//! Error types shared by storage implementations.

use thiserror::Error;

/// Error raised by a [`Storage`](crate::Storage) or another durable backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend refused or could not perform the operation (quota, I/O,
    /// closed database).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
