//! Error types for policy operations.
//!
//! Failures are split by where they surface:
//!
//! - [`RequestError`] - a single fetch or mutation request failed (transport,
//!   timeout, malformed reply, remote error). Fetch failures are logged and
//!   swallowed by the policy manager; mutation failures reach the caller.
//! - [`MutationError`] - an optimistic or delegated write did not land.
//! - [`PolicyError`] - anything a policy hook or its background continuation
//!   reports back through the manager.

use std::time::Duration;

use stowage_core::{StorageError, StoreKey};
use thiserror::Error;

/// Boxed error supplied by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single fetch or mutation request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The transport failed before a reply was produced.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply arrived within the configured timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A reply arrived but matched none of the expected shapes.
    #[error("invalid response")]
    InvalidResponse,

    /// No worker controller was available and no fallback was configured.
    #[error("no worker controller available")]
    ControllerUnavailable,

    /// The remote side answered with an explicit error message.
    #[error("remote error: {0}")]
    Remote(String),

    /// The payload could not be decoded into the expected type.
    #[error(transparent)]
    Decode(#[from] serde_json::Error),

    /// Error raised by a user-supplied fetcher or mutation function.
    #[error(transparent)]
    Other(BoxError),
}

impl RequestError {
    /// Wraps an arbitrary error.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Other(error.into())
    }
}

/// Error returned by fetch hooks.
pub type FetchError = RequestError;

/// A write that did not land.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The request failed and the mutation stays queued for replay.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Retries were exhausted or the error was not retryable; the store was
    /// restored to its pre-mutation value.
    #[error("mutation of `{key}` rolled back after {attempts} attempt(s)")]
    RolledBack {
        /// Key whose value was restored.
        key: StoreKey,
        /// Number of times the mutation function was called.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: RequestError,
    },
}

/// Error reported by a policy hook or continuation.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Durable storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No realtime channel could be resolved.
    #[error("realtime channel unavailable")]
    ChannelUnavailable,

    /// A fetch failed.
    #[error(transparent)]
    Fetch(#[from] RequestError),

    /// A mutation failed.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// A value could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A background continuation exceeded its time budget and was cancelled.
    #[error("policy task cancelled after {0:?}")]
    TaskTimeout(Duration),

    /// A background continuation panicked or was aborted.
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}
