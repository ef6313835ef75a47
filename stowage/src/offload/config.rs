//! Continuation tracking options.

use std::time::Duration;

/// Limit applied to a single continuation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContinuationTimeout {
    /// Continuations run to completion.
    #[default]
    Unbounded,
    /// Abort the continuation and report [`PolicyError::TaskTimeout`](crate::PolicyError::TaskTimeout).
    Abort(Duration),
    /// Let the continuation finish, but warn once it has run this long.
    WarnAfter(Duration),
}

/// Options for an [`OffloadManager`](super::OffloadManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadConfig {
    /// Limit applied to every continuation.
    pub timeout: ContinuationTimeout,
    /// Drop a keyed continuation while another one for the same key runs.
    pub deduplicate: bool,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            timeout: ContinuationTimeout::Unbounded,
            deduplicate: true,
        }
    }
}

impl OffloadConfig {
    /// Sets the limit applied to every continuation.
    pub fn timeout(self, timeout: ContinuationTimeout) -> Self {
        Self { timeout, ..self }
    }

    /// Shorthand for [`ContinuationTimeout::Abort`].
    pub fn abort_after(self, duration: Duration) -> Self {
        self.timeout(ContinuationTimeout::Abort(duration))
    }

    /// Enables or disables deduplication of keyed continuations.
    pub fn deduplicate(self, deduplicate: bool) -> Self {
        Self {
            deduplicate,
            ..self
        }
    }
}
