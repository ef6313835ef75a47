//! Policy metrics.
//!
//! Enable the `metrics` feature to record counters through the [`metrics`]
//! facade. Without it every `record_*` function is a no-op.
//!
//! All names follow the pattern `stowage_{subject}_total`.
//!
//! [`metrics`]: https://docs.rs/metrics

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    // Read path

    /// Track number of fetches performed by policies.
    pub static ref FETCH_TOTAL: &'static str = {
        metrics::describe_counter!(
            "stowage_fetch_total",
            "Total number of fetches performed by policies."
        );
        "stowage_fetch_total"
    };
    /// Track number of failed fetches.
    pub static ref FETCH_ERRORS: &'static str = {
        metrics::describe_counter!(
            "stowage_fetch_errors_total",
            "Total number of fetches that failed and served the cached value."
        );
        "stowage_fetch_errors_total"
    };

    // Write path

    /// Track number of scheduled mutation retries.
    pub static ref MUTATION_RETRIES: &'static str = {
        metrics::describe_counter!(
            "stowage_mutation_retries_total",
            "Total number of optimistic mutation retries."
        );
        "stowage_mutation_retries_total"
    };
    /// Track number of optimistic mutations rolled back.
    pub static ref MUTATION_ROLLBACKS: &'static str = {
        metrics::describe_counter!(
            "stowage_mutation_rollbacks_total",
            "Total number of optimistic mutations rolled back."
        );
        "stowage_mutation_rollbacks_total"
    };
    /// Track number of queued mutations replayed, by outcome.
    pub static ref QUEUE_REPLAYED: &'static str = {
        metrics::describe_counter!(
            "stowage_queue_replayed_total",
            "Total number of queued mutations replayed."
        );
        "stowage_queue_replayed_total"
    };

    // Realtime

    /// Track number of remote events applied.
    pub static ref REALTIME_APPLIED: &'static str = {
        metrics::describe_counter!(
            "stowage_realtime_applied_total",
            "Total number of remote events applied to the local store."
        );
        "stowage_realtime_applied_total"
    };
    /// Track number of remote values rejected as stale.
    pub static ref REALTIME_REJECTED: &'static str = {
        metrics::describe_counter!(
            "stowage_realtime_rejected_total",
            "Total number of remote values rejected by version comparison."
        );
        "stowage_realtime_rejected_total"
    };
}

/// Records a fetch issued through `policy`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_fetch(policy: &str) {
    metrics::counter!(*FETCH_TOTAL, "policy" => policy.to_string()).increment(1);
}

/// Records a failed fetch issued through `policy`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_fetch_error(policy: &str) {
    metrics::counter!(*FETCH_ERRORS, "policy" => policy.to_string()).increment(1);
}

/// Records a scheduled mutation retry.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_mutation_retry() {
    metrics::counter!(*MUTATION_RETRIES).increment(1);
}

/// Records a rolled back mutation.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_mutation_rollback() {
    metrics::counter!(*MUTATION_ROLLBACKS).increment(1);
}

/// Records one replayed queued mutation.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_queue_replayed(success: bool) {
    let outcome = if success { "success" } else { "requeued" };
    metrics::counter!(*QUEUE_REPLAYED, "outcome" => outcome).increment(1);
}

/// Records a remote event applied locally.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_realtime_applied(event: &'static str) {
    metrics::counter!(*REALTIME_APPLIED, "event" => event).increment(1);
}

/// Records a remote value rejected as older than the cached one.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_realtime_rejected() {
    metrics::counter!(*REALTIME_REJECTED).increment(1);
}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_fetch(_policy: &str) {}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_fetch_error(_policy: &str) {}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_mutation_retry() {}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_mutation_rollback() {}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_queue_replayed(_success: bool) {}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_realtime_applied(_event: &'static str) {}

/// No-op without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_realtime_rejected() {}
