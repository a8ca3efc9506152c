//! Observability metrics for the pipeline.
//!
//! Metrics are exposed via the `metrics` crate facade; any exporter the
//! host process installs (Prometheus, statsd, ...) picks them up.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tessera_flow_chunks_total` | Counter | `to_state` | Terminal chunk transitions |
//! | `tessera_flow_dispatches_total` | Counter | `result` | Chunk enqueue outcomes |
//! | `tessera_flow_retries_total` | Counter | - | Chunk redeliveries requested |
//! | `tessera_flow_reductions_total` | Counter | `status` | Reduction outcomes |
//! | `tessera_flow_requests_total` | Counter | `state` | Request terminal states |
//! | `tessera_flow_chunk_duration_seconds` | Histogram | - | Worker chunk processing time |
//! | `tessera_flow_merge_duration_seconds` | Histogram | - | Reducer merge time |

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Terminal chunk transitions.
    pub const CHUNKS_TOTAL: &str = "tessera_flow_chunks_total";
    /// Counter: Chunk enqueue outcomes.
    pub const DISPATCHES_TOTAL: &str = "tessera_flow_dispatches_total";
    /// Counter: Chunk redeliveries requested by the sweep.
    pub const RETRIES_TOTAL: &str = "tessera_flow_retries_total";
    /// Counter: Reduction outcomes.
    pub const REDUCTIONS_TOTAL: &str = "tessera_flow_reductions_total";
    /// Counter: Request terminal states.
    pub const REQUESTS_TOTAL: &str = "tessera_flow_requests_total";
    /// Histogram: Worker chunk processing time in seconds.
    pub const CHUNK_DURATION_SECONDS: &str = "tessera_flow_chunk_duration_seconds";
    /// Histogram: Reducer merge time in seconds.
    pub const MERGE_DURATION_SECONDS: &str = "tessera_flow_merge_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Target chunk state (done, failed_terminal, ...).
    pub const TO_STATE: &str = "to_state";
    /// Enqueue outcome (enqueued, deduplicated, failed).
    pub const RESULT: &str = "result";
    /// Reduction outcome (merged, failed, already_claimed).
    pub const STATUS: &str = "status";
    /// Request terminal state (complete, failed).
    pub const STATE: &str = "state";
}

/// Records a terminal chunk transition.
pub fn record_chunk_terminal(to_state: &'static str) {
    counter!(names::CHUNKS_TOTAL, labels::TO_STATE => to_state).increment(1);
}

/// Records a chunk enqueue outcome.
pub fn record_dispatch(result: &'static str) {
    counter!(names::DISPATCHES_TOTAL, labels::RESULT => result).increment(1);
}

/// Records a redelivery requested by the redispatch sweep.
pub fn record_retry() {
    counter!(names::RETRIES_TOTAL).increment(1);
}

/// Records a reduction outcome.
pub fn record_reduction(status: &'static str) {
    counter!(names::REDUCTIONS_TOTAL, labels::STATUS => status).increment(1);
}

/// Records a request reaching a terminal state.
pub fn record_request_terminal(state: &'static str) {
    counter!(names::REQUESTS_TOTAL, labels::STATE => state).increment(1);
}

/// Records how long a worker spent on one chunk.
pub fn observe_chunk_duration(seconds: f64) {
    histogram!(names::CHUNK_DURATION_SECONDS).record(seconds);
}

/// Records how long a merge took.
pub fn observe_merge_duration(seconds: f64) {
    histogram!(names::MERGE_DURATION_SECONDS).record(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_do_not_panic_without_an_exporter() {
        // The metrics facade no-ops when no recorder is installed; these
        // must all be safe to call from library code unconditionally.
        record_chunk_terminal("done");
        record_dispatch("enqueued");
        record_retry();
        record_reduction("merged");
        record_request_terminal("complete");
        observe_chunk_duration(0.25);
        observe_merge_duration(1.5);
    }

    #[test]
    fn metric_names_are_namespaced() {
        assert!(names::CHUNKS_TOTAL.starts_with("tessera_flow_"));
        assert!(names::MERGE_DURATION_SECONDS.starts_with("tessera_flow_"));
    }
}
