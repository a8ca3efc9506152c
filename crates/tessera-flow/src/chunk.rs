//! Chunk execution state and lifecycle management.
//!
//! This module provides:
//! - `ChunkState`: The state machine for chunk execution
//! - `ChunkRecord`: Execution tracking for a single chunk
//! - `TransitionReason`: Explicit reasons for all state transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use tessera_core::{ChunkId, JobId, MatrixId};

use crate::error::{Error, Result};
use crate::plan::{ChunkSpec, RowRange};

/// Reason for a chunk state transition.
///
/// Every state transition carries an explicit reason for auditing,
/// metrics, and the failure summaries the reducer surfaces to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    // --- Happy path ---
    /// Worker picked the chunk up for its first attempt.
    Started,
    /// Worker picked the chunk up again after a transient failure.
    RetryStarted,
    /// Worker staged the partial result.
    Succeeded,

    // --- Failure path ---
    /// The matrix store was unreachable; another attempt may succeed.
    TransientFailure,
    /// The chunk sat in `Running` past the reclaim timeout.
    ReclaimTimeout,
    /// A transient failure occurred on the final permitted attempt.
    AttemptsExhausted,
    /// Stored chunk data failed to decode.
    CorruptData,
    /// The predicate raised a structural error (e.g. unknown column).
    StructuralPredicateFailure,
    /// The work unit could not be enqueued after bounded retries.
    DispatchFailed,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::RetryStarted => write!(f, "retry_started"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::ReclaimTimeout => write!(f, "reclaim_timeout"),
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
            Self::CorruptData => write!(f, "corrupt_data"),
            Self::StructuralPredicateFailure => write!(f, "structural_predicate_failure"),
            Self::DispatchFailed => write!(f, "dispatch_failed"),
        }
    }
}

/// Chunk execution state machine.
///
/// ```text
/// ┌─────────┐  worker claims   ┌─────────┐  staged    ┌──────┐
/// │ PENDING │─────────────────►│ RUNNING │───────────►│ DONE │
/// └─────────┘                  └─────────┘            └──────┘
///      │                         │     ▲
///      │ dispatch                │     │ redelivery
///      │ exhausted    transient  │     │ (attempt + 1)
///      │              failure    ▼     │
///      │               ┌──────────────────┐
///      │               │ FAILED_RETRYABLE │
///      │               └──────────────────┘
///      │                         │ attempts exhausted
///      ▼                         ▼ or permanent failure
/// ┌─────────────────────────────────┐
/// │         FAILED_TERMINAL         │
/// └─────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    /// Planned and persisted, not yet claimed by any worker.
    Pending,
    /// Claimed by a worker invocation.
    Running,
    /// Partial result staged; will be merged.
    Done,
    /// Failed transiently; eligible for redelivery.
    FailedRetryable,
    /// Failed permanently; fails the job.
    FailedTerminal,
}

impl ChunkState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::FailedTerminal)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::FailedTerminal),
            Self::Running => matches!(
                target,
                Self::Done | Self::FailedRetryable | Self::FailedTerminal
            ),
            Self::FailedRetryable => matches!(target, Self::Running | Self::FailedTerminal),
            Self::Done | Self::FailedTerminal => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
        }
    }
}

impl Default for ChunkState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Done => write!(f, "DONE"),
            Self::FailedRetryable => write!(f, "FAILED_RETRYABLE"),
            Self::FailedTerminal => write!(f, "FAILED_TERMINAL"),
        }
    }
}

/// Execution state for a single chunk within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// Chunk being executed.
    pub chunk_id: ChunkId,
    /// Owning job.
    pub job_id: JobId,
    /// The matrix this chunk slices.
    pub matrix_id: MatrixId,
    /// Global chunk index (merge position).
    pub chunk_index: u32,
    /// The rows this chunk covers.
    pub row_range: RowRange,
    /// Execution state.
    pub state: ChunkState,
    /// Attempt number (1-indexed, increments on each retry claim).
    pub attempt: u32,
    /// When the current attempt started executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the chunk reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason for the most recent state transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<TransitionReason>,
    /// Timestamp of the most recent state transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Failure description (if the chunk ever failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ChunkRecord {
    /// Creates a pending chunk record from a plan spec.
    #[must_use]
    pub fn from_spec(job_id: JobId, spec: &ChunkSpec) -> Self {
        Self {
            chunk_id: spec.chunk_id,
            job_id,
            matrix_id: spec.matrix_id.clone(),
            chunk_index: spec.chunk_index,
            row_range: spec.row_range,
            state: ChunkState::Pending,
            attempt: 1,
            started_at: None,
            completed_at: None,
            last_transition_reason: None,
            last_transition_at: None,
            failure: None,
        }
    }

    /// Returns true if the chunk is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if the chunk has sat in `Running` past `timeout`.
    ///
    /// Such chunks are presumed lost (a worker that died mid-flight) and
    /// reclaimed by the redispatch sweep as transient failures. The
    /// attempt guard on [`Self::transition_to`] keeps a late original
    /// invocation from clobbering the reclaiming retry.
    #[must_use]
    pub fn is_stale_running(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.state != ChunkState::Running {
            return false;
        }
        self.started_at.is_some_and(|started| {
            let elapsed = now.signed_duration_since(started);
            elapsed > chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX)
        })
    }

    /// Transitions to a new state with an explicit reason.
    ///
    /// Entering `Running` from `FailedRetryable` increments the attempt
    /// counter and clears per-attempt bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(chunk_id = %self.chunk_id, from = %self.state, to = %target, reason = %reason, attempt = self.attempt)
    )]
    pub fn transition_to(&mut self, target: ChunkState, reason: TransitionReason) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("not a valid chunk transition (reason {reason})"),
            });
        }

        let now = Utc::now();

        match target {
            ChunkState::Running => {
                if self.state == ChunkState::FailedRetryable {
                    self.attempt += 1;
                    self.failure = None;
                }
                self.started_at = Some(now);
            }
            ChunkState::Done | ChunkState::FailedTerminal => {
                self.completed_at = Some(now);
            }
            ChunkState::Pending | ChunkState::FailedRetryable => {}
        }

        self.state = target;
        self.last_transition_reason = Some(reason);
        self.last_transition_at = Some(now);
        Ok(())
    }

    /// Records a failure description alongside a failure transition.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    /// One-line description of a failed chunk for the request's failure
    /// reason.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        format!(
            "chunk {} ({}{}, attempt {}): {}",
            self.chunk_index,
            self.matrix_id,
            self.row_range,
            self.attempt,
            self.failure.as_deref().unwrap_or("unknown failure"),
        )
    }
}

/// Output of one successful chunk: the staged, filtered row subset.
///
/// Written once by the worker on success (duplicate writes land on the
/// same deterministic staging key), read exactly once by the reducer, and
/// deleted best-effort after a successful merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialResult {
    /// The chunk that produced this result.
    pub chunk_id: ChunkId,
    /// Owning job.
    pub job_id: JobId,
    /// Global chunk index (merge position).
    pub chunk_index: u32,
    /// Staging storage key holding the encoded rows.
    pub staging_key: String,
    /// Rows that survived the filter.
    pub row_count: u64,
    /// Encoded size in bytes.
    pub byte_size: u64,
    /// Values per surviving row (0 when no rows survived).
    pub column_count: u32,
}
