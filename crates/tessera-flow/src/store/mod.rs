//! Pluggable storage for orchestration state.
//!
//! The `StateStore` trait defines the persistence layer for requests,
//! jobs, and chunks: the single source of truth for "is this job done
//! yet".
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Chunk transitions use compare-and-swap to absorb
//!   duplicate deliveries and late retries
//! - **Atomic tallies**: Completion counting is increment-and-read in one
//!   step, so the incrementing worker learns, without a second round trip,
//!   whether it just made the job reducible
//! - **Linearizable per key**: All operations on one job/chunk observe a
//!   total order; this is what makes the fan-in correct under concurrent
//!   worker completions
//! - **Testability**: In-memory implementation for testing; a database
//!   implementation slots in behind the same trait for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use tessera_core::{ChunkId, JobId, RequestId};

use crate::chunk::{ChunkRecord, ChunkState, PartialResult, TransitionReason};
use crate::error::Result;
use crate::job::{ChunkTerminalOutcome, CompletionTally, Job, MergedMatrix};
use crate::request::Request;

/// Result of a compare-and-swap chunk transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Transition applied.
    Success,
    /// Job or chunk not found.
    NotFound,
    /// Current state was not in the expected set.
    StateMismatch {
        /// The actual state that was found.
        actual: ChunkState,
    },
    /// The invocation belongs to an earlier attempt than the record's.
    ///
    /// This is the guard that keeps a late original invocation from
    /// clobbering a subsequent retry's progress.
    StaleAttempt {
        /// The record's current attempt.
        actual: u32,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the entity was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Terminal outcome written onto a request exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The merged matrix was written at the given location.
    Complete {
        /// Storage key of the merged matrix.
        result_location: String,
    },
    /// One or more chunks failed terminally.
    Failed {
        /// Reason enumerating the failed chunks.
        reason: String,
    },
}

/// Storage abstraction for orchestration state.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from many
/// worker invocations.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- Request operations ---

    /// Creates a request record.
    async fn create_request(&self, request: &Request) -> Result<()>;

    /// Gets a request by ID. Returns `None` if it does not exist.
    async fn get_request(&self, request_id: &RequestId) -> Result<Option<Request>>;

    /// Transitions a request from `Created` to `InProgress`.
    ///
    /// Returns `Ok(false)` if the request already left `Created` (a
    /// degenerate job may settle first); idempotent no-op.
    async fn start_request(&self, request_id: &RequestId) -> Result<bool>;

    /// Writes a request's terminal outcome at most once.
    ///
    /// Returns `Ok(true)` if this call wrote the terminal state,
    /// `Ok(false)` if the request was already terminal (idempotent no-op).
    async fn complete_request(
        &self,
        request_id: &RequestId,
        outcome: RequestOutcome,
    ) -> Result<bool>;

    // --- Job operations ---

    /// Creates a job together with its full chunk plan, atomically.
    ///
    /// Persisting every chunk before any dispatch fixes the total chunk
    /// count before any completion can be observed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::JobAlreadyExists`] if the request
    /// already has a job (idempotent create guard).
    async fn create_job(&self, job: &Job, chunks: &[ChunkRecord]) -> Result<()>;

    /// Gets a job by ID. Returns `None` if it does not exist.
    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>>;

    // --- Chunk operations (CAS) ---

    /// Gets one chunk record.
    async fn get_chunk(&self, job_id: &JobId, chunk_id: &ChunkId) -> Result<Option<ChunkRecord>>;

    /// Lists a job's chunks ordered by chunk index.
    async fn list_chunks(&self, job_id: &JobId) -> Result<Vec<ChunkRecord>>;

    /// Atomically transitions a chunk if its state is in `from_states` and
    /// the invocation's `attempt` is current.
    ///
    /// This is the core primitive for at-least-once correctness:
    /// - A duplicate invocation fails the state check and no-ops
    /// - A late invocation from a superseded attempt fails the attempt
    ///   check and cannot clobber the retry that replaced it
    ///
    /// `failure` is recorded on the chunk when provided (failure
    /// transitions).
    async fn transition_chunk(
        &self,
        job_id: &JobId,
        chunk_id: &ChunkId,
        from_states: &[ChunkState],
        to_state: ChunkState,
        reason: TransitionReason,
        attempt: u32,
        failure: Option<String>,
    ) -> Result<CasResult>;

    /// Atomically bumps a job's completion tally and returns the
    /// post-increment counts.
    async fn increment_completion(
        &self,
        job_id: &JobId,
        outcome: ChunkTerminalOutcome,
    ) -> Result<CompletionTally>;

    /// Claims the reduction for a job.
    ///
    /// Returns `Ok(true)` exactly once per job, no matter how many workers
    /// observe "all chunks terminal" concurrently.
    async fn try_claim_reduction(&self, job_id: &JobId) -> Result<bool>;

    // --- Result records ---

    /// Records a chunk's partial result (overwrite-idempotent).
    async fn put_partial_result(&self, partial: &PartialResult) -> Result<()>;

    /// Lists a job's partial results ordered by chunk index.
    async fn list_partial_results(&self, job_id: &JobId) -> Result<Vec<PartialResult>>;

    /// Records the merged matrix for a job.
    async fn put_merged_matrix(&self, merged: &MergedMatrix) -> Result<()>;

    /// Gets the merged matrix for a job, if one was written.
    async fn get_merged_matrix(&self, job_id: &JobId) -> Result<Option<MergedMatrix>>;

    // --- Redispatch queries ---

    /// Returns chunks eligible for redelivery: parked `FailedRetryable`
    /// chunks, plus `Running` chunks stuck past `reclaim_timeout`.
    async fn reclaim_candidates(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
        reclaim_timeout: Duration,
    ) -> Result<Vec<ChunkRecord>>;
}
