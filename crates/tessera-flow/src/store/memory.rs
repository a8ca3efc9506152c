//! In-memory state store implementation for testing.
//!
//! This module provides [`InMemoryStateStore`], a simple in-memory
//! implementation of the [`StateStore`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries
//!
//! Linearizability comes for free here: every operation takes the single
//! write lock, so all transitions and tally bumps observe a total order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tessera_core::{ChunkId, JobId, RequestId};

use super::{CasResult, RequestOutcome, StateStore};
use crate::chunk::{ChunkRecord, ChunkState, PartialResult, TransitionReason};
use crate::error::{Error, Result};
use crate::job::{ChunkTerminalOutcome, CompletionTally, Job, MergedMatrix};
use crate::request::{Request, RequestState};

/// Internal store state protected by a single lock.
#[derive(Debug, Default)]
struct StoreState {
    requests: HashMap<RequestId, Request>,
    request_jobs: HashMap<RequestId, JobId>,
    jobs: HashMap<JobId, Job>,
    /// Chunk records per job, ordered by chunk index.
    chunks: HashMap<JobId, Vec<ChunkRecord>>,
    /// Partial results per job, keyed by chunk index for ordered reads.
    partials: HashMap<JobId, BTreeMap<u32, PartialResult>>,
    merged: HashMap<JobId, MergedMatrix>,
}

/// In-memory state store for testing.
///
/// ## Example
///
/// ```rust
/// use tessera_flow::store::memory::InMemoryStateStore;
///
/// let store = InMemoryStateStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: RwLock<StoreState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("state store lock poisoned")
}

impl InMemoryStateStore {
    /// Creates a new empty in-memory state store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of requests currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn request_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.requests.len())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_request(&self, request: &Request) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> Result<Option<Request>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.requests.get(request_id).cloned())
    }

    async fn start_request(&self, request_id: &RequestId) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let request = state
            .requests
            .get_mut(request_id)
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;

        if request.state != RequestState::Created {
            return Ok(false);
        }
        request.transition_to(RequestState::InProgress)?;
        Ok(true)
    }

    async fn complete_request(
        &self,
        request_id: &RequestId,
        outcome: RequestOutcome,
    ) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let request = state
            .requests
            .get_mut(request_id)
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;

        if request.is_terminal() {
            return Ok(false);
        }

        match outcome {
            RequestOutcome::Complete { result_location } => {
                request.result_location = Some(result_location);
                request.transition_to(RequestState::Complete)?;
            }
            RequestOutcome::Failed { reason } => {
                request.failure_reason = Some(reason);
                request.transition_to(RequestState::Failed)?;
            }
        }
        Ok(true)
    }

    async fn create_job(&self, job: &Job, chunks: &[ChunkRecord]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.request_jobs.get(&job.request_id) {
            return Err(Error::JobAlreadyExists {
                request_id: job.request_id,
                existing_job_id: *existing,
            });
        }

        let mut ordered: Vec<ChunkRecord> = chunks.to_vec();
        ordered.sort_by_key(|c| c.chunk_index);

        state.request_jobs.insert(job.request_id, job.id);
        state.jobs.insert(job.id, job.clone());
        state.chunks.insert(job.id, ordered);
        if let Some(request) = state.requests.get_mut(&job.request_id) {
            request.job_id = Some(job.id);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn get_chunk(&self, job_id: &JobId, chunk_id: &ChunkId) -> Result<Option<ChunkRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .chunks
            .get(job_id)
            .and_then(|chunks| chunks.iter().find(|c| &c.chunk_id == chunk_id))
            .cloned())
    }

    async fn list_chunks(&self, job_id: &JobId) -> Result<Vec<ChunkRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.chunks.get(job_id).cloned().unwrap_or_default())
    }

    async fn transition_chunk(
        &self,
        job_id: &JobId,
        chunk_id: &ChunkId,
        from_states: &[ChunkState],
        to_state: ChunkState,
        reason: TransitionReason,
        attempt: u32,
        failure: Option<String>,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(chunks) = state.chunks.get_mut(job_id) else {
            return Ok(CasResult::NotFound);
        };
        let Some(chunk) = chunks.iter_mut().find(|c| &c.chunk_id == chunk_id) else {
            return Ok(CasResult::NotFound);
        };

        if attempt < chunk.attempt {
            return Ok(CasResult::StaleAttempt {
                actual: chunk.attempt,
            });
        }
        if !from_states.contains(&chunk.state) {
            return Ok(CasResult::StateMismatch {
                actual: chunk.state,
            });
        }

        chunk.transition_to(to_state, reason)?;
        if let Some(message) = failure {
            chunk.record_failure(message);
        }
        Ok(CasResult::Success)
    }

    async fn increment_completion(
        &self,
        job_id: &JobId,
        outcome: ChunkTerminalOutcome,
    ) -> Result<CompletionTally> {
        let mut state = self.state.write().map_err(poison_err)?;
        let job = state.jobs.get_mut(job_id).ok_or(Error::JobNotFound {
            job_id: *job_id,
        })?;

        match outcome {
            ChunkTerminalOutcome::Done => job.completed_chunks += 1,
            ChunkTerminalOutcome::Failed => job.failed_chunks += 1,
        }
        Ok(job.tally())
    }

    async fn try_claim_reduction(&self, job_id: &JobId) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let job = state.jobs.get_mut(job_id).ok_or(Error::JobNotFound {
            job_id: *job_id,
        })?;

        if job.reduction_claimed {
            return Ok(false);
        }
        job.reduction_claimed = true;
        Ok(true)
    }

    async fn put_partial_result(&self, partial: &PartialResult) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .partials
            .entry(partial.job_id)
            .or_default()
            .insert(partial.chunk_index, partial.clone());
        Ok(())
    }

    async fn list_partial_results(&self, job_id: &JobId) -> Result<Vec<PartialResult>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .partials
            .get(job_id)
            .map(|by_index| by_index.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_merged_matrix(&self, merged: &MergedMatrix) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.merged.insert(merged.job_id, merged.clone());
        Ok(())
    }

    async fn get_merged_matrix(&self, job_id: &JobId) -> Result<Option<MergedMatrix>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.merged.get(job_id).cloned())
    }

    async fn reclaim_candidates(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
        reclaim_timeout: Duration,
    ) -> Result<Vec<ChunkRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.chunks.get(job_id).map_or_else(Vec::new, |chunks| {
            chunks
                .iter()
                .filter(|c| {
                    c.state == ChunkState::FailedRetryable
                        || c.is_stale_running(now, reclaim_timeout)
                })
                .cloned()
                .collect()
        }))
    }
}
