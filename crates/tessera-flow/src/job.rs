//! Job accounting: the fan-in side of the pipeline.
//!
//! A job carries the completion tallies for one request's chunks. The
//! tallies are the only piece of shared mutable state the workers touch
//! concurrently, so every update goes through the state store's atomic
//! increment (see [`crate::store::StateStore::increment_completion`]), and
//! the post-increment tally tells the incrementing worker, without a
//! second round trip, whether it just made the job reducible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::{JobId, MatrixId, RequestId};

/// Outcome of a terminal chunk transition, as counted by the job tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkTerminalOutcome {
    /// The chunk staged its partial result.
    Done,
    /// The chunk failed terminally.
    Failed,
}

/// Post-increment completion tallies for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionTally {
    /// Chunks that reached `Done`.
    pub completed: u32,
    /// Chunks that reached `FailedTerminal`.
    pub failed: u32,
    /// Total chunks planned for the job (fixed at plan time).
    pub total: u32,
}

impl CompletionTally {
    /// Returns true if every chunk has reached a terminal state.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.completed + self.failed == self.total
    }

    /// Returns true if the settled job failed.
    ///
    /// Any terminally failed chunk fails the job regardless of how many
    /// others completed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed > 0
    }
}

impl std::fmt::Display for CompletionTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} done / {} failed / {} total",
            self.completed, self.failed, self.total
        )
    }
}

/// The internal unit of work for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// The request this job executes.
    pub request_id: RequestId,
    /// Input matrices, in submission order.
    pub matrix_ids: Vec<MatrixId>,
    /// Total chunks planned (fixed before any dispatch).
    pub total_chunks: u32,
    /// Chunks that reached `Done`.
    pub completed_chunks: u32,
    /// Chunks that reached `FailedTerminal`.
    pub failed_chunks: u32,
    /// Whether a reducer has claimed this job (exactly-once guard).
    pub reduction_claimed: bool,
    /// Fingerprint of the chunk plan that produced this job.
    pub plan_fingerprint: String,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new job with zeroed tallies.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        matrix_ids: Vec<MatrixId>,
        total_chunks: u32,
        plan_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            request_id,
            matrix_ids,
            total_chunks,
            completed_chunks: 0,
            failed_chunks: 0,
            reduction_claimed: false,
            plan_fingerprint: plan_fingerprint.into(),
            created_at: Utc::now(),
        }
    }

    /// Returns the current completion tally.
    #[must_use]
    pub const fn tally(&self) -> CompletionTally {
        CompletionTally {
            completed: self.completed_chunks,
            failed: self.failed_chunks,
            total: self.total_chunks,
        }
    }
}

/// Final output of a job: the merged, filtered matrix.
///
/// Written once by the reducer; immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedMatrix {
    /// The job that produced this matrix.
    pub job_id: JobId,
    /// Storage key of the merged output.
    pub storage_key: String,
    /// Total rows across all partial results.
    pub row_count: u64,
    /// Values per row (0 for an empty result).
    pub column_count: u32,
    /// Encoded size in bytes.
    pub byte_size: u64,
    /// When the merge completed.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_tallies(completed: u32, failed: u32, total: u32) -> Job {
        let mut job = Job::new(RequestId::generate(), vec![], total, "fp");
        job.completed_chunks = completed;
        job.failed_chunks = failed;
        job
    }

    #[test]
    fn fresh_job_is_not_settled() {
        let job = job_with_tallies(0, 0, 3);
        assert!(!job.tally().is_settled());
    }

    #[test]
    fn settles_when_all_terminal() {
        assert!(job_with_tallies(3, 0, 3).tally().is_settled());
        assert!(job_with_tallies(2, 1, 3).tally().is_settled());
        assert!(!job_with_tallies(2, 0, 3).tally().is_settled());
    }

    #[test]
    fn any_terminal_failure_fails_the_job() {
        let tally = job_with_tallies(2, 1, 3).tally();
        assert!(tally.is_settled());
        assert!(tally.is_failed());

        let tally = job_with_tallies(3, 0, 3).tally();
        assert!(!tally.is_failed());
    }

    #[test]
    fn chunkless_job_is_vacuously_settled_and_successful() {
        let tally = job_with_tallies(0, 0, 0).tally();
        assert!(tally.is_settled());
        assert!(!tally.is_failed());
    }
}
