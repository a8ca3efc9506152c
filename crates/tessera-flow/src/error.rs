//! Error types for the orchestration domain.

use tessera_core::{ChunkId, JobId, RequestId};

/// The result type used throughout tessera-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submission was rejected before any job was created.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What made the submission invalid.
        message: String,
    },

    /// A request was not found.
    #[error("request not found: {request_id}")]
    RequestNotFound {
        /// The request ID that was not found.
        request_id: RequestId,
    },

    /// A job was not found.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// The job ID that was not found.
        job_id: JobId,
    },

    /// A chunk was not found within a job.
    #[error("chunk not found: {chunk_id} in job {job_id}")]
    ChunkNotFound {
        /// The owning job.
        job_id: JobId,
        /// The chunk ID that was not found.
        chunk_id: ChunkId,
    },

    /// A request already has a job (idempotent create violation).
    #[error("request {request_id} already has job {existing_job_id}")]
    JobAlreadyExists {
        /// The request that was submitted twice.
        request_id: RequestId,
        /// The job already recorded for it.
        existing_job_id: JobId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Dispatching a chunk failed after exhausting retries.
    #[error("dispatch failed for chunk {chunk_id} after {attempts} attempts: {message}")]
    DispatchFailure {
        /// The chunk whose dispatch was given up on.
        chunk_id: ChunkId,
        /// How many enqueue attempts were made.
        attempts: u32,
        /// The last enqueue error.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tessera-core.
    #[error("core error: {0}")]
    Core(#[from] tessera_core::Error),
}

impl Error {
    /// Creates a new invalid-request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Mirrors the transience split in `tessera_core::Error`: only backend
    /// outages are worth retrying, everything else is either permanent or a
    /// logic error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Core(core) if core.is_transient())
    }
}
