//! Work dispatch abstraction for chunk fan-out.
//!
//! This module provides:
//!
//! - [`ChunkEnvelope`]: Serializable chunk work payload
//! - [`WorkQueue`]: Trait for enqueueing chunk work to execution backends
//! - [`InMemoryWorkQueue`]: In-memory queue for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: Same interface for hosted queues, local workers
//! - **At-least-once**: The channel may redeliver; consumers are idempotent
//! - **Idempotent dispatch**: `(chunk, attempt)` keys enable deduplication
//! - **Structured payloads**: JSON-serializable envelopes

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::{ChunkId, JobId, MatrixId};

use crate::error::Result;
use crate::plan::RowRange;
use crate::predicate::PredicateSpec;

/// Envelope for one chunk of work.
///
/// Contains everything a stateless worker needs: no worker ever consults
/// the request record, only this payload plus the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    /// Chunk to process.
    pub chunk_id: ChunkId,
    /// Owning job.
    pub job_id: JobId,
    /// Matrix to read.
    pub matrix_id: MatrixId,
    /// Global chunk index (merge position, staging key component).
    pub chunk_index: u32,
    /// Rows to read.
    pub row_range: RowRange,
    /// Filter to apply.
    pub predicate: PredicateSpec,
    /// Attempt number this delivery represents (1-indexed).
    pub attempt: u32,
    /// When the envelope was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl ChunkEnvelope {
    /// Creates a new envelope for the given attempt.
    #[must_use]
    pub fn new(
        chunk_id: ChunkId,
        job_id: JobId,
        matrix_id: MatrixId,
        chunk_index: u32,
        row_range: RowRange,
        predicate: PredicateSpec,
        attempt: u32,
    ) -> Self {
        Self {
            chunk_id,
            job_id,
            matrix_id,
            chunk_index,
            row_range,
            predicate,
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns the idempotency key for this delivery.
    ///
    /// Uses chunk ID + attempt so retries are distinguishable from
    /// duplicates of the same attempt.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.chunk_id, self.attempt)
    }

    /// Serializes the envelope to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes an envelope from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Result of enqueuing a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Chunk was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// Chunk was deduplicated (this attempt is already enqueued).
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the chunk was accepted (enqueued or already there).
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Enqueued { .. } | Self::Deduplicated { .. })
    }

    /// Returns the message ID if accepted.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => Some(message_id),
            Self::QueueFull => None,
        }
    }
}

/// Options for chunk enqueueing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the chunk becomes visible to workers.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay before the chunk becomes visible.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Work queue abstraction for dispatching chunks to execution backends.
///
/// Implementations may target hosted queues (SQS, Cloud Tasks) or local
/// in-memory queues for testing. Delivery is at-least-once: the consumer
/// side (the worker) is idempotent, so redelivery is safe.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent dispatch.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues a chunk for execution.
    ///
    /// # Returns
    ///
    /// - `EnqueueResult::Enqueued` with a message ID on success
    /// - `EnqueueResult::Deduplicated` if this attempt is already enqueued
    /// - `EnqueueResult::QueueFull` if the queue is at capacity
    async fn enqueue(
        &self,
        envelope: ChunkEnvelope,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult>;

    /// Returns the approximate number of chunks in the queue.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_envelope() -> ChunkEnvelope {
        ChunkEnvelope::new(
            ChunkId::generate(),
            JobId::generate(),
            MatrixId::new("m").unwrap(),
            0,
            RowRange { start: 0, end: 10 },
            PredicateSpec::SelectAll,
            1,
        )
    }

    #[test]
    fn envelope_idempotency_key() {
        let envelope = create_test_envelope();
        let key = envelope.idempotency_key();
        assert!(key.contains(&envelope.chunk_id.to_string()));
        assert!(key.ends_with("-1"));
    }

    #[test]
    fn envelope_json_round_trip() {
        let envelope = create_test_envelope();
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"chunkIndex\":0"));
        assert!(json.contains("\"rowRange\""));

        let parsed = ChunkEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn enqueue_result_accessors() {
        assert!(EnqueueResult::Enqueued {
            message_id: "msg-1".to_string()
        }
        .is_accepted());
        assert!(EnqueueResult::Deduplicated {
            existing_message_id: "msg-1".to_string()
        }
        .is_accepted());
        assert!(!EnqueueResult::QueueFull.is_accepted());
        assert_eq!(EnqueueResult::QueueFull.message_id(), None);
    }

    #[test]
    fn enqueue_options_builder() {
        let options = EnqueueOptions::new().with_delay(Duration::from_secs(30));
        assert_eq!(options.delay, Some(Duration::from_secs(30)));
    }
}
