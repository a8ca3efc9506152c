//! In-memory work queue implementation for testing.
//!
//! This module provides [`InMemoryWorkQueue`], a simple in-memory
//! implementation of the [`WorkQueue`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Work is not visible across process boundaries
//! - **No delay support**: The delay option is accepted but ignored
//! - **Deduplication is queue-scoped**: Keys are released when chunks are
//!   taken, which is exactly what an at-least-once channel does: a taken
//!   chunk can be re-enqueued, simulating redelivery in tests

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use super::{ChunkEnvelope, EnqueueOptions, EnqueueResult, WorkQueue};
use crate::error::{Error, Result};

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// Idempotency key for deduplication.
    pub idempotency_key: String,
    /// Chunk envelope.
    pub envelope: ChunkEnvelope,
}

/// Internal queue state protected by a single lock.
#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueueEntry>,
    seen_keys: HashMap<String, String>,
}

/// In-memory work queue for testing.
///
/// ## Example
///
/// ```rust
/// use tessera_flow::dispatch::memory::InMemoryWorkQueue;
///
/// let queue = InMemoryWorkQueue::new("test-queue");
/// // Enqueue chunks in tests...
/// ```
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    name: String,
    state: RwLock<QueueState>,
    /// Maximum queue capacity.
    max_capacity: Option<usize>,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("work queue lock poisoned")
}

impl InMemoryWorkQueue {
    /// Creates a new in-memory work queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: None,
        }
    }

    /// Creates a queue with a maximum capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: Some(max_capacity),
        }
    }

    /// Generates a new message ID.
    fn generate_message_id() -> String {
        Ulid::new().to_string()
    }

    /// Takes the next chunk from the queue.
    ///
    /// Returns `None` if the queue is empty. Releases the entry's
    /// deduplication key, so the same delivery can be enqueued again
    /// (at-least-once redelivery in tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.queue.pop_front();
        if let Some(ref entry) = entry {
            state.seen_keys.remove(&entry.idempotency_key);
        }
        drop(state);
        Ok(entry)
    }

    /// Returns all enqueued chunks, clearing the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let drained: Vec<_> = state.queue.drain(..).collect();
        for entry in &drained {
            state.seen_keys.remove(&entry.idempotency_key);
        }
        drop(state);
        Ok(drained)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        envelope: ChunkEnvelope,
        _options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let idempotency_key = envelope.idempotency_key();

        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.seen_keys.get(&idempotency_key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        if let Some(max) = self.max_capacity {
            if state.queue.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Self::generate_message_id();
        state
            .seen_keys
            .insert(idempotency_key.clone(), message_id.clone());
        state.queue.push_back(QueueEntry {
            message_id: message_id.clone(),
            idempotency_key,
            envelope,
        });
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RowRange;
    use crate::predicate::PredicateSpec;
    use tessera_core::{ChunkId, JobId, MatrixId};

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

    #[tokio::test]
    async fn enqueue_and_take() -> Result<()> {
        let queue = InMemoryWorkQueue::new("test");

        let envelope = create_test_envelope();
        let envelope_clone = envelope.clone();
        let chunk_id = envelope.chunk_id;

        let result = queue.enqueue(envelope, EnqueueOptions::default()).await?;
        assert!(matches!(result, EnqueueResult::Enqueued { .. }));

        let entry = queue.take()?.expect("should have entry");
        assert_eq!(entry.envelope.chunk_id, chunk_id);

        // Queue should be empty now
        assert!(queue.take()?.is_none());

        // Dedup key is released after take: redelivery is possible
        let result = queue
            .enqueue(envelope_clone, EnqueueOptions::default())
            .await?;
        assert!(matches!(result, EnqueueResult::Enqueued { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn same_attempt_is_deduplicated() -> Result<()> {
        let queue = InMemoryWorkQueue::new("test");

        let envelope = create_test_envelope();
        let duplicate = envelope.clone();

        let first = queue.enqueue(envelope, EnqueueOptions::default()).await?;
        let first_id = first.message_id().unwrap().to_string();

        let second = queue.enqueue(duplicate, EnqueueOptions::default()).await?;
        assert_eq!(
            second,
            EnqueueResult::Deduplicated {
                existing_message_id: first_id
            }
        );
        assert_eq!(queue.queue_depth().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn different_attempts_are_distinct() -> Result<()> {
        let queue = InMemoryWorkQueue::new("test");

        let mut envelope1 = create_test_envelope();
        envelope1.attempt = 1;
        let mut envelope2 = envelope1.clone();
        envelope2.attempt = 2;

        assert!(queue
            .enqueue(envelope1, EnqueueOptions::default())
            .await?
            .is_accepted());
        assert!(matches!(
            queue.enqueue(envelope2, EnqueueOptions::default()).await?,
            EnqueueResult::Enqueued { .. }
        ));
        assert_eq!(queue.queue_depth().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn capacity_limit() -> Result<()> {
        let queue = InMemoryWorkQueue::with_capacity("test", 2);

        queue
            .enqueue(create_test_envelope(), EnqueueOptions::default())
            .await?;
        queue
            .enqueue(create_test_envelope(), EnqueueOptions::default())
            .await?;

        let third = queue
            .enqueue(create_test_envelope(), EnqueueOptions::default())
            .await?;
        assert_eq!(third, EnqueueResult::QueueFull);
        Ok(())
    }

    #[tokio::test]
    async fn drain_clears_queue_and_dedup_state() -> Result<()> {
        let queue = InMemoryWorkQueue::new("test");

        let envelope = create_test_envelope();
        let again = envelope.clone();
        queue.enqueue(envelope, EnqueueOptions::default()).await?;

        let drained = queue.drain()?;
        assert_eq!(drained.len(), 1);
        assert_eq!(queue.queue_depth().await?, 0);

        // Dedup key was released
        assert!(matches!(
            queue.enqueue(again, EnqueueOptions::default()).await?,
            EnqueueResult::Enqueued { .. }
        ));
        Ok(())
    }

    #[test]
    fn queue_name() {
        let queue = InMemoryWorkQueue::new("chunk-work");
        assert_eq!(queue.queue_name(), "chunk-work");
    }
}
