//! The driver: intake, planning, and fan-out.
//!
//! `submit` turns a validated submission into durable state and dispatched
//! work, in a fixed order that the completion accounting depends on:
//!
//! 1. validate the submission (reject before anything is persisted)
//! 2. read row counts (cheap metadata reads, retried on outages)
//! 3. persist the request, the job, and the *complete* chunk plan as
//!    `Pending`, so the total chunk count is fixed before any execution
//! 4. dispatch one envelope per chunk, each with bounded backoff; a chunk
//!    whose dispatch is exhausted fails terminally right away (the job
//!    never waits for an invocation that never started)
//! 5. transition the request to `InProgress`
//!
//! The driver also owns the redispatch sweep: the supervising policy that
//! re-enqueues parked retryable chunks and reclaims chunks stuck in
//! `Running` past the configured timeout.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use tessera_core::{ChunkedMatrixStore, JobId, MatrixId, RequestId};

use crate::chunk::{ChunkRecord, ChunkState, TransitionReason};
use crate::config::FlowConfig;
use crate::dispatch::{ChunkEnvelope, EnqueueOptions, EnqueueResult, WorkQueue};
use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::job::{ChunkTerminalOutcome, Job};
use crate::metrics;
use crate::plan::plan_chunks;
use crate::predicate::PredicateSpec;
use crate::reducer::Reducer;
use crate::request::Request;
use crate::store::{CasResult, StateStore};

/// The driver: accepts submissions and fans out chunk work.
pub struct Driver {
    store: Arc<dyn StateStore>,
    matrices: Arc<dyn ChunkedMatrixStore>,
    queue: Arc<dyn WorkQueue>,
    reducer: Arc<Reducer>,
    outbox: Arc<dyn EventSink>,
    config: FlowConfig,
}

impl Driver {
    /// Creates a new driver.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        matrices: Arc<dyn ChunkedMatrixStore>,
        queue: Arc<dyn WorkQueue>,
        reducer: Arc<Reducer>,
        outbox: Arc<dyn EventSink>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store,
            matrices,
            queue,
            reducer,
            outbox,
            config,
        }
    }

    /// Accepts a filter request and fans out its chunk work.
    ///
    /// Returns the request ID the client polls for status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an empty matrix list or an
    /// unknown matrix (nothing is persisted in that case), or a storage
    /// error if persisting state fails.
    #[tracing::instrument(skip(self, predicate), fields(matrices = matrix_ids.len()))]
    pub async fn submit(
        &self,
        matrix_ids: Vec<MatrixId>,
        predicate: PredicateSpec,
    ) -> Result<RequestId> {
        if matrix_ids.is_empty() {
            return Err(Error::invalid_request(
                "at least one matrix ID is required",
            ));
        }
        self.config.validate()?;

        // Cheap metadata reads, retried on outages. An unknown matrix
        // rejects the whole submission before any state is written.
        let mut row_counts = Vec::with_capacity(matrix_ids.len());
        for matrix_id in &matrix_ids {
            let rows = self.row_count_with_retry(matrix_id).await?;
            row_counts.push((matrix_id.clone(), rows));
        }

        let request = Request::new(matrix_ids, predicate.clone());
        let request_id = request.id;
        self.store.create_request(&request).await?;
        self.outbox.push(PipelineEvent::new(
            PipelineEventData::RequestCreated { request_id },
        ));

        // Persist the job and the complete chunk plan before any dispatch:
        // the total chunk count must be fixed before any completion can be
        // observed.
        let plan = plan_chunks(&row_counts, self.config.target_chunk_rows)?;
        let job = Job::new(
            request_id,
            request.matrix_ids.clone(),
            u32::try_from(plan.len())
                .map_err(|_| Error::invalid_request("chunk plan exceeds u32 chunk count"))?,
            &plan.fingerprint,
        );
        let job_id = job.id;
        let chunks: Vec<ChunkRecord> = plan
            .chunks
            .iter()
            .map(|spec| ChunkRecord::from_spec(job_id, spec))
            .collect();
        self.store.create_job(&job, &chunks).await?;

        tracing::info!(
            %request_id,
            %job_id,
            chunks = plan.len(),
            fingerprint = %plan.fingerprint,
            "chunk plan persisted"
        );

        for chunk in &chunks {
            self.dispatch_chunk(chunk, &predicate, 1).await?;
        }

        self.store.start_request(&request_id).await?;
        self.outbox.push(PipelineEvent::new(
            PipelineEventData::RequestStarted { request_id },
        ));

        // A job can be settled at this point: an all-empty submission
        // plans zero chunks, and a total dispatch outage fails every
        // chunk. The worker-driven trigger never fires for those, so the
        // driver checks once after dispatch.
        let job = self
            .store
            .get_job(&job_id)
            .await?
            .ok_or(Error::JobNotFound { job_id })?;
        if job.tally().is_settled() {
            self.reducer.reduce(&job_id).await?;
        }

        Ok(request_id)
    }

    /// Redelivery sweep: re-enqueues parked retryable chunks and reclaims
    /// chunks stuck in `Running` past the reclaim timeout.
    ///
    /// `now` is passed in so supervisors (and tests) control the clock.
    /// Returns the number of chunks re-enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist or a state-store
    /// operation fails.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn redispatch(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<u32> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(Error::JobNotFound { job_id: *job_id });
        };
        if job.reduction_claimed || job.tally().is_settled() {
            return Ok(0);
        }

        let request = self
            .store
            .get_request(&job.request_id)
            .await?
            .ok_or(Error::RequestNotFound {
                request_id: job.request_id,
            })?;

        let candidates = self
            .store
            .reclaim_candidates(job_id, now, self.config.reclaim_timeout)
            .await?;

        let mut redispatched = 0;
        for candidate in candidates {
            // Reclaim stuck Running chunks into the retryable pool first.
            // The CAS (and the attempt guard behind it) ensures a late
            // original invocation cannot clobber what follows.
            if candidate.state == ChunkState::Running {
                let cas = self
                    .store
                    .transition_chunk(
                        job_id,
                        &candidate.chunk_id,
                        &[ChunkState::Running],
                        ChunkState::FailedRetryable,
                        TransitionReason::ReclaimTimeout,
                        candidate.attempt,
                        Some("no completion within the reclaim timeout".into()),
                    )
                    .await?;
                if !cas.is_success() {
                    // The invocation finished (or was reclaimed) after the
                    // candidate snapshot; leave it alone.
                    continue;
                }
            }

            if candidate.attempt >= self.config.max_chunk_attempts {
                self.fail_chunk(
                    job_id,
                    &candidate,
                    TransitionReason::AttemptsExhausted,
                    format!(
                        "{} (after {} attempts)",
                        candidate.failure.as_deref().unwrap_or("retries exhausted"),
                        candidate.attempt
                    ),
                )
                .await?;
                continue;
            }

            let envelope = ChunkEnvelope::new(
                candidate.chunk_id,
                *job_id,
                candidate.matrix_id.clone(),
                candidate.chunk_index,
                candidate.row_range,
                request.predicate.clone(),
                candidate.attempt + 1,
            );
            match self.enqueue_with_retry(envelope).await {
                Ok(()) => {
                    metrics::record_retry();
                    self.outbox.push(PipelineEvent::new(
                        PipelineEventData::ChunkDispatched {
                            job_id: *job_id,
                            chunk_id: candidate.chunk_id,
                            attempt: candidate.attempt + 1,
                        },
                    ));
                    redispatched += 1;
                }
                Err(error) => {
                    self.fail_chunk(
                        job_id,
                        &candidate,
                        TransitionReason::DispatchFailed,
                        error.to_string(),
                    )
                    .await?;
                }
            }
        }

        Ok(redispatched)
    }

    /// Dispatches one planned chunk, failing it terminally if the
    /// envelope cannot be enqueued within the bounded retries.
    async fn dispatch_chunk(
        &self,
        chunk: &ChunkRecord,
        predicate: &PredicateSpec,
        attempt: u32,
    ) -> Result<()> {
        let envelope = ChunkEnvelope::new(
            chunk.chunk_id,
            chunk.job_id,
            chunk.matrix_id.clone(),
            chunk.chunk_index,
            chunk.row_range,
            predicate.clone(),
            attempt,
        );

        match self.enqueue_with_retry(envelope).await {
            Ok(()) => {
                metrics::record_dispatch("enqueued");
                self.outbox.push(PipelineEvent::new(
                    PipelineEventData::ChunkDispatched {
                        job_id: chunk.job_id,
                        chunk_id: chunk.chunk_id,
                        attempt,
                    },
                ));
                Ok(())
            }
            Err(error) => {
                metrics::record_dispatch("failed");
                tracing::error!(
                    chunk_id = %chunk.chunk_id,
                    %error,
                    "dispatch exhausted; failing chunk terminally"
                );
                self.fail_chunk(
                    &chunk.job_id,
                    chunk,
                    TransitionReason::DispatchFailed,
                    error.to_string(),
                )
                .await
            }
        }
    }

    /// Enqueues with bounded exponential backoff.
    ///
    /// Transient enqueue errors and `QueueFull` are retried; anything else
    /// (or exhaustion) is a dispatch failure.
    async fn enqueue_with_retry(&self, envelope: ChunkEnvelope) -> Result<()> {
        let chunk_id = envelope.chunk_id;
        let mut last_failure = String::new();

        for attempt in 1..=self.config.max_dispatch_attempts {
            if attempt > 1 {
                let backoff = self.config.dispatch_backoff * (1 << (attempt - 2).min(8));
                tokio::time::sleep(backoff).await;
            }

            match self.queue.enqueue(envelope.clone(), EnqueueOptions::new()).await {
                Ok(EnqueueResult::Enqueued { .. } | EnqueueResult::Deduplicated { .. }) => {
                    return Ok(());
                }
                Ok(EnqueueResult::QueueFull) => {
                    last_failure = "queue full".into();
                }
                Err(error) if error.is_transient() => {
                    last_failure = error.to_string();
                }
                Err(error) => return Err(error),
            }
            tracing::warn!(%chunk_id, attempt, %last_failure, "enqueue attempt failed");
        }

        Err(Error::DispatchFailure {
            chunk_id,
            attempts: self.config.max_dispatch_attempts,
            message: last_failure,
        })
    }

    /// Fails a chunk terminally and runs the settle check, since no worker
    /// invocation will ever report this chunk.
    async fn fail_chunk(
        &self,
        job_id: &JobId,
        chunk: &ChunkRecord,
        reason: TransitionReason,
        message: String,
    ) -> Result<()> {
        let cas = self
            .store
            .transition_chunk(
                job_id,
                &chunk.chunk_id,
                &[ChunkState::Pending, ChunkState::FailedRetryable],
                ChunkState::FailedTerminal,
                reason,
                chunk.attempt,
                Some(message),
            )
            .await?;
        if !matches!(cas, CasResult::Success) {
            // Someone else moved the chunk; their accounting stands.
            return Ok(());
        }

        metrics::record_chunk_terminal("failed_terminal");
        let tally = self
            .store
            .increment_completion(job_id, ChunkTerminalOutcome::Failed)
            .await?;
        self.outbox.push(PipelineEvent::new(
            PipelineEventData::ChunkCompleted {
                job_id: *job_id,
                chunk_id: chunk.chunk_id,
                chunk_index: chunk.chunk_index,
                state: ChunkState::FailedTerminal,
                attempt: chunk.attempt,
            },
        ));

        if tally.is_settled() {
            self.reducer.reduce(job_id).await?;
        }
        Ok(())
    }

    /// Reads a matrix's row count with bounded retry on outages.
    async fn row_count_with_retry(&self, matrix_id: &MatrixId) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match self.matrices.row_count(matrix_id).await {
                Ok(rows) => return Ok(rows),
                Err(tessera_core::Error::NotFound(_)) => {
                    return Err(Error::invalid_request(format!(
                        "unknown matrix '{matrix_id}'"
                    )));
                }
                Err(error)
                    if error.is_transient() && attempt < self.config.max_dispatch_attempts =>
                {
                    let backoff = self.config.dispatch_backoff * (1 << (attempt - 1).min(8));
                    tracing::warn!(%matrix_id, attempt, %error, "metadata read failed; retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::InMemoryWorkQueue;
    use crate::events::InMemoryOutbox;
    use crate::request::RequestState;
    use crate::store::memory::InMemoryStateStore;
    use std::time::Duration;
    use tessera_core::matrix::Row;
    use tessera_core::{MemoryBackend, StoredMatrixStore};

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        queue: Arc<InMemoryWorkQueue>,
        outbox: Arc<InMemoryOutbox>,
        driver: Driver,
    }

    async fn fixture(matrices: &[(&str, u64)], config: FlowConfig, queue_capacity: Option<usize>) -> Fixture {
        let blob = Arc::new(MemoryBackend::new());
        let matrix_store = StoredMatrixStore::new(blob.clone());
        for (name, rows) in matrices {
            let id = MatrixId::new(*name).unwrap();
            let rows: Vec<Row> = (0..*rows)
                .map(|i| Row::new(format!("{name}-{i}"), vec![i as f64]))
                .collect();
            matrix_store
                .write_matrix(&id, vec!["GENE_A".into()], &rows, 100)
                .await
                .unwrap();
        }

        let store = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(match queue_capacity {
            Some(cap) => InMemoryWorkQueue::with_capacity("test", cap),
            None => InMemoryWorkQueue::new("test"),
        });
        let outbox = Arc::new(InMemoryOutbox::new());
        let reducer = Arc::new(Reducer::new(store.clone(), blob, outbox.clone()));
        let driver = Driver::new(
            store.clone(),
            Arc::new(matrix_store),
            queue.clone(),
            reducer,
            outbox.clone(),
            config,
        );

        Fixture {
            store,
            queue,
            outbox,
            driver,
        }
    }

    fn fast_config() -> FlowConfig {
        let mut config = FlowConfig::default().with_target_chunk_rows(2);
        config.dispatch_backoff = Duration::from_millis(1);
        config
    }

    fn ids(names: &[&str]) -> Vec<MatrixId> {
        names.iter().map(|n| MatrixId::new(*n).unwrap()).collect()
    }

    #[tokio::test]
    async fn rejects_empty_submission() {
        let fx = fixture(&[], fast_config(), None).await;
        let result = fx.driver.submit(vec![], PredicateSpec::SelectAll).await;
        assert!(matches!(result, Err(Error::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn rejects_unknown_matrix_before_persisting_anything() {
        let fx = fixture(&[("known", 4)], fast_config(), None).await;
        let result = fx
            .driver
            .submit(ids(&["known", "ghost"]), PredicateSpec::SelectAll)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest { .. })));
        assert_eq!(fx.store.request_count().unwrap(), 0);
        assert_eq!(fx.queue.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn plans_persists_and_dispatches_every_chunk() {
        // Matrices of 5 and 3 rows at chunk size 2 plan 5 chunks.
        let fx = fixture(&[("a", 5), ("b", 3)], fast_config(), None).await;

        let request_id = fx
            .driver
            .submit(ids(&["a", "b"]), PredicateSpec::SelectAll)
            .await
            .unwrap();

        let request = fx.store.get_request(&request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::InProgress);
        let job_id = request.job_id.unwrap();

        let job = fx.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.total_chunks, 5);

        let chunks = fx.store.list_chunks(&job_id).await.unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.state == ChunkState::Pending));

        assert_eq!(fx.queue.queue_depth().await.unwrap(), 5);

        // Envelopes carry the planned ranges in index order.
        let entries = fx.queue.drain().unwrap();
        let ranges: Vec<(u64, u64)> = entries
            .iter()
            .map(|e| (e.envelope.row_range.start, e.envelope.row_range.end))
            .collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 5), (0, 2), (2, 3)]);
    }

    #[tokio::test]
    async fn all_empty_submission_completes_immediately() {
        let fx = fixture(&[("empty", 0)], fast_config(), None).await;

        let request_id = fx
            .driver
            .submit(ids(&["empty"]), PredicateSpec::SelectAll)
            .await
            .unwrap();

        let request = fx.store.get_request(&request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Complete);

        let job_id = request.job_id.unwrap();
        let merged = fx.store.get_merged_matrix(&job_id).await.unwrap().unwrap();
        assert_eq!(merged.row_count, 0);
    }

    #[tokio::test]
    async fn exhausted_dispatch_fails_chunks_and_surfaces_failure() {
        // Queue admits nothing: every dispatch exhausts its retries.
        let fx = fixture(&[("m", 3)], fast_config(), Some(0)).await;

        let request_id = fx
            .driver
            .submit(ids(&["m"]), PredicateSpec::SelectAll)
            .await
            .unwrap();

        let request = fx.store.get_request(&request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Failed);
        let reason = request.failure_reason.unwrap();
        assert!(reason.contains("2 of 2 chunks failed"));
        assert!(reason.contains("queue full"));

        let job_id = request.job_id.unwrap();
        let chunks = fx.store.list_chunks(&job_id).await.unwrap();
        assert!(chunks.iter().all(|c| c.state == ChunkState::FailedTerminal));
        assert!(chunks
            .iter()
            .all(|c| c.last_transition_reason == Some(TransitionReason::DispatchFailed)));
    }

    #[tokio::test]
    async fn redispatch_re_enqueues_parked_chunks_with_next_attempt() {
        let fx = fixture(&[("m", 2)], fast_config(), None).await;
        let request_id = fx
            .driver
            .submit(ids(&["m"]), PredicateSpec::SelectAll)
            .await
            .unwrap();
        let request = fx.store.get_request(&request_id).await.unwrap().unwrap();
        let job_id = request.job_id.unwrap();
        let chunk = fx.store.list_chunks(&job_id).await.unwrap().remove(0);
        fx.queue.drain().unwrap();

        // Simulate a worker parking the chunk after a transient failure.
        fx.store
            .transition_chunk(
                &job_id,
                &chunk.chunk_id,
                &[ChunkState::Pending],
                ChunkState::Running,
                TransitionReason::Started,
                1,
                None,
            )
            .await
            .unwrap();
        fx.store
            .transition_chunk(
                &job_id,
                &chunk.chunk_id,
                &[ChunkState::Running],
                ChunkState::FailedRetryable,
                TransitionReason::TransientFailure,
                1,
                Some("store unavailable".into()),
            )
            .await
            .unwrap();

        let redispatched = fx.driver.redispatch(&job_id, Utc::now()).await.unwrap();
        assert_eq!(redispatched, 1);

        let entries = fx.queue.drain().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.chunk_id, chunk.chunk_id);
        assert_eq!(entries[0].envelope.attempt, 2);
    }

    #[tokio::test]
    async fn redispatch_reclaims_stale_running_chunks() {
        let fx = fixture(&[("m", 2)], fast_config(), None).await;
        let request_id = fx
            .driver
            .submit(ids(&["m"]), PredicateSpec::SelectAll)
            .await
            .unwrap();
        let request = fx.store.get_request(&request_id).await.unwrap().unwrap();
        let job_id = request.job_id.unwrap();
        let chunk = fx.store.list_chunks(&job_id).await.unwrap().remove(0);
        fx.queue.drain().unwrap();

        // A worker claimed the chunk and died.
        fx.store
            .transition_chunk(
                &job_id,
                &chunk.chunk_id,
                &[ChunkState::Pending],
                ChunkState::Running,
                TransitionReason::Started,
                1,
                None,
            )
            .await
            .unwrap();

        // Not stale yet: nothing happens.
        assert_eq!(fx.driver.redispatch(&job_id, Utc::now()).await.unwrap(), 0);

        // Well past the reclaim timeout: reclaimed and re-enqueued.
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(fx.driver.redispatch(&job_id, later).await.unwrap(), 1);

        let record = fx
            .store
            .get_chunk(&job_id, &chunk.chunk_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, ChunkState::FailedRetryable);

        let entries = fx.queue.drain().unwrap();
        assert_eq!(entries[0].envelope.attempt, 2);
    }

    #[tokio::test]
    async fn redispatch_terminal_izes_chunks_out_of_attempts() {
        let config = fast_config().with_max_chunk_attempts(1);
        let fx = fixture(&[("m", 2)], config, None).await;
        let request_id = fx
            .driver
            .submit(ids(&["m"]), PredicateSpec::SelectAll)
            .await
            .unwrap();
        let request = fx.store.get_request(&request_id).await.unwrap().unwrap();
        let job_id = request.job_id.unwrap();
        let chunk = fx.store.list_chunks(&job_id).await.unwrap().remove(0);

        fx.store
            .transition_chunk(
                &job_id,
                &chunk.chunk_id,
                &[ChunkState::Pending],
                ChunkState::Running,
                TransitionReason::Started,
                1,
                None,
            )
            .await
            .unwrap();
        fx.store
            .transition_chunk(
                &job_id,
                &chunk.chunk_id,
                &[ChunkState::Running],
                ChunkState::FailedRetryable,
                TransitionReason::TransientFailure,
                1,
                Some("store unavailable".into()),
            )
            .await
            .unwrap();

        assert_eq!(fx.driver.redispatch(&job_id, Utc::now()).await.unwrap(), 0);

        let record = fx
            .store
            .get_chunk(&job_id, &chunk.chunk_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, ChunkState::FailedTerminal);
        assert_eq!(
            record.last_transition_reason,
            Some(TransitionReason::AttemptsExhausted)
        );

        let job = fx.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.failed_chunks, 1);
    }

    #[tokio::test]
    async fn submit_emits_lifecycle_events() {
        let fx = fixture(&[("m", 2)], fast_config(), None).await;
        fx.driver
            .submit(ids(&["m"]), PredicateSpec::SelectAll)
            .await
            .unwrap();

        let names: Vec<String> = fx
            .outbox
            .events()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "tessera.flow.request_created",
                "tessera.flow.chunk_dispatched",
                "tessera.flow.request_started",
            ]
        );
    }
}
