//! Deterministic fan-in: merging partial results into the final matrix.
//!
//! The reducer runs at most once per job, guarded by the state store's
//! reduction claim. It never merges a partially failed job: any
//! terminally failed chunk surfaces as a `Failed` request with the failed
//! chunks enumerated, and no merged-matrix key is ever written.
//!
//! Merging streams: partials are fetched one at a time in chunk-index
//! order and appended to the output, so peak memory is one partial plus
//! the growing output, never all partials resident at once. Because the
//! row codec is concatenation-stable, appending encoded partials in index
//! order yields exactly the matrix-then-range row order fixed at plan
//! time, independent of the order chunks completed in.

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use std::time::Instant;

use tessera_core::{JobId, StorageBackend};

use crate::chunk::ChunkState;
use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::job::MergedMatrix;
use crate::metrics;
use crate::paths;
use crate::request::RequestState;
use crate::store::{RequestOutcome, StateStore};

/// Outcome of a reduction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceOutcome {
    /// This call performed the merge and completed the request.
    Merged(MergedMatrix),
    /// This call surfaced the job's failure onto the request.
    FailedJob {
        /// The failure reason written to the request.
        reason: String,
    },
    /// Another caller already claimed the reduction.
    AlreadyClaimed,
    /// The job's chunks are not all terminal yet; nothing was done.
    NotSettled,
}

/// The reducer: exactly-once merge of a settled job.
pub struct Reducer {
    store: Arc<dyn StateStore>,
    blob: Arc<dyn StorageBackend>,
    outbox: Arc<dyn EventSink>,
}

impl Reducer {
    /// Creates a new reducer.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        blob: Arc<dyn StorageBackend>,
        outbox: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            blob,
            outbox,
        }
    }

    /// Reduces a settled job.
    ///
    /// Safe to call from every worker that observes a settled tally and
    /// from the driver: the reduction claim admits exactly one caller, the
    /// rest return [`ReduceOutcome::AlreadyClaimed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist or a storage operation
    /// fails mid-merge. The claim is not released on error; recovery is an
    /// operator concern, the same as any half-written durable state.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn reduce(&self, job_id: &JobId) -> Result<ReduceOutcome> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound { job_id: *job_id })?;

        let tally = job.tally();
        if !tally.is_settled() {
            return Ok(ReduceOutcome::NotSettled);
        }

        if !self.store.try_claim_reduction(job_id).await? {
            metrics::record_reduction("already_claimed");
            return Ok(ReduceOutcome::AlreadyClaimed);
        }
        self.outbox.push(PipelineEvent::new(
            PipelineEventData::ReductionClaimed { job_id: *job_id },
        ));

        if tally.is_failed() {
            let reason = self.failure_reason(job_id).await?;
            tracing::warn!(request_id = %job.request_id, %reason, "job failed; surfacing failure");
            self.store
                .complete_request(
                    &job.request_id,
                    RequestOutcome::Failed {
                        reason: reason.clone(),
                    },
                )
                .await?;
            self.outbox.push(PipelineEvent::new(
                PipelineEventData::RequestCompleted {
                    request_id: job.request_id,
                    state: RequestState::Failed,
                },
            ));
            metrics::record_reduction("failed");
            metrics::record_request_terminal("failed");
            return Ok(ReduceOutcome::FailedJob { reason });
        }

        let start = Instant::now();
        let merged = self.merge_partials(job_id).await?;
        metrics::observe_merge_duration(start.elapsed().as_secs_f64());

        self.store.put_merged_matrix(&merged).await?;
        self.store
            .complete_request(
                &job.request_id,
                RequestOutcome::Complete {
                    result_location: merged.storage_key.clone(),
                },
            )
            .await?;
        self.outbox.push(PipelineEvent::new(
            PipelineEventData::RequestCompleted {
                request_id: job.request_id,
                state: RequestState::Complete,
            },
        ));
        metrics::record_reduction("merged");
        metrics::record_request_terminal("complete");

        self.cleanup_staging(job_id).await;

        tracing::info!(
            request_id = %job.request_id,
            rows = merged.row_count,
            bytes = merged.byte_size,
            "merged matrix written"
        );
        Ok(ReduceOutcome::Merged(merged))
    }

    /// Fetches partials one at a time in chunk-index order and appends
    /// each to the output.
    async fn merge_partials(&self, job_id: &JobId) -> Result<MergedMatrix> {
        let partials = self.store.list_partial_results(job_id).await?;

        let mut output = BytesMut::new();
        let mut row_count: u64 = 0;
        let mut column_count: u32 = 0;

        for partial in &partials {
            if partial.row_count == 0 {
                continue;
            }
            if column_count == 0 {
                column_count = partial.column_count;
            } else if partial.column_count != column_count {
                return Err(Error::storage(format!(
                    "partial result {} has {} columns, expected {}",
                    partial.staging_key, partial.column_count, column_count
                )));
            }

            let data = self.blob.get(&partial.staging_key).await?;
            output.put_slice(&data);
            row_count += partial.row_count;
        }

        let storage_key = paths::merged_key(job_id);
        let byte_size = output.len() as u64;
        self.blob.put(&storage_key, output.freeze()).await?;

        Ok(MergedMatrix {
            job_id: *job_id,
            storage_key,
            row_count,
            column_count,
            byte_size,
            created_at: Utc::now(),
        })
    }

    /// Builds the failure reason enumerating every terminally failed chunk.
    async fn failure_reason(&self, job_id: &JobId) -> Result<String> {
        let chunks = self.store.list_chunks(job_id).await?;
        let summaries: Vec<String> = chunks
            .iter()
            .filter(|c| c.state == ChunkState::FailedTerminal)
            .map(crate::chunk::ChunkRecord::failure_summary)
            .collect();
        Ok(format!(
            "{} of {} chunks failed: {}",
            summaries.len(),
            chunks.len(),
            summaries.join("; ")
        ))
    }

    /// Best-effort deletion of staged partials after a successful merge.
    ///
    /// Deletes run with bounded concurrency; failures are logged and
    /// swallowed. The job's terminal status never depends on cleanup.
    async fn cleanup_staging(&self, job_id: &JobId) {
        const MAX_IN_FLIGHT_DELETES: usize = 16;

        let partials = match self.store.list_partial_results(job_id).await {
            Ok(partials) => partials,
            Err(error) => {
                tracing::warn!(%job_id, %error, "skipping staging cleanup");
                return;
            }
        };
        stream::iter(partials)
            .for_each_concurrent(MAX_IN_FLIGHT_DELETES, |partial| {
                let blob = self.blob.clone();
                async move {
                    if let Err(error) = blob.delete(&partial.staging_key).await {
                        tracing::warn!(
                            key = %partial.staging_key,
                            %error,
                            "failed to delete staged partial"
                        );
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkRecord, PartialResult, TransitionReason};
    use crate::events::InMemoryOutbox;
    use crate::job::{ChunkTerminalOutcome, Job};
    use crate::plan::plan_chunks;
    use crate::predicate::PredicateSpec;
    use crate::request::Request;
    use crate::store::memory::InMemoryStateStore;
    use bytes::Bytes;
    use tessera_core::matrix::{Row, encode_rows};
    use tessera_core::{MatrixId, MemoryBackend};

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        blob: Arc<MemoryBackend>,
        reducer: Reducer,
        request: Request,
        job: Job,
        chunks: Vec<ChunkRecord>,
    }

    /// Seeds a request + job with `total` chunks of 2 rows each.
    async fn fixture(total: u64) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let blob = Arc::new(MemoryBackend::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let reducer = Reducer::new(store.clone(), blob.clone(), outbox);

        let matrix_id = MatrixId::new("m").unwrap();
        let request = Request::new(vec![matrix_id.clone()], PredicateSpec::SelectAll);
        store.create_request(&request).await.unwrap();

        let plan = plan_chunks(&[(matrix_id, total * 2)], 2).unwrap();
        let job = Job::new(
            request.id,
            request.matrix_ids.clone(),
            plan.len() as u32,
            &plan.fingerprint,
        );
        let chunks: Vec<ChunkRecord> = plan
            .chunks
            .iter()
            .map(|spec| ChunkRecord::from_spec(job.id, spec))
            .collect();
        store.create_job(&job, &chunks).await.unwrap();

        Fixture {
            store,
            blob,
            reducer,
            request,
            job,
            chunks,
        }
    }

    /// Marks a chunk done with a staged partial of `rows` rows.
    async fn complete_chunk(fx: &Fixture, index: usize, rows: &[Row]) {
        let chunk = &fx.chunks[index];
        fx.store
            .transition_chunk(
                &fx.job.id,
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
                &fx.job.id,
                &chunk.chunk_id,
                &[ChunkState::Running],
                ChunkState::Done,
                TransitionReason::Succeeded,
                1,
                None,
            )
            .await
            .unwrap();

        let staging_key = paths::staging_key(&fx.job.id, chunk.chunk_index);
        let data = encode_rows(rows).unwrap();
        fx.blob.put(&staging_key, data.clone()).await.unwrap();
        fx.store
            .put_partial_result(&PartialResult {
                chunk_id: chunk.chunk_id,
                job_id: fx.job.id,
                chunk_index: chunk.chunk_index,
                staging_key,
                row_count: rows.len() as u64,
                byte_size: data.len() as u64,
                column_count: rows.first().map_or(0, |r| r.values.len() as u32),
            })
            .await
            .unwrap();
        fx.store
            .increment_completion(&fx.job.id, ChunkTerminalOutcome::Done)
            .await
            .unwrap();
    }

    /// Marks a chunk terminally failed.
    async fn fail_chunk(fx: &Fixture, index: usize, message: &str) {
        let chunk = &fx.chunks[index];
        fx.store
            .transition_chunk(
                &fx.job.id,
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
                &fx.job.id,
                &chunk.chunk_id,
                &[ChunkState::Running],
                ChunkState::FailedTerminal,
                TransitionReason::CorruptData,
                1,
                Some(message.to_string()),
            )
            .await
            .unwrap();
        fx.store
            .increment_completion(&fx.job.id, ChunkTerminalOutcome::Failed)
            .await
            .unwrap();
    }

    fn rows_for(index: u64) -> Vec<Row> {
        vec![
            Row::new(format!("cell-{}", index * 2), vec![1.0, 2.0]),
            Row::new(format!("cell-{}", index * 2 + 1), vec![3.0, 4.0]),
        ]
    }

    #[tokio::test]
    async fn unsettled_job_is_not_reduced() {
        let fx = fixture(2).await;
        complete_chunk(&fx, 0, &rows_for(0)).await;

        let outcome = fx.reducer.reduce(&fx.job.id).await.unwrap();
        assert_eq!(outcome, ReduceOutcome::NotSettled);
    }

    #[tokio::test]
    async fn merges_in_chunk_index_order_regardless_of_completion_order() {
        let fx = fixture(3).await;
        // Complete out of order: 2, 0, 1
        complete_chunk(&fx, 2, &rows_for(2)).await;
        complete_chunk(&fx, 0, &rows_for(0)).await;
        complete_chunk(&fx, 1, &rows_for(1)).await;

        let outcome = fx.reducer.reduce(&fx.job.id).await.unwrap();
        let ReduceOutcome::Merged(merged) = outcome else {
            panic!("expected merge, got {outcome:?}");
        };
        assert_eq!(merged.row_count, 6);
        assert_eq!(merged.column_count, 2);

        let data = fx.blob.get(&merged.storage_key).await.unwrap();
        let rows = tessera_core::matrix::decode_rows(&merged.storage_key, &data).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["cell-0", "cell-1", "cell-2", "cell-3", "cell-4", "cell-5"]
        );

        let request = fx.store.get_request(&fx.request.id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Complete);
        assert_eq!(request.result_location, Some(merged.storage_key));
    }

    #[tokio::test]
    async fn failed_chunk_fails_the_request_and_writes_no_merge() {
        let fx = fixture(3).await;
        complete_chunk(&fx, 0, &rows_for(0)).await;
        complete_chunk(&fx, 2, &rows_for(2)).await;
        fail_chunk(&fx, 1, "corrupt data at matrices/m/rows/1").await;

        let outcome = fx.reducer.reduce(&fx.job.id).await.unwrap();
        let ReduceOutcome::FailedJob { reason } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("1 of 3 chunks failed"));
        assert!(reason.contains("corrupt data"));

        // No merged matrix key exists in storage.
        let merged_key = paths::merged_key(&fx.job.id);
        assert!(!fx.blob.exists(&merged_key).await.unwrap());
        assert!(fx
            .store
            .get_merged_matrix(&fx.job.id)
            .await
            .unwrap()
            .is_none());

        let request = fx.store.get_request(&fx.request.id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Failed);
        assert!(request.failure_reason.unwrap().contains("chunk 1"));
    }

    #[tokio::test]
    async fn reduction_runs_exactly_once_under_concurrent_signals() {
        let fx = fixture(2).await;
        complete_chunk(&fx, 0, &rows_for(0)).await;
        complete_chunk(&fx, 1, &rows_for(1)).await;

        // Two workers observe the settled tally concurrently.
        let reducer = Arc::new(fx.reducer);
        let (a, b) = tokio::join!(reducer.reduce(&fx.job.id), reducer.reduce(&fx.job.id));

        let merged = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|o| matches!(o, ReduceOutcome::Merged(_)))
            .count();
        assert_eq!(merged, 1, "exactly one caller must perform the merge");
    }

    #[tokio::test]
    async fn chunkless_job_completes_with_empty_matrix() {
        let fx = fixture(0).await;

        let outcome = fx.reducer.reduce(&fx.job.id).await.unwrap();
        let ReduceOutcome::Merged(merged) = outcome else {
            panic!("expected merge, got {outcome:?}");
        };
        assert_eq!(merged.row_count, 0);
        assert_eq!(merged.byte_size, 0);
    }

    #[tokio::test]
    async fn staging_cleanup_is_best_effort() {
        let fx = fixture(2).await;
        complete_chunk(&fx, 0, &rows_for(0)).await;
        complete_chunk(&fx, 1, &rows_for(1)).await;

        fx.reducer.reduce(&fx.job.id).await.unwrap();

        // Staged partials were deleted; the merged output remains.
        for chunk in &fx.chunks {
            let key = paths::staging_key(&fx.job.id, chunk.chunk_index);
            assert!(!fx.blob.exists(&key).await.unwrap());
        }
        assert!(fx
            .blob
            .exists(&paths::merged_key(&fx.job.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn empty_partials_are_skipped_but_counted() {
        let fx = fixture(2).await;
        complete_chunk(&fx, 0, &[]).await;
        complete_chunk(&fx, 1, &rows_for(1)).await;

        let outcome = fx.reducer.reduce(&fx.job.id).await.unwrap();
        let ReduceOutcome::Merged(merged) = outcome else {
            panic!("expected merge, got {outcome:?}");
        };
        assert_eq!(merged.row_count, 2);
        assert_eq!(merged.column_count, 2);
    }

    #[tokio::test]
    async fn mismatched_partial_columns_error() {
        let fx = fixture(2).await;
        complete_chunk(&fx, 0, &[Row::new("a", vec![1.0])]).await;
        complete_chunk(&fx, 1, &rows_for(1)).await;

        let result = fx.reducer.reduce(&fx.job.id).await;
        assert!(matches!(result, Err(Error::Storage { .. })));
    }
}
