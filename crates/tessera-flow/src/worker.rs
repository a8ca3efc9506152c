//! The mapper stage: one stateless invocation per chunk.
//!
//! A worker invocation claims its chunk through a compare-and-swap, reads
//! the row range, applies the predicate, stages the filtered subset under
//! a deterministic key, and reports completion through the atomic tally.
//! Invocations arrive at-least-once; every effect is guarded:
//!
//! - the `Pending|FailedRetryable → Running` CAS makes duplicate
//!   deliveries no-ops
//! - the attempt guard makes completions from superseded attempts no-ops
//! - the staging write is overwrite-idempotent by key
//!
//! Failure classification is strict: only a store outage
//! (`Error::Unavailable`) is transient. Everything else (missing data,
//! corrupt frames, structural predicate errors) fails the chunk
//! permanently.

use std::sync::Arc;
use std::time::Instant;

use tessera_core::matrix::encode_rows;
use tessera_core::{ChunkedMatrixStore, StorageBackend};

use crate::chunk::{ChunkState, PartialResult, TransitionReason};
use crate::config::FlowConfig;
use crate::dispatch::ChunkEnvelope;
use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::job::{ChunkTerminalOutcome, CompletionTally};
use crate::metrics;
use crate::paths;
use crate::reducer::Reducer;
use crate::store::{CasResult, StateStore};

/// Outcome of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Partial result staged; completion recorded.
    Done {
        /// Post-increment job tally.
        tally: CompletionTally,
    },
    /// The invocation was a duplicate or stale delivery; nothing changed.
    Duplicate,
    /// Transient failure; the chunk is parked for redelivery.
    Retryable {
        /// The attempt that failed.
        attempt: u32,
    },
    /// Permanent failure recorded.
    Failed {
        /// Post-increment job tally.
        tally: CompletionTally,
    },
}

/// How a chunk-processing failure should be handled.
enum FailureKind {
    /// Worth re-running: the store was unreachable.
    Transient(String),
    /// Never re-run: the chunk itself is bad.
    Permanent(TransitionReason, String),
}

fn classify(error: &Error) -> FailureKind {
    if error.is_transient() {
        FailureKind::Transient(error.to_string())
    } else {
        FailureKind::Permanent(TransitionReason::CorruptData, error.to_string())
    }
}

/// The worker: processes one chunk per invocation.
pub struct Worker {
    store: Arc<dyn StateStore>,
    matrices: Arc<dyn ChunkedMatrixStore>,
    staging: Arc<dyn StorageBackend>,
    reducer: Arc<Reducer>,
    outbox: Arc<dyn EventSink>,
    config: FlowConfig,
}

impl Worker {
    /// Creates a new worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        matrices: Arc<dyn ChunkedMatrixStore>,
        staging: Arc<dyn StorageBackend>,
        reducer: Arc<Reducer>,
        outbox: Arc<dyn EventSink>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store,
            matrices,
            staging,
            reducer,
            outbox,
            config,
        }
    }

    /// Processes one chunk delivery.
    ///
    /// Idempotent under at-least-once delivery: a duplicate or stale
    /// invocation returns [`ChunkOutcome::Duplicate`] without touching any
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error only for orchestration-level problems (unknown
    /// chunk, state store failure). Chunk-level failures are absorbed into
    /// the chunk's state per the failure taxonomy.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            job_id = %envelope.job_id,
            chunk_id = %envelope.chunk_id,
            chunk_index = envelope.chunk_index,
            attempt = envelope.attempt
        )
    )]
    pub async fn process_chunk(&self, envelope: &ChunkEnvelope) -> Result<ChunkOutcome> {
        let claim_reason = if envelope.attempt > 1 {
            TransitionReason::RetryStarted
        } else {
            TransitionReason::Started
        };
        let claimed = self
            .store
            .transition_chunk(
                &envelope.job_id,
                &envelope.chunk_id,
                &[ChunkState::Pending, ChunkState::FailedRetryable],
                ChunkState::Running,
                claim_reason,
                envelope.attempt,
                None,
            )
            .await?;

        match claimed {
            CasResult::Success => {}
            CasResult::NotFound => {
                return Err(Error::ChunkNotFound {
                    job_id: envelope.job_id,
                    chunk_id: envelope.chunk_id,
                });
            }
            CasResult::StateMismatch { actual } => {
                tracing::debug!(%actual, "duplicate delivery; chunk already claimed or terminal");
                return Ok(ChunkOutcome::Duplicate);
            }
            CasResult::StaleAttempt { actual } => {
                tracing::debug!(actual, "stale delivery; a newer attempt owns this chunk");
                return Ok(ChunkOutcome::Duplicate);
            }
        }

        // The claim may have bumped the attempt (FailedRetryable → Running);
        // all subsequent CAS calls must carry the record's current attempt.
        let attempt = self
            .store
            .get_chunk(&envelope.job_id, &envelope.chunk_id)
            .await?
            .ok_or(Error::ChunkNotFound {
                job_id: envelope.job_id,
                chunk_id: envelope.chunk_id,
            })?
            .attempt;

        let start = Instant::now();
        let result = self.execute(envelope).await;
        metrics::observe_chunk_duration(start.elapsed().as_secs_f64());

        match result {
            Ok(partial) => self.record_success(envelope, attempt, partial).await,
            Err(failure) => self.record_failure(envelope, attempt, failure).await,
        }
    }

    /// Reads, filters, and stages the chunk's rows.
    async fn execute(&self, envelope: &ChunkEnvelope) -> std::result::Result<PartialResult, FailureKind> {
        let meta = self
            .matrices
            .meta(&envelope.matrix_id)
            .await
            .map_err(|e| classify(&e.into()))?;

        let predicate = envelope.predicate.bind(&meta).map_err(|e| {
            FailureKind::Permanent(TransitionReason::StructuralPredicateFailure, e.to_string())
        })?;

        let rows = self
            .matrices
            .read_rows(&envelope.matrix_id, envelope.row_range.as_range())
            .await
            .map_err(|e| classify(&e.into()))?;

        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            match predicate.evaluate(&row) {
                Ok(true) => kept.push(row),
                Ok(false) => {}
                Err(error) if error.is_structural() => {
                    return Err(FailureKind::Permanent(
                        TransitionReason::StructuralPredicateFailure,
                        error.to_string(),
                    ));
                }
                Err(error) => {
                    // A single bad row never fails the whole chunk.
                    tracing::warn!(row_id = %row.id, %error, "excluding row from result");
                }
            }
        }

        let data = encode_rows(&kept).map_err(|e| classify(&e.into()))?;
        let staging_key = paths::staging_key(&envelope.job_id, envelope.chunk_index);
        let byte_size = data.len() as u64;
        self.staging
            .put(&staging_key, data)
            .await
            .map_err(|e| classify(&e.into()))?;

        Ok(PartialResult {
            chunk_id: envelope.chunk_id,
            job_id: envelope.job_id,
            chunk_index: envelope.chunk_index,
            staging_key,
            row_count: kept.len() as u64,
            byte_size,
            column_count: kept.first().map_or(0, |r| r.values.len() as u32),
        })
    }

    async fn record_success(
        &self,
        envelope: &ChunkEnvelope,
        attempt: u32,
        partial: PartialResult,
    ) -> Result<ChunkOutcome> {
        self.store.put_partial_result(&partial).await?;

        let cas = self
            .store
            .transition_chunk(
                &envelope.job_id,
                &envelope.chunk_id,
                &[ChunkState::Running],
                ChunkState::Done,
                TransitionReason::Succeeded,
                attempt,
                None,
            )
            .await?;
        if !cas.is_success() {
            // A reclaim raced us and a newer attempt owns the chunk. The
            // staged write is harmless: the retry overwrites the same key.
            tracing::debug!(?cas, "lost completion race; dropping result");
            return Ok(ChunkOutcome::Duplicate);
        }

        metrics::record_chunk_terminal("done");
        let tally = self
            .store
            .increment_completion(&envelope.job_id, ChunkTerminalOutcome::Done)
            .await?;
        self.emit_completed(envelope, ChunkState::Done, attempt);
        tracing::info!(rows = partial.row_count, "chunk done ({tally})");

        self.maybe_reduce(envelope, &tally).await?;
        Ok(ChunkOutcome::Done { tally })
    }

    async fn record_failure(
        &self,
        envelope: &ChunkEnvelope,
        attempt: u32,
        failure: FailureKind,
    ) -> Result<ChunkOutcome> {
        match failure {
            FailureKind::Transient(message) if attempt < self.config.max_chunk_attempts => {
                let cas = self
                    .store
                    .transition_chunk(
                        &envelope.job_id,
                        &envelope.chunk_id,
                        &[ChunkState::Running],
                        ChunkState::FailedRetryable,
                        TransitionReason::TransientFailure,
                        attempt,
                        Some(message.clone()),
                    )
                    .await?;
                if !cas.is_success() {
                    return Ok(ChunkOutcome::Duplicate);
                }
                metrics::record_chunk_terminal("failed_retryable");
                tracing::warn!(%message, attempt, "transient chunk failure; awaiting redelivery");
                Ok(ChunkOutcome::Retryable { attempt })
            }
            FailureKind::Transient(message) => {
                self.fail_terminally(
                    envelope,
                    attempt,
                    TransitionReason::AttemptsExhausted,
                    format!("{message} (after {attempt} attempts)"),
                )
                .await
            }
            FailureKind::Permanent(reason, message) => {
                self.fail_terminally(envelope, attempt, reason, message).await
            }
        }
    }

    async fn fail_terminally(
        &self,
        envelope: &ChunkEnvelope,
        attempt: u32,
        reason: TransitionReason,
        message: String,
    ) -> Result<ChunkOutcome> {
        let cas = self
            .store
            .transition_chunk(
                &envelope.job_id,
                &envelope.chunk_id,
                &[ChunkState::Running],
                ChunkState::FailedTerminal,
                reason,
                attempt,
                Some(message.clone()),
            )
            .await?;
        if !cas.is_success() {
            return Ok(ChunkOutcome::Duplicate);
        }

        metrics::record_chunk_terminal("failed_terminal");
        let tally = self
            .store
            .increment_completion(&envelope.job_id, ChunkTerminalOutcome::Failed)
            .await?;
        self.emit_completed(envelope, ChunkState::FailedTerminal, attempt);
        tracing::error!(%reason, %message, "chunk failed terminally ({tally})");

        self.maybe_reduce(envelope, &tally).await?;
        Ok(ChunkOutcome::Failed { tally })
    }

    /// Event-driven fan-in: the completion that settles the tally triggers
    /// the reducer. The reduction claim makes concurrent triggers safe.
    async fn maybe_reduce(&self, envelope: &ChunkEnvelope, tally: &CompletionTally) -> Result<()> {
        if tally.is_settled() {
            let outcome = self.reducer.reduce(&envelope.job_id).await?;
            tracing::debug!(?outcome, "settled tally triggered reduction");
        }
        Ok(())
    }

    fn emit_completed(&self, envelope: &ChunkEnvelope, state: ChunkState, attempt: u32) {
        self.outbox.push(PipelineEvent::new(
            PipelineEventData::ChunkCompleted {
                job_id: envelope.job_id,
                chunk_id: envelope.chunk_id,
                chunk_index: envelope.chunk_index,
                state,
                attempt,
            },
        ));
    }
}
