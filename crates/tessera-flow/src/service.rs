//! In-process pipeline facade.
//!
//! `PipelineService` wires the driver, worker, and reducer over a shared
//! state store, staging backend, and work queue. It exposes the intake
//! surface the (out-of-scope) API layer consumes, `submit` and
//! `get_status`, plus an in-process pump that drains the work queue the
//! way a fleet of stateless workers would, used by the demo binary and
//! the integration tests.
//!
//! In a deployed system the queue's consumer side is the hosting
//! platform's concern (each delivery invokes one worker); the pump exists
//! so the whole pipeline can run inside one process with identical
//! semantics, redelivery included.

use std::sync::Arc;

use chrono::Utc;

use tessera_core::{ChunkedMatrixStore, MatrixId, RequestId, StorageBackend};

use crate::config::FlowConfig;
use crate::dispatch::WorkQueue;
use crate::dispatch::memory::InMemoryWorkQueue;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::events::{InMemoryOutbox, PipelineEvent};
use crate::predicate::PredicateSpec;
use crate::reducer::Reducer;
use crate::request::RequestState;
use crate::store::StateStore;
use crate::store::memory::InMemoryStateStore;
use crate::worker::Worker;

/// Client-visible status of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Current request state.
    pub state: RequestState,
    /// Storage key of the merged matrix (if complete).
    pub result_location: Option<String>,
    /// Failure reason (if failed).
    pub failure_reason: Option<String>,
}

/// An in-process assembly of the whole pipeline.
pub struct PipelineService {
    store: Arc<dyn StateStore>,
    queue: Arc<InMemoryWorkQueue>,
    outbox: Arc<InMemoryOutbox>,
    driver: Driver,
    worker: Worker,
}

impl PipelineService {
    /// Builds a fully in-memory pipeline over the given matrix store and
    /// blob backend.
    #[must_use]
    pub fn in_memory(
        matrices: Arc<dyn ChunkedMatrixStore>,
        blob: Arc<dyn StorageBackend>,
        config: FlowConfig,
    ) -> Self {
        let store: Arc<InMemoryStateStore> = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new("tessera-chunks"));
        let outbox = Arc::new(InMemoryOutbox::new());
        let reducer = Arc::new(Reducer::new(store.clone(), blob.clone(), outbox.clone()));

        let driver = Driver::new(
            store.clone(),
            matrices.clone(),
            queue.clone(),
            reducer.clone(),
            outbox.clone(),
            config.clone(),
        );
        let worker = Worker::new(
            store.clone(),
            matrices,
            blob,
            reducer,
            outbox.clone(),
            config,
        );

        Self {
            store,
            queue,
            outbox,
            driver,
            worker,
        }
    }

    /// Accepts a filter request. See [`Driver::submit`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for invalid submissions.
    pub async fn submit(
        &self,
        matrix_ids: Vec<MatrixId>,
        predicate: PredicateSpec,
    ) -> Result<RequestId> {
        self.driver.submit(matrix_ids, predicate).await
    }

    /// Returns the client-visible status of a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown request ID.
    pub async fn get_status(&self, request_id: &RequestId) -> Result<StatusReport> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;
        Ok(StatusReport {
            state: request.state,
            result_location: request.result_location,
            failure_reason: request.failure_reason,
        })
    }

    /// Drains the work queue until the request settles, re-dispatching
    /// parked chunks between rounds.
    ///
    /// # Errors
    ///
    /// Returns an error if the request does not exist, a worker hits an
    /// orchestration-level failure, or the pipeline fails to settle within
    /// the step budget (which would indicate a livelock bug).
    pub async fn run_until_settled(&self, request_id: &RequestId) -> Result<StatusReport> {
        const MAX_STEPS: u32 = 10_000;

        let mut steps = 0;
        loop {
            while let Some(entry) = self.queue.take()? {
                steps += 1;
                if steps > MAX_STEPS {
                    return Err(Error::Core(tessera_core::Error::Internal {
                        message: "pipeline did not settle within the step budget".into(),
                    }));
                }
                self.worker.process_chunk(&entry.envelope).await?;
            }

            let status = self.get_status(request_id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }

            let request = self
                .store
                .get_request(request_id)
                .await?
                .ok_or(Error::RequestNotFound {
                    request_id: *request_id,
                })?;
            let Some(job_id) = request.job_id else {
                return Err(Error::Core(tessera_core::Error::Internal {
                    message: "non-terminal request has no job".into(),
                }));
            };

            let redispatched = self.driver.redispatch(&job_id, Utc::now()).await?;
            if redispatched == 0 && self.queue.queue_depth().await? == 0 {
                return Err(Error::Core(tessera_core::Error::Internal {
                    message: "pipeline stalled: no work queued and nothing to redispatch".into(),
                }));
            }
        }
    }

    /// Runs the redelivery sweep for a request's job. See
    /// [`Driver::redispatch`].
    ///
    /// # Errors
    ///
    /// Returns an error if the request or job does not exist.
    pub async fn redispatch(&self, request_id: &RequestId) -> Result<u32> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;
        let Some(job_id) = request.job_id else {
            return Ok(0);
        };
        self.driver.redispatch(&job_id, Utc::now()).await
    }

    /// Returns the lifecycle events emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.outbox.events()
    }

    /// The state store backing this assembly (for inspection in tests).
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The worker (for driving individual deliveries in tests).
    #[must_use]
    pub const fn worker(&self) -> &Worker {
        &self.worker
    }

    /// The work queue (for inspecting or draining deliveries in tests).
    #[must_use]
    pub fn queue(&self) -> &Arc<InMemoryWorkQueue> {
        &self.queue
    }
}
