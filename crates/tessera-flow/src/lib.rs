//! # tessera-flow
//!
//! Map-reduce orchestration engine for the Tessera matrix filter/merge
//! pipeline.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **Deterministic Planning**: Row-range chunk plans fixed before any
//!   work is dispatched
//! - **Fan-out Execution**: Stateless, at-least-once worker invocations
//!   coordinated only through the state store
//! - **State Machine**: Compare-and-swap chunk and request transitions
//! - **Deterministic Fan-in**: Exactly-once reduction merging partial
//!   results in chunk-index order
//!
//! ## Core Concepts
//!
//! - **Request**: One client-visible ask: filter these matrices, merge
//!   the survivors into one output
//! - **Job**: The internal accounting unit for a request, holding the
//!   completion tallies the reducer keys off
//! - **Chunk**: One contiguous row range of one input matrix, the unit of
//!   parallel work
//!
//! ## Guarantees
//!
//! - **Deterministic**: Output row order depends only on the chunk plan,
//!   never on worker completion timing
//! - **Idempotent**: Duplicate deliveries and late retries are absorbed by
//!   CAS transitions and deterministic storage keys
//! - **All-or-nothing**: A partially failed job surfaces as `Failed`;
//!   a partial merge is never exposed as success
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_core::{MatrixId, MemoryBackend, StoredMatrixStore};
//! use tessera_flow::config::FlowConfig;
//! use tessera_flow::error::Result;
//! use tessera_flow::predicate::PredicateSpec;
//! use tessera_flow::service::PipelineService;
//!
//! # async fn demo() -> Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let matrices = Arc::new(StoredMatrixStore::new(backend.clone()));
//! let service = PipelineService::in_memory(matrices, backend, FlowConfig::default());
//!
//! let request_id = service
//!     .submit(
//!         vec![MatrixId::new("pbmc-10k")?],
//!         PredicateSpec::ColumnAtLeast { column: "GENE_A".into(), threshold: 1.0 },
//!     )
//!     .await?;
//! service.run_until_settled(&request_id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod paths;
pub mod plan;
pub mod predicate;
pub mod reducer;
pub mod request;
pub mod service;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::chunk::{ChunkRecord, ChunkState, TransitionReason};
    pub use crate::config::FlowConfig;
    pub use crate::dispatch::memory::InMemoryWorkQueue;
    pub use crate::dispatch::{ChunkEnvelope, EnqueueResult, WorkQueue};
    pub use crate::driver::Driver;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSink, InMemoryOutbox, PipelineEvent};
    pub use crate::job::{CompletionTally, Job};
    pub use crate::plan::{ChunkPlan, ChunkSpec, RowRange};
    pub use crate::predicate::{PredicateSpec, RowPredicate};
    pub use crate::reducer::Reducer;
    pub use crate::request::{Request, RequestState};
    pub use crate::service::{PipelineService, StatusReport};
    pub use crate::store::memory::InMemoryStateStore;
    pub use crate::store::{CasResult, StateStore};
    pub use crate::worker::{ChunkOutcome, Worker};
}
