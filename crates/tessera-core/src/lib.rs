//! # tessera-core
//!
//! Core abstractions for the Tessera matrix filter/merge pipeline.
//!
//! This crate provides the foundational types used across all Tessera
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for requests, jobs, and chunks
//! - **Storage**: The blob-storage abstraction for staging and final output
//! - **Matrices**: The chunked, read-only matrix store and row codec
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `tessera-core` is the only crate allowed to define shared primitives.
//! The orchestration engine (`tessera-flow`) depends on this crate and
//! never the other way around.
//!
//! ## Example
//!
//! ```rust
//! use tessera_core::prelude::*;
//!
//! let request_id = RequestId::generate();
//! let matrix_id = MatrixId::new("pbmc-10k").unwrap();
//! # let _ = (request_id, matrix_id);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod matrix;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tessera_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ChunkId, JobId, MatrixId, RequestId};
    pub use crate::matrix::{ChunkedMatrixStore, MatrixMeta, Row, StoredMatrixStore};
    pub use crate::storage::{MemoryBackend, ObjectMeta, StorageBackend};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{ChunkId, JobId, MatrixId, RequestId};
pub use matrix::{ChunkedMatrixStore, MatrixMeta, Row, StoredMatrixStore};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend};
