//! Error types and result aliases for Tessera.
//!
//! This module defines the shared error types used across all Tessera
//! components. Errors are structured for programmatic handling: the
//! pipeline's retry decisions hinge on the distinction between
//! [`Error::Unavailable`] (transient) and [`Error::Corrupt`] (permanent).

use std::fmt;

/// The result type used throughout Tessera.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tessera core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A backing store is temporarily unreachable. Safe to retry.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// Stored data failed to decode. Never retried.
    #[error("corrupt data at {key}: {message}")]
    Corrupt {
        /// The storage key holding the corrupt bytes.
        key: String,
        /// Description of the decode failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
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

    /// Creates a new unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new corrupt-data error.
    #[must_use]
    pub fn corrupt(key: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
