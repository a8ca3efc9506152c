//! Pipeline lifecycle events.
//!
//! Completion detection in the pipeline is event-driven: each component
//! emits an event at every durable transition, and the in-process wiring
//! reacts to those events rather than polling. Envelopes follow the
//! `CloudEvents` v1.0 attribute shape so they can be forwarded to any
//! event streaming system unchanged.
//!
//! ## Why ULID for Event IDs
//!
//! ULIDs sort chronologically when compared as strings, which keeps an
//! appended event log in time order with no separate timestamp sort key.
//!
//! ## Idempotency
//!
//! Events carry an `idempotency_key` derived from the event's identity
//! (request/chunk ID plus attempt where relevant), so duplicate emissions
//! from at-least-once execution represent the same logical event and can
//! be deduplicated downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use ulid::Ulid;

use tessera_core::{ChunkId, JobId, RequestId};

use crate::chunk::ChunkState;
use crate::request::RequestState;

/// `CloudEvents`-compatible envelope for pipeline events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// Event origin URI.
    pub source: String,
    /// `CloudEvents` specification version.
    pub specversion: String,
    /// Event type, e.g. `tessera.flow.chunk_completed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event timestamp.
    pub time: DateTime<Utc>,
    /// Idempotency key for deduplication.
    pub idempotency_key: String,
    /// Event payload.
    pub data: PipelineEventData,
}

impl PipelineEvent {
    /// Creates a new event envelope with auto-generated ID and timestamp.
    #[must_use]
    pub fn new(data: PipelineEventData) -> Self {
        let id = Ulid::new().to_string();
        Self {
            source: "/tessera/flow".into(),
            specversion: "1.0".into(),
            event_type: format!("tessera.flow.{}", data.event_name()),
            time: Utc::now(),
            idempotency_key: data.idempotency_key(),
            id,
            data,
        }
    }
}

/// Pipeline event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PipelineEventData {
    /// A request was accepted and persisted.
    RequestCreated {
        /// Request identifier.
        request_id: RequestId,
    },
    /// All dispatches for a request were attempted.
    RequestStarted {
        /// Request identifier.
        request_id: RequestId,
    },
    /// A chunk work unit was enqueued.
    ChunkDispatched {
        /// Owning job.
        job_id: JobId,
        /// Chunk identifier.
        chunk_id: ChunkId,
        /// Attempt number this dispatch represents.
        attempt: u32,
    },
    /// A chunk reached a terminal state.
    ChunkCompleted {
        /// Owning job.
        job_id: JobId,
        /// Chunk identifier.
        chunk_id: ChunkId,
        /// Global chunk index.
        chunk_index: u32,
        /// The terminal state reached.
        state: ChunkState,
        /// The attempt that completed.
        attempt: u32,
    },
    /// A reducer claimed a settled job.
    ReductionClaimed {
        /// The claimed job.
        job_id: JobId,
    },
    /// A request reached a terminal state.
    RequestCompleted {
        /// Request identifier.
        request_id: RequestId,
        /// The terminal state reached.
        state: RequestState,
    },
}

impl PipelineEventData {
    /// Returns the event name used in the envelope's type field.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. } => "request_created",
            Self::RequestStarted { .. } => "request_started",
            Self::ChunkDispatched { .. } => "chunk_dispatched",
            Self::ChunkCompleted { .. } => "chunk_completed",
            Self::ReductionClaimed { .. } => "reduction_claimed",
            Self::RequestCompleted { .. } => "request_completed",
        }
    }

    /// Returns a deterministic idempotency key for the logical event.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::RequestCreated { request_id } => format!("request-created:{request_id}"),
            Self::RequestStarted { request_id } => format!("request-started:{request_id}"),
            Self::ChunkDispatched {
                chunk_id, attempt, ..
            } => format!("chunk-dispatched:{chunk_id}:{attempt}"),
            Self::ChunkCompleted {
                chunk_id, attempt, ..
            } => format!("chunk-completed:{chunk_id}:{attempt}"),
            Self::ReductionClaimed { job_id } => format!("reduction-claimed:{job_id}"),
            Self::RequestCompleted { request_id, state } => {
                format!("request-completed:{request_id}:{state}")
            }
        }
    }
}

/// A sink for pipeline events.
///
/// Implementations decide when and how to persist or forward events; the
/// emitting components only push.
pub trait EventSink: Send + Sync {
    /// Records an event.
    fn push(&self, event: PipelineEvent);
}

/// In-memory outbox for collecting pipeline events.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    events: Mutex<Vec<PipelineEvent>>,
}

impl InMemoryOutbox {
    /// Creates a new empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drains the outbox, returning all events in insertion order.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for InMemoryOutbox {
    fn push(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// A sink that drops every event.
///
/// Useful where a caller has no interest in the event stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn push(&self, _event: PipelineEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_cloudevents_attributes() {
        let request_id = RequestId::generate();
        let event = PipelineEvent::new(PipelineEventData::RequestCreated { request_id });

        assert_eq!(event.specversion, "1.0");
        assert_eq!(event.source, "/tessera/flow");
        assert_eq!(event.event_type, "tessera.flow.request_created");
        assert_eq!(
            event.idempotency_key,
            format!("request-created:{request_id}")
        );
    }

    #[test]
    fn idempotency_keys_distinguish_attempts() {
        let job_id = JobId::generate();
        let chunk_id = ChunkId::generate();

        let first = PipelineEventData::ChunkCompleted {
            job_id,
            chunk_id,
            chunk_index: 0,
            state: ChunkState::Done,
            attempt: 1,
        };
        let second = PipelineEventData::ChunkCompleted {
            job_id,
            chunk_id,
            chunk_index: 0,
            state: ChunkState::Done,
            attempt: 2,
        };
        assert_ne!(first.idempotency_key(), second.idempotency_key());
    }

    #[test]
    fn outbox_collects_in_order() {
        let outbox = InMemoryOutbox::new();
        let a = RequestId::generate();
        let b = RequestId::generate();

        outbox.push(PipelineEvent::new(PipelineEventData::RequestCreated {
            request_id: a,
        }));
        outbox.push(PipelineEvent::new(PipelineEventData::RequestStarted {
            request_id: b,
        }));

        let events = outbox.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "tessera.flow.request_created");
        assert_eq!(events[1].event_type, "tessera.flow.request_started");
        assert!(outbox.events().is_empty());
    }

    #[test]
    fn envelope_serializes() {
        let event = PipelineEvent::new(PipelineEventData::ReductionClaimed {
            job_id: JobId::generate(),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tessera.flow.reduction_claimed\""));

        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.idempotency_key, event.idempotency_key);
    }
}
