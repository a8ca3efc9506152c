//! Client-visible request tracking.
//!
//! A request captures one filter+merge ask: which matrices, which
//! predicate, and where the client can poll for the outcome. Requests are
//! never deleted; the terminal record is retained for client polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::{JobId, MatrixId, RequestId};

use crate::error::{Error, Result};
use crate::predicate::PredicateSpec;

/// Request state machine states.
///
/// Clients only ever observe `Created → InProgress → {Complete, Failed}`.
/// The direct `Created → {Complete, Failed}` edges exist for degenerate
/// jobs that settle before the driver records `InProgress` (an all-empty
/// submission, or every dispatch failing terminally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Accepted; planning and dispatch underway.
    Created,
    /// All dispatches attempted; chunks executing.
    InProgress,
    /// Merged matrix written; result location recorded.
    Complete,
    /// One or more chunks failed terminally; reason recorded.
    Failed,
}

impl RequestState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::InProgress | Self::Complete | Self::Failed),
            Self::InProgress => matches!(target, Self::Complete | Self::Failed),
            Self::Complete | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl Default for RequestState {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A client-visible filter+merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Unique request identifier.
    pub id: RequestId,
    /// Input matrices, in submission order.
    pub matrix_ids: Vec<MatrixId>,
    /// The filter predicate to apply to every row.
    pub predicate: PredicateSpec,
    /// Current state of the request.
    pub state: RequestState,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When dispatch finished (state left `Created`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the request reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Storage key of the merged matrix (if complete).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
    /// Failure reason enumerating failed chunks (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// The job created for this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl Request {
    /// Creates a new request in `Created` state.
    #[must_use]
    pub fn new(matrix_ids: Vec<MatrixId>, predicate: PredicateSpec) -> Self {
        Self {
            id: RequestId::generate(),
            matrix_ids,
            predicate,
            state: RequestState::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_location: None,
            failure_reason: None,
            job_id: None,
        }
    }

    /// Returns true if the request is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to a new state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid; in particular, a
    /// terminal state is written at most once and never overwritten.
    #[tracing::instrument(skip(self), fields(request_id = %self.id, from = %self.state, to = %target))]
    pub fn transition_to(&mut self, target: RequestState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "invalid request state transition".into(),
            });
        }

        let now = Utc::now();
        match target {
            RequestState::InProgress => {
                self.started_at = Some(now);
            }
            RequestState::Complete | RequestState::Failed => {
                self.completed_at = Some(now);
            }
            RequestState::Created => {}
        }

        self.state = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> Request {
        Request::new(
            vec![MatrixId::new("m").unwrap()],
            PredicateSpec::SelectAll,
        )
    }

    #[test]
    fn request_starts_created() {
        let request = test_request();
        assert_eq!(request.state, RequestState::Created);
        assert!(!request.is_terminal());
    }

    #[test]
    fn happy_path_transitions() -> Result<()> {
        let mut request = test_request();
        request.transition_to(RequestState::InProgress)?;
        assert!(request.started_at.is_some());

        request.transition_to(RequestState::Complete)?;
        assert!(request.completed_at.is_some());
        assert!(request.is_terminal());
        Ok(())
    }

    #[test]
    fn terminal_status_written_at_most_once() -> Result<()> {
        let mut request = test_request();
        request.transition_to(RequestState::InProgress)?;
        request.transition_to(RequestState::Failed)?;

        // A second terminal write is rejected, both to the same state and
        // to a different one.
        assert!(request.transition_to(RequestState::Failed).is_err());
        assert!(request.transition_to(RequestState::Complete).is_err());
        assert_eq!(request.state, RequestState::Failed);
        Ok(())
    }

    #[test]
    fn degenerate_requests_may_settle_from_created() {
        assert!(RequestState::Created.can_transition_to(RequestState::Complete));
        assert!(RequestState::Created.can_transition_to(RequestState::Failed));
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = test_request();
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"matrixIds\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"CREATED\""));
    }
}
