//! Deterministic storage keys for staging and final output.
//!
//! Every key is a pure function of plan-time identity, which is what makes
//! duplicate writes from at-least-once delivery overwrite-idempotent.

use tessera_core::JobId;

/// Staging key for one chunk's partial result.
#[must_use]
pub fn staging_key(job_id: &JobId, chunk_index: u32) -> String {
    format!("{job_id}/{chunk_index}")
}

/// Final key for a job's merged matrix.
#[must_use]
pub fn merged_key(job_id: &JobId) -> String {
    format!("{job_id}/merged")
}

/// Staging prefix covering all of a job's partial results.
#[must_use]
pub fn staging_prefix(job_id: &JobId) -> String {
    format!("{job_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn keys_are_stable() {
        let job_id = JobId::from_str("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        assert_eq!(
            staging_key(&job_id, 3),
            "01ARZ3NDEKTSV4RRFFQ69G5FAV/3"
        );
        assert_eq!(
            merged_key(&job_id),
            "01ARZ3NDEKTSV4RRFFQ69G5FAV/merged"
        );
    }

    #[test]
    fn merged_key_lives_under_the_staging_prefix() {
        let job_id = JobId::generate();
        assert!(merged_key(&job_id).starts_with(&staging_prefix(&job_id)));
    }
}
