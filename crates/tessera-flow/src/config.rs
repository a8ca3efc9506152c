//! Pipeline configuration.
//!
//! All knobs here are tunables, not correctness parameters: the partition
//! and completion invariants hold for any chunk size ≥ 1 and any attempt
//! bound ≥ 1 (exercised across values in the test suite).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default rows per planned chunk.
const DEFAULT_TARGET_CHUNK_ROWS: u64 = 2_000;

/// Default maximum worker attempts per chunk.
const DEFAULT_MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Default enqueue attempts per chunk at dispatch time.
const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 3;

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    /// Target rows per chunk. The last chunk of a matrix may be smaller.
    #[serde(default = "default_target_chunk_rows")]
    pub target_chunk_rows: u64,

    /// Maximum worker attempts per chunk before a transient failure is
    /// treated as terminal.
    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,

    /// Maximum enqueue attempts per chunk at dispatch time.
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,

    /// Base backoff between dispatch retries; doubled per attempt.
    #[serde(with = "humantime_serde", default = "default_dispatch_backoff")]
    pub dispatch_backoff: Duration,

    /// How long a chunk may sit in `Running` before the redispatch sweep
    /// reclaims it as a transient failure.
    #[serde(with = "humantime_serde", default = "default_reclaim_timeout")]
    pub reclaim_timeout: Duration,
}

fn default_target_chunk_rows() -> u64 {
    DEFAULT_TARGET_CHUNK_ROWS
}

fn default_max_chunk_attempts() -> u32 {
    DEFAULT_MAX_CHUNK_ATTEMPTS
}

fn default_max_dispatch_attempts() -> u32 {
    DEFAULT_MAX_DISPATCH_ATTEMPTS
}

fn default_dispatch_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_reclaim_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            target_chunk_rows: default_target_chunk_rows(),
            max_chunk_attempts: default_max_chunk_attempts(),
            max_dispatch_attempts: default_max_dispatch_attempts(),
            dispatch_backoff: default_dispatch_backoff(),
            reclaim_timeout: default_reclaim_timeout(),
        }
    }
}

impl FlowConfig {
    /// Sets the target rows per chunk.
    #[must_use]
    pub const fn with_target_chunk_rows(mut self, rows: u64) -> Self {
        self.target_chunk_rows = rows;
        self
    }

    /// Sets the maximum worker attempts per chunk.
    #[must_use]
    pub const fn with_max_chunk_attempts(mut self, attempts: u32) -> Self {
        self.max_chunk_attempts = attempts;
        self
    }

    /// Sets the maximum enqueue attempts per chunk.
    #[must_use]
    pub const fn with_max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts;
        self
    }

    /// Sets the reclaim timeout for stuck `Running` chunks.
    #[must_use]
    pub const fn with_reclaim_timeout(mut self, timeout: Duration) -> Self {
        self.reclaim_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if any bound is zero.
    pub fn validate(&self) -> Result<()> {
        if self.target_chunk_rows == 0 {
            return Err(Error::invalid_request("targetChunkRows must be at least 1"));
        }
        if self.max_chunk_attempts == 0 {
            return Err(Error::invalid_request("maxChunkAttempts must be at least 1"));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(Error::invalid_request(
                "maxDispatchAttempts must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FlowConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_chunk_rows_rejected() {
        let config = FlowConfig::default().with_target_chunk_rows(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = FlowConfig::default().with_max_chunk_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_deserialize_from_humantime() {
        let config: FlowConfig = serde_json::from_str(
            r#"{"targetChunkRows": 500, "reclaimTimeout": "90s", "dispatchBackoff": "50ms"}"#,
        )
        .unwrap();
        assert_eq!(config.target_chunk_rows, 500);
        assert_eq!(config.reclaim_timeout, Duration::from_secs(90));
        assert_eq!(config.dispatch_backoff, Duration::from_millis(50));
        // Unspecified fields fall back to defaults
        assert_eq!(config.max_chunk_attempts, 3);
    }
}
