//! Deterministic chunk planning.
//!
//! A chunk plan partitions each input matrix's row span into contiguous
//! ranges and assigns every range a global chunk index. Plans are:
//!
//! - **Total**: the union of a matrix's ranges is exactly its row span,
//!   each row covered once (no gaps, no overlaps)
//! - **Deterministic**: same matrices, same row counts, and same chunk
//!   size always produce the same ranges and the same fingerprint
//! - **Fixed before execution**: the plan is persisted in full before any
//!   chunk is dispatched, so the total chunk count never moves under the
//!   completion accounting
//!
//! The global chunk index runs matrix-then-range in submission order,
//! which is exactly the row order of the merged output.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tessera_core::{ChunkId, MatrixId};

use crate::error::{Error, Result};

/// A half-open row range `[start, end)` within one matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRange {
    /// First row (inclusive).
    pub start: u64,
    /// Past-the-end row (exclusive).
    pub end: u64,
}

impl RowRange {
    /// Creates a new range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `start > end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::invalid_request(format!(
                "row range start {start} exceeds end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of rows in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if the range holds no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns this range as a `std::ops::Range` for store reads.
    #[must_use]
    pub const fn as_range(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl std::fmt::Display for RowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Specification for a single chunk within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSpec {
    /// Unique chunk identifier, assigned at plan time.
    pub chunk_id: ChunkId,
    /// The matrix this chunk slices.
    pub matrix_id: MatrixId,
    /// Global chunk index: position of this chunk's rows in the merged
    /// output. Assigned once, never reordered.
    pub chunk_index: u32,
    /// The rows this chunk covers.
    pub row_range: RowRange,
}

/// A deterministic chunk plan for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlan {
    /// Chunks ordered by `chunk_index`.
    pub chunks: Vec<ChunkSpec>,
    /// SHA-256 fingerprint over the plan's identity (matrices, ranges,
    /// indexes; not the generated chunk IDs).
    pub fingerprint: String,
}

impl ChunkPlan {
    /// Returns the number of chunks in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if the plan has no chunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Partitions the given matrices into a chunk plan.
///
/// `matrices` pairs each matrix ID with its row count, in submission
/// order. Every matrix is split into `⌈row_count / target_chunk_rows⌉`
/// contiguous ranges; a zero-row matrix contributes no chunks.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if `target_chunk_rows` is zero.
pub fn plan_chunks(matrices: &[(MatrixId, u64)], target_chunk_rows: u64) -> Result<ChunkPlan> {
    if target_chunk_rows == 0 {
        return Err(Error::invalid_request(
            "target chunk size must be at least 1 row",
        ));
    }

    let mut chunks = Vec::new();
    let mut hasher = Sha256::new();
    let mut chunk_index: u32 = 0;

    for (matrix_id, row_count) in matrices {
        let mut start = 0;
        while start < *row_count {
            let end = (start + target_chunk_rows).min(*row_count);
            let row_range = RowRange { start, end };

            // Fingerprint over the plan identity, not the generated IDs.
            hasher.update(matrix_id.as_str().as_bytes());
            hasher.update(chunk_index.to_be_bytes());
            hasher.update(start.to_be_bytes());
            hasher.update(end.to_be_bytes());

            chunks.push(ChunkSpec {
                chunk_id: ChunkId::generate(),
                matrix_id: matrix_id.clone(),
                chunk_index,
                row_range,
            });

            chunk_index = chunk_index
                .checked_add(1)
                .ok_or_else(|| Error::invalid_request("chunk plan exceeds u32 chunk indexes"))?;
            start = end;
        }
    }

    Ok(ChunkPlan {
        chunks,
        fingerprint: format!("{:x}", hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(id: &str, rows: u64) -> (MatrixId, u64) {
        (MatrixId::new(id).unwrap(), rows)
    }

    /// Asserts the partition property: ranges cover the span exactly once.
    fn assert_partitions(plan: &ChunkPlan, matrix_id: &str, row_count: u64) {
        let mut ranges: Vec<RowRange> = plan
            .chunks
            .iter()
            .filter(|c| c.matrix_id.as_str() == matrix_id)
            .map(|c| c.row_range)
            .collect();
        ranges.sort_by_key(|r| r.start);

        let mut cursor = 0;
        for range in &ranges {
            assert_eq!(range.start, cursor, "gap or overlap before {range}");
            assert!(range.end > range.start, "empty range {range} in plan");
            cursor = range.end;
        }
        assert_eq!(cursor, row_count, "ranges do not cover the full span");
    }

    #[test]
    fn partitions_with_even_division() {
        let plan = plan_chunks(&[matrix("m", 10)], 5).unwrap();
        assert_eq!(plan.len(), 2);
        assert_partitions(&plan, "m", 10);
    }

    #[test]
    fn partitions_with_remainder() {
        let plan = plan_chunks(&[matrix("m", 10)], 3).unwrap();
        assert_eq!(plan.len(), 4);
        assert_partitions(&plan, "m", 10);
        assert_eq!(plan.chunks[3].row_range, RowRange { start: 9, end: 10 });
    }

    #[test]
    fn partitions_single_row_and_oversized_chunk() {
        let plan = plan_chunks(&[matrix("m", 1)], 100).unwrap();
        assert_eq!(plan.len(), 1);
        assert_partitions(&plan, "m", 1);
    }

    #[test]
    fn empty_matrix_contributes_no_chunks() {
        let plan = plan_chunks(&[matrix("empty", 0), matrix("m", 3)], 2).unwrap();
        assert_eq!(plan.len(), 2);
        assert_partitions(&plan, "m", 3);
    }

    #[test]
    fn partition_property_across_chunk_sizes() {
        for chunk_size in [1, 2, 3, 7, 100] {
            for rows in [0, 1, 6, 7, 100] {
                let plan = plan_chunks(&[matrix("m", rows)], chunk_size).unwrap();
                assert_partitions(&plan, "m", rows);
            }
        }
    }

    #[test]
    fn indexes_run_matrix_then_range() {
        // Two matrices of 5 and 3 rows, chunk size 2.
        let plan = plan_chunks(&[matrix("a", 5), matrix("b", 3)], 2).unwrap();

        let described: Vec<(&str, u32, u64, u64)> = plan
            .chunks
            .iter()
            .map(|c| {
                (
                    c.matrix_id.as_str(),
                    c.chunk_index,
                    c.row_range.start,
                    c.row_range.end,
                )
            })
            .collect();

        assert_eq!(
            described,
            vec![
                ("a", 0, 0, 2),
                ("a", 1, 2, 4),
                ("a", 2, 4, 5),
                ("b", 3, 0, 2),
                ("b", 4, 2, 3),
            ]
        );
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            plan_chunks(&[matrix("m", 5)], 0),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = plan_chunks(&[matrix("x", 5), matrix("y", 3)], 2).unwrap();
        let b = plan_chunks(&[matrix("x", 5), matrix("y", 3)], 2).unwrap();
        let c = plan_chunks(&[matrix("y", 3), matrix("x", 5)], 2).unwrap();

        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }
}
