//! Filter predicates as a polymorphic capability.
//!
//! The worker stays agnostic to predicate implementation: anything that
//! can answer "does this row pass?" (or raise a structural error) can
//! drive the pipeline. Two layers:
//!
//! - [`PredicateSpec`]: the serializable wire form carried in requests and
//!   work envelopes
//! - [`RowPredicate`]: the bound evaluator a spec compiles to against one
//!   matrix's column metadata
//!
//! The error split mirrors the pipeline's failure taxonomy: a
//! [`PredicateError::Row`] poisons only that row (logged, excluded); a
//! [`PredicateError::Structural`] (unknown column, schema mismatch) fails
//! the whole chunk permanently.

use serde::{Deserialize, Serialize};

use tessera_core::matrix::{MatrixMeta, Row};

/// Errors raised by predicate evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PredicateError {
    /// A single row could not be evaluated. The row is excluded; the chunk
    /// continues.
    #[error("row rejected: {message}")]
    Row {
        /// Why this row could not be evaluated.
        message: String,
    },

    /// The predicate does not fit the matrix (unknown column, schema
    /// mismatch). Fails the whole chunk.
    #[error("structural predicate failure: {message}")]
    Structural {
        /// Why the predicate cannot apply to this matrix.
        message: String,
    },
}

impl PredicateError {
    /// Creates a row-scoped error.
    #[must_use]
    pub fn row(message: impl Into<String>) -> Self {
        Self::Row {
            message: message.into(),
        }
    }

    /// Creates a structural error.
    #[must_use]
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
        }
    }

    /// Returns true if this error fails the whole chunk.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Structural { .. })
    }
}

/// A bound row filter.
///
/// Implementations must be cheap to call per row; binding work (column
/// lookup, validation) happens once in [`PredicateSpec::bind`].
pub trait RowPredicate: Send + Sync + std::fmt::Debug {
    /// Evaluates the predicate against one row.
    ///
    /// # Errors
    ///
    /// Returns [`PredicateError::Row`] to exclude this row only, or
    /// [`PredicateError::Structural`] to fail the chunk.
    fn evaluate(&self, row: &Row) -> Result<bool, PredicateError>;
}

/// Serializable predicate specification.
///
/// This is the wire form: it travels in the request record and in every
/// work envelope, and compiles to a [`RowPredicate`] against a matrix's
/// metadata at chunk-processing time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateSpec {
    /// Keep every row.
    SelectAll,
    /// Keep rows where `column >= threshold`.
    ColumnAtLeast {
        /// Column name to test.
        column: String,
        /// Inclusive lower bound.
        threshold: f64,
    },
    /// Keep rows where `column == value` (exact).
    ColumnEquals {
        /// Column name to test.
        column: String,
        /// Value to match.
        value: f64,
    },
    /// Keep rows with at least `min_positive` strictly positive values.
    AnyExpressed {
        /// Minimum number of positive values.
        min_positive: u32,
    },
}

impl PredicateSpec {
    /// Binds this predicate to a matrix, resolving column references.
    ///
    /// # Errors
    ///
    /// Returns [`PredicateError::Structural`] if a referenced column does
    /// not exist in the matrix.
    pub fn bind(&self, meta: &MatrixMeta) -> Result<Box<dyn RowPredicate>, PredicateError> {
        match self {
            Self::SelectAll => Ok(Box::new(SelectAll)),
            Self::ColumnAtLeast { column, threshold } => Ok(Box::new(ColumnCompare {
                column_index: resolve_column(meta, column)?,
                column_count: meta.columns.len(),
                op: CompareOp::AtLeast,
                operand: *threshold,
            })),
            Self::ColumnEquals { column, value } => Ok(Box::new(ColumnCompare {
                column_index: resolve_column(meta, column)?,
                column_count: meta.columns.len(),
                op: CompareOp::Equals,
                operand: *value,
            })),
            Self::AnyExpressed { min_positive } => Ok(Box::new(AnyExpressed {
                min_positive: *min_positive as usize,
            })),
        }
    }
}

fn resolve_column(meta: &MatrixMeta, column: &str) -> Result<usize, PredicateError> {
    meta.columns
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| {
            PredicateError::structural(format!(
                "column '{column}' not present in matrix '{}'",
                meta.matrix_id
            ))
        })
}

#[derive(Debug)]
struct SelectAll;

impl RowPredicate for SelectAll {
    fn evaluate(&self, _row: &Row) -> Result<bool, PredicateError> {
        Ok(true)
    }
}

#[derive(Debug)]
enum CompareOp {
    AtLeast,
    Equals,
}

#[derive(Debug)]
struct ColumnCompare {
    column_index: usize,
    column_count: usize,
    op: CompareOp,
    operand: f64,
}

impl RowPredicate for ColumnCompare {
    fn evaluate(&self, row: &Row) -> Result<bool, PredicateError> {
        if row.values.len() != self.column_count {
            // Schema mismatch: the stored row disagrees with the matrix
            // metadata. The whole chunk is suspect.
            return Err(PredicateError::structural(format!(
                "row '{}' has {} values, matrix declares {} columns",
                row.id,
                row.values.len(),
                self.column_count
            )));
        }

        let value = row.values[self.column_index];
        if !value.is_finite() {
            return Err(PredicateError::row(format!(
                "row '{}' has non-finite value {value} in tested column",
                row.id
            )));
        }

        #[allow(clippy::float_cmp)]
        Ok(match self.op {
            CompareOp::AtLeast => value >= self.operand,
            CompareOp::Equals => value == self.operand,
        })
    }
}

#[derive(Debug)]
struct AnyExpressed {
    min_positive: usize,
}

impl RowPredicate for AnyExpressed {
    fn evaluate(&self, row: &Row) -> Result<bool, PredicateError> {
        let positive = row.values.iter().filter(|v| **v > 0.0).count();
        Ok(positive >= self.min_positive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::MatrixId;

    fn meta(columns: &[&str]) -> MatrixMeta {
        MatrixMeta {
            matrix_id: MatrixId::new("m").unwrap(),
            row_count: 0,
            columns: columns.iter().map(ToString::to_string).collect(),
            stored_chunk_rows: 100,
        }
    }

    #[test]
    fn select_all_keeps_everything() {
        let predicate = PredicateSpec::SelectAll.bind(&meta(&["A"])).unwrap();
        assert!(predicate.evaluate(&Row::new("r", vec![0.0])).unwrap());
    }

    #[test]
    fn column_at_least_filters() {
        let predicate = PredicateSpec::ColumnAtLeast {
            column: "B".into(),
            threshold: 2.0,
        }
        .bind(&meta(&["A", "B"]))
        .unwrap();

        assert!(predicate.evaluate(&Row::new("hi", vec![0.0, 3.0])).unwrap());
        assert!(predicate.evaluate(&Row::new("eq", vec![0.0, 2.0])).unwrap());
        assert!(!predicate.evaluate(&Row::new("lo", vec![9.0, 1.0])).unwrap());
    }

    #[test]
    fn unknown_column_is_structural() {
        let err = PredicateSpec::ColumnAtLeast {
            column: "GHOST".into(),
            threshold: 1.0,
        }
        .bind(&meta(&["A"]))
        .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn ragged_row_is_structural() {
        let predicate = PredicateSpec::ColumnAtLeast {
            column: "A".into(),
            threshold: 1.0,
        }
        .bind(&meta(&["A", "B"]))
        .unwrap();

        let err = predicate
            .evaluate(&Row::new("short", vec![1.0]))
            .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn non_finite_value_poisons_only_the_row() {
        let predicate = PredicateSpec::ColumnAtLeast {
            column: "A".into(),
            threshold: 1.0,
        }
        .bind(&meta(&["A"]))
        .unwrap();

        let err = predicate
            .evaluate(&Row::new("nan", vec![f64::NAN]))
            .unwrap_err();
        assert!(!err.is_structural());
    }

    #[test]
    fn any_expressed_counts_positives() {
        let predicate = PredicateSpec::AnyExpressed { min_positive: 2 }
            .bind(&meta(&["A", "B", "C"]))
            .unwrap();

        assert!(predicate
            .evaluate(&Row::new("r", vec![1.0, 0.0, 0.5]))
            .unwrap());
        assert!(!predicate
            .evaluate(&Row::new("r", vec![1.0, 0.0, 0.0]))
            .unwrap());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = PredicateSpec::ColumnAtLeast {
            column: "GENE_A".into(),
            threshold: 0.5,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"column_at_least\""));
        let parsed: PredicateSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }
}
