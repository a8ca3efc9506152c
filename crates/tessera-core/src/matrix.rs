//! Chunked, read-only matrix access.
//!
//! Expression matrices are large; nothing in the pipeline ever loads one
//! whole. This module provides:
//!
//! - [`Row`] / [`MatrixMeta`]: the row model and per-matrix metadata
//! - the JSON-lines row codec shared by the matrix store and the staging
//!   layer (partial results are row-wise byte frames, so merged output is
//!   plain concatenation)
//! - [`ChunkedMatrixStore`]: the lazy read contract (`row_count` is a
//!   cheap metadata read; `read_rows` touches only the stored chunks
//!   overlapping the requested range)
//! - [`StoredMatrixStore`]: an implementation over any [`StorageBackend`],
//!   with matrices laid out as one metadata blob plus fixed-size row-chunk
//!   blobs

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::id::MatrixId;
use crate::storage::StorageBackend;

/// One matrix row: an identifier (e.g. a cell barcode) plus one value per
/// column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Row identifier, unique within its matrix.
    pub id: String,
    /// Expression values, positionally keyed by [`MatrixMeta::columns`].
    pub values: Vec<f64>,
}

impl Row {
    /// Creates a new row.
    #[must_use]
    pub fn new(id: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            values,
        }
    }
}

/// Per-matrix metadata, readable without touching any row data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixMeta {
    /// The matrix this metadata describes.
    pub matrix_id: MatrixId,
    /// Total number of rows.
    pub row_count: u64,
    /// Column names, in stored order.
    pub columns: Vec<String>,
    /// Rows per stored chunk blob (layout parameter, fixed at write time).
    pub stored_chunk_rows: u64,
}

/// Encodes rows as newline-delimited JSON.
///
/// The frame is self-delimiting per row, so concatenating two encoded
/// buffers yields the encoding of the concatenated row sequences. The
/// reducer relies on this to merge partial results without re-encoding.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if a row fails to serialize.
pub fn encode_rows(rows: &[Row]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for row in rows {
        let line = serde_json::to_vec(row).map_err(|e| Error::Serialization {
            message: format!("failed to encode row '{}': {e}", row.id),
        })?;
        buf.put_slice(&line);
        buf.put_u8(b'\n');
    }
    Ok(buf.freeze())
}

/// Decodes newline-delimited JSON rows.
///
/// # Errors
///
/// Returns [`Error::Corrupt`] (tagged with `key`) if any line fails to
/// parse; a partially readable blob is treated as wholly unreadable.
pub fn decode_rows(key: &str, data: &[u8]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let row: Row = serde_json::from_slice(line)
            .map_err(|e| Error::corrupt(key, format!("undecodable row frame: {e}")))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Lazy, read-only access to chunked matrices.
///
/// Reading may fail with [`Error::NotFound`] (unknown matrix),
/// [`Error::Unavailable`] (transient backend outage, retryable), or
/// [`Error::Corrupt`] (permanent).
#[async_trait]
pub trait ChunkedMatrixStore: Send + Sync {
    /// Returns the metadata for a matrix. Cheap: one small blob read.
    async fn meta(&self, matrix_id: &MatrixId) -> Result<MatrixMeta>;

    /// Returns the row count for a matrix. Cheap: one small blob read.
    async fn row_count(&self, matrix_id: &MatrixId) -> Result<u64> {
        Ok(self.meta(matrix_id).await?.row_count)
    }

    /// Reads rows in `[range.start, range.end)`.
    ///
    /// Only the stored chunks overlapping the range are fetched.
    async fn read_rows(&self, matrix_id: &MatrixId, range: Range<u64>) -> Result<Vec<Row>>;
}

/// Matrix store over a blob [`StorageBackend`].
///
/// Layout under the `matrices/` prefix:
///
/// ```text
/// matrices/{matrix_id}/meta.json   MatrixMeta
/// matrices/{matrix_id}/rows/{n}    rows [n*stored_chunk_rows, (n+1)*stored_chunk_rows)
/// ```
#[derive(Clone)]
pub struct StoredMatrixStore {
    backend: Arc<dyn StorageBackend>,
}

impl StoredMatrixStore {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn meta_key(matrix_id: &MatrixId) -> String {
        format!("matrices/{matrix_id}/meta.json")
    }

    fn chunk_key(matrix_id: &MatrixId, chunk_no: u64) -> String {
        format!("matrices/{matrix_id}/rows/{chunk_no}")
    }

    /// Writes a matrix in chunked form.
    ///
    /// This is the ingest path used by tests, demos, and warehouse loaders;
    /// the pipeline itself only ever reads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `stored_chunk_rows` is zero or a
    /// row's value count doesn't match `columns`, or a storage error if a
    /// write fails.
    pub async fn write_matrix(
        &self,
        matrix_id: &MatrixId,
        columns: Vec<String>,
        rows: &[Row],
        stored_chunk_rows: u64,
    ) -> Result<MatrixMeta> {
        if stored_chunk_rows == 0 {
            return Err(Error::InvalidInput(
                "stored_chunk_rows must be at least 1".into(),
            ));
        }
        if let Some(bad) = rows.iter().find(|r| r.values.len() != columns.len()) {
            return Err(Error::InvalidInput(format!(
                "row '{}' has {} values but the matrix has {} columns",
                bad.id,
                bad.values.len(),
                columns.len()
            )));
        }

        for (chunk_no, chunk_rows) in rows.chunks(stored_chunk_rows as usize).enumerate() {
            let data = encode_rows(chunk_rows)?;
            self.backend
                .put(&Self::chunk_key(matrix_id, chunk_no as u64), data)
                .await?;
        }

        let meta = MatrixMeta {
            matrix_id: matrix_id.clone(),
            row_count: rows.len() as u64,
            columns,
            stored_chunk_rows,
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(|e| Error::Serialization {
            message: format!("failed to encode matrix metadata: {e}"),
        })?;
        self.backend
            .put(&Self::meta_key(matrix_id), Bytes::from(meta_bytes))
            .await?;

        Ok(meta)
    }
}

#[async_trait]
impl ChunkedMatrixStore for StoredMatrixStore {
    async fn meta(&self, matrix_id: &MatrixId) -> Result<MatrixMeta> {
        let key = Self::meta_key(matrix_id);
        let data = self.backend.get(&key).await.map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("matrix '{matrix_id}'")),
            other => other,
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::corrupt(&key, format!("undecodable matrix metadata: {e}")))
    }

    async fn read_rows(&self, matrix_id: &MatrixId, range: Range<u64>) -> Result<Vec<Row>> {
        let meta = self.meta(matrix_id).await?;
        if range.start > range.end {
            return Err(Error::InvalidInput(format!(
                "row range start {} exceeds end {}",
                range.start, range.end
            )));
        }
        if range.end > meta.row_count {
            return Err(Error::InvalidInput(format!(
                "row range end {} exceeds row count {} of matrix '{matrix_id}'",
                range.end, meta.row_count
            )));
        }
        if range.start == range.end {
            return Ok(Vec::new());
        }

        // Fetch only the stored chunks overlapping the range.
        let first_chunk = range.start / meta.stored_chunk_rows;
        let last_chunk = (range.end - 1) / meta.stored_chunk_rows;

        let mut rows = Vec::with_capacity((range.end - range.start) as usize);
        for chunk_no in first_chunk..=last_chunk {
            let key = Self::chunk_key(matrix_id, chunk_no);
            let data = self.backend.get(&key).await?;
            let chunk_rows = decode_rows(&key, &data)?;

            let chunk_start = chunk_no * meta.stored_chunk_rows;
            let take_from = range.start.saturating_sub(chunk_start) as usize;
            let take_to =
                ((range.end - chunk_start).min(chunk_rows.len() as u64)) as usize;
            if take_from >= take_to {
                return Err(Error::corrupt(
                    &key,
                    format!(
                        "stored chunk holds {} rows, fewer than the metadata implies",
                        chunk_rows.len()
                    ),
                ));
            }
            rows.extend_from_slice(&chunk_rows[take_from..take_to]);
        }

        Ok(rows)
    }
}
