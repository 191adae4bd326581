//! Write-session buffering and fragment flushing.
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::SchemaRef;
use log::debug;
use snafu::prelude::*;

use crate::config::Compression;
use crate::engine::fragments::write_fragment;
use crate::engine::query::latest_unique_sorted;
use crate::engine::{ArrowSnafu, EngineError};
use crate::metadata::{FragmentMeta, SchemaDescriptor};
use crate::storage::ArrayLocation;

/// Buffers validated cells for one write session and turns them into
/// uncommitted fragment files.
///
/// Each flushed fragment is sorted row-major and holds each coordinate at
/// most once (the last one pushed wins).
#[derive(Debug)]
pub struct FragmentWriter {
    location: ArrayLocation,
    arrow_schema: SchemaRef,
    ndim: usize,
    stamp_ms: u64,
    compression: Compression,
    flush_cells: usize,
    pending: Vec<RecordBatch>,
    pending_cells: usize,
    written: Vec<FragmentMeta>,
}

impl FragmentWriter {
    /// New writer whose fragments are stamped `stamp_ms`.
    pub fn new(
        location: ArrayLocation,
        schema: &Arc<SchemaDescriptor>,
        stamp_ms: u64,
        compression: Compression,
        flush_cells: usize,
    ) -> Self {
        Self {
            location,
            arrow_schema: schema.arrow_schema(),
            ndim: schema.ndim(),
            stamp_ms,
            compression,
            flush_cells: flush_cells.max(1),
            pending: Vec::new(),
            pending_cells: 0,
            written: Vec::new(),
        }
    }

    /// Arrow schema batches must conform to.
    pub fn arrow_schema(&self) -> &SchemaRef {
        &self.arrow_schema
    }

    /// Cells buffered but not yet flushed.
    pub fn pending_cells(&self) -> usize {
        self.pending_cells
    }

    /// Fragments flushed so far.
    pub fn written(&self) -> &[FragmentMeta] {
        &self.written
    }

    /// Buffer a schema-ordered batch, flushing once the threshold is reached.
    pub async fn push(&mut self, batch: RecordBatch) -> Result<(), EngineError> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.pending_cells += batch.num_rows();
        self.pending.push(batch);

        if self.pending_cells >= self.flush_cells {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write all buffered cells as one fragment file.
    ///
    /// The buffer is only cleared once the file is stored.
    pub async fn flush(&mut self) -> Result<(), EngineError> {
        if self.pending_cells == 0 {
            return Ok(());
        }

        let all = concat_batches(&self.arrow_schema, &self.pending).context(ArrowSnafu)?;
        let key: Vec<usize> = (0..self.ndim).collect();
        let indices = latest_unique_sorted(&all, &key)?;
        let unique = take_record_batch(&all, &indices).context(ArrowSnafu)?;

        let sequence = self.written.len() as u64;
        let meta = write_fragment(
            &self.location,
            &unique,
            self.ndim,
            self.stamp_ms,
            sequence,
            self.compression,
        )
        .await?;

        debug!(
            "flushed fragment {} ({} cells, {} bytes) under {}",
            meta.fragment_id, meta.cell_count, meta.file_size, self.location
        );

        self.pending.clear();
        self.pending_cells = 0;
        self.written.push(meta);
        Ok(())
    }

    /// Flush the remainder and return every fragment of the session.
    pub async fn finish(mut self) -> Result<Vec<FragmentMeta>, EngineError> {
        self.flush().await?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fragments::read_fragment;
    use crate::engine::test_util::*;
    use tempfile::TempDir;

    fn writer(tmp: &TempDir, flush_cells: usize) -> FragmentWriter {
        let schema = Arc::new(two_dim_schema());
        FragmentWriter::new(
            ArrayLocation::local(tmp.path()),
            &schema,
            7,
            Compression::Zstd,
            flush_cells,
        )
    }

    #[tokio::test]
    async fn flushes_when_threshold_is_reached() -> TestResult {
        let tmp = TempDir::new()?;
        let mut w = writer(&tmp, 3);
        let arrow = w.arrow_schema().clone();

        w.push(cells(&arrow, &[(0, 0, 1.0), (1, 1, 1.0)])?).await?;
        assert!(w.written().is_empty());
        assert_eq!(w.pending_cells(), 2);

        w.push(cells(&arrow, &[(2, 2, 1.0)])?).await?;
        assert_eq!(w.written().len(), 1);
        assert_eq!(w.pending_cells(), 0);

        w.push(cells(&arrow, &[(3, 3, 1.0)])?).await?;
        let fragments = w.finish().await?;
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].cell_count, 3);
        assert_eq!(fragments[1].cell_count, 1);
        assert_ne!(fragments[0].fragment_id, fragments[1].fragment_id);
        Ok(())
    }

    #[tokio::test]
    async fn flushed_fragment_is_sorted_and_deduplicated() -> TestResult {
        let tmp = TempDir::new()?;
        let mut w = writer(&tmp, 100);
        let arrow = w.arrow_schema().clone();

        w.push(cells(&arrow, &[(2, 0, 1.0), (0, 1, 1.0)])?).await?;
        w.push(cells(&arrow, &[(2, 0, 9.0)])?).await?;
        let fragments = w.finish().await?;

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].cell_count, 2);
        let batch = read_fragment(&ArrayLocation::local(tmp.path()), &fragments[0], &arrow).await?;
        assert_eq!(triples(&batch), vec![(0, 1, 1.0), (2, 0, 9.0)]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_batches_and_sessions_write_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let mut w = writer(&tmp, 1);
        let arrow = w.arrow_schema().clone();

        w.push(RecordBatch::new_empty(arrow)).await?;
        assert!(w.finish().await?.is_empty());
        assert!(!tmp.path().join("fragments").exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_buffer() -> TestResult {
        let tmp = TempDir::new()?;
        // A plain file where the fragments directory should go.
        std::fs::write(tmp.path().join("fragments"), b"")?;
        let mut w = writer(&tmp, 10);
        let arrow = w.arrow_schema().clone();

        w.push(cells(&arrow, &[(0, 0, 1.0)])?).await?;
        let err = w.flush().await.expect_err("fragments is not a directory");
        assert!(matches!(err, EngineError::Storage { .. }));
        assert_eq!(w.pending_cells(), 1);
        Ok(())
    }
}
