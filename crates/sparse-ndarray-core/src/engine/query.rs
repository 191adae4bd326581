//! Query execution over the fragments visible in a snapshot.
//!
//! A read is planned once at open time as a [`ScanPlan`] and executed lazily,
//! one pull at a time:
//!
//! 1. merge the visible fragments by the plan's dimension key, keeping the
//!    cell of the latest commit for each coordinate,
//! 2. stop each pull once `batch_cells` cells are gathered,
//! 3. project the requested index columns followed by every attribute.
//!
//! Fragments are opened only as the merge reaches them, so no pull holds the
//! full result. Fragments written by [`crate::engine::ingest`] hold unique
//! coordinates, so [`count_cells`] can skip the scan when fragment bounding
//! boxes are pairwise disjoint.
use std::pin::Pin;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, UInt64Array};
use arrow::row::{RowConverter, SortField};
use futures::{Stream, TryStreamExt, future, stream};
use snafu::prelude::*;

use crate::engine::merge::MergeScan;
use crate::engine::{ArrowSnafu, EngineError};
use crate::metadata::{FragmentMeta, SchemaDescriptor};
use crate::storage::ArrayLocation;

/// Order in which a read returns cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultOrder {
    /// Engine's choice; row-major over the schema's dimension order.
    #[default]
    Automatic,
    /// Sorted by the index columns, first column slowest varying.
    RowMajor,
    /// Sorted by the index columns, first column fastest varying.
    ColumnMajor,
}

/// Stream of result batches produced by a scan.
pub type ArrayScan = Pin<Box<dyn Stream<Item = Result<RecordBatch, EngineError>> + Send>>;

/// Everything needed to execute one read.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    /// Array root.
    pub location: ArrayLocation,
    /// Visible fragments in commit order.
    pub fragments: Vec<FragmentMeta>,
    /// Array schema.
    pub schema: Arc<SchemaDescriptor>,
    /// Selected dimension names; empty means all dimensions in schema order.
    pub index_columns: Vec<String>,
    /// Result ordering.
    pub order: ResultOrder,
    /// Maximum cells per result batch.
    pub batch_cells: usize,
}

impl ScanPlan {
    /// Dimension positions returned by the read, in output order.
    fn output_dimensions(&self) -> Vec<usize> {
        if self.index_columns.is_empty() {
            return (0..self.schema.ndim()).collect();
        }
        self.index_columns
            .iter()
            .filter_map(|name| self.schema.dimension_index(name))
            .collect()
    }

    /// Dimension positions in sort-key order, slowest varying first.
    fn sort_key(&self) -> Vec<usize> {
        let ndim = self.schema.ndim();
        if self.order == ResultOrder::Automatic {
            return (0..ndim).collect();
        }

        let mut key = self.output_dimensions();
        for dim in 0..ndim {
            if !key.contains(&dim) {
                key.push(dim);
            }
        }
        if self.order == ResultOrder::ColumnMajor {
            key.reverse();
        }
        key
    }

    /// Column positions of the output: index columns, then every attribute.
    fn projection(&self) -> Vec<usize> {
        let ndim = self.schema.ndim();
        let mut projection = self.output_dimensions();
        projection.extend(ndim..ndim + self.schema.attributes().len());
        projection
    }

    fn merge(&self) -> Result<MergeScan, EngineError> {
        MergeScan::new(
            self.location.clone(),
            &self.fragments,
            self.schema.arrow_schema(),
            self.sort_key(),
            self.batch_cells,
        )
    }
}

/// Cells per merge step when only counting.
const COUNT_BATCH_CELLS: usize = 64 * 1024;

/// Start a lazy scan; no IO happens until the stream is first polled, and
/// each poll reads only the fragments the merge has reached.
pub fn scan(plan: ScanPlan) -> ArrayScan {
    let projection = plan.projection();
    let batches = stream::once(future::ready(plan.merge()))
        .map_ok(MergeScan::into_stream)
        .try_flatten()
        .and_then(move |batch| future::ready(batch.project(&projection).context(ArrowSnafu)));
    Box::pin(batches)
}

/// Number of distinct populated coordinates across `fragments`.
pub async fn count_cells(
    location: &ArrayLocation,
    fragments: &[FragmentMeta],
    schema: &SchemaDescriptor,
) -> Result<u64, EngineError> {
    if pairwise_disjoint(fragments) {
        return Ok(fragments.iter().map(|f| f.cell_count).sum());
    }

    let key: Vec<usize> = (0..schema.ndim()).collect();
    MergeScan::new(
        location.clone(),
        fragments,
        schema.arrow_schema(),
        key,
        COUNT_BATCH_CELLS,
    )?
    .into_stream()
    .try_fold(0_u64, |n, batch| future::ready(Ok(n + batch.num_rows() as u64)))
    .await
}

/// Per-dimension `(min, max)` populated coordinate, or `None` when empty.
pub fn non_empty_domain(fragments: &[FragmentMeta], ndim: usize) -> Option<Vec<(i64, i64)>> {
    let mut populated = fragments
        .iter()
        .filter(|f| f.cell_count > 0 && f.bounds.len() == ndim);
    let first = populated.next()?;
    let mut domain = first.bounds.clone();
    for fragment in populated {
        for (acc, &(lo, hi)) in domain.iter_mut().zip(&fragment.bounds) {
            acc.0 = acc.0.min(lo);
            acc.1 = acc.1.max(hi);
        }
    }
    Some(domain)
}

fn pairwise_disjoint(fragments: &[FragmentMeta]) -> bool {
    fragments.iter().enumerate().all(|(i, a)| {
        fragments[i + 1..]
            .iter()
            .all(|b| a.cell_count == 0 || b.cell_count == 0 || !a.overlaps(b))
    })
}

/// Row indices of `batch` sorted by the `key` columns, keeping only the last
/// occurrence of each distinct key.
pub(crate) fn latest_unique_sorted(
    batch: &RecordBatch,
    key: &[usize],
) -> Result<UInt64Array, EngineError> {
    let columns: Vec<ArrayRef> = key.iter().map(|&i| Arc::clone(batch.column(i))).collect();
    let fields = columns
        .iter()
        .map(|c| SortField::new(c.data_type().clone()))
        .collect();
    let converter = RowConverter::new(fields).context(ArrowSnafu)?;
    let rows = converter.convert_columns(&columns).context(ArrowSnafu)?;

    // Stable sort keeps write order within a run of equal keys.
    let mut order: Vec<usize> = (0..batch.num_rows()).collect();
    order.sort_by(|&a, &b| rows.row(a).cmp(&rows.row(b)));

    let keep: Vec<u64> = order
        .iter()
        .enumerate()
        .filter(|&(pos, &idx)| {
            order
                .get(pos + 1)
                .is_none_or(|&next| rows.row(next) != rows.row(idx))
        })
        .map(|(_, &idx)| idx as u64)
        .collect();

    Ok(UInt64Array::from(keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::engine::fragments::{FRAGMENTS_DIR, write_fragment};
    use crate::engine::test_util::*;
    use arrow::compute::take_record_batch;
    use futures::StreamExt;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        location: ArrayLocation,
        schema: Arc<SchemaDescriptor>,
        fragments: Vec<FragmentMeta>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().expect("create temp dir");
            let location = ArrayLocation::local(tmp.path());
            Self {
                _tmp: tmp,
                location,
                schema: Arc::new(two_dim_schema()),
                fragments: Vec::new(),
            }
        }

        async fn add(&mut self, rows: &[(i64, i64, f64)]) -> TestResult {
            let arrow = self.schema.arrow_schema();
            let batch = cells(&arrow, rows)?;
            let indices = latest_unique_sorted(&batch, &[0, 1])?;
            let batch = take_record_batch(&batch, &indices)?;
            let sequence = self.fragments.len() as u64;
            let meta =
                write_fragment(&self.location, &batch, 2, 1, sequence, Compression::Zstd).await?;
            self.fragments.push(meta);
            Ok(())
        }

        fn plan(&self, index_columns: &[&str], order: ResultOrder, batch_cells: usize) -> ScanPlan {
            ScanPlan {
                location: self.location.clone(),
                fragments: self.fragments.clone(),
                schema: Arc::clone(&self.schema),
                index_columns: index_columns.iter().map(|s| s.to_string()).collect(),
                order,
                batch_cells,
            }
        }
    }

    async fn collect(plan: ScanPlan) -> Result<Vec<RecordBatch>, EngineError> {
        scan(plan).try_collect().await
    }

    fn flatten(batches: &[RecordBatch]) -> Vec<(i64, i64, f64)> {
        batches.iter().flat_map(triples).collect()
    }

    #[tokio::test]
    async fn automatic_order_is_row_major_over_schema_dims() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(1, 1, 1.0), (0, 2, 2.0), (1, 0, 3.0)]).await?;

        let batches = collect(fx.plan(&[], ResultOrder::Automatic, 100)).await?;
        assert_eq!(
            flatten(&batches),
            vec![(0, 2, 2.0), (1, 0, 3.0), (1, 1, 1.0)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn column_major_reverses_the_key() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(1, 1, 1.0), (0, 2, 2.0), (1, 0, 3.0), (0, 0, 4.0)])
            .await?;

        let batches = collect(fx.plan(&["x", "y"], ResultOrder::ColumnMajor, 100)).await?;
        assert_eq!(
            flatten(&batches),
            vec![(0, 0, 4.0), (1, 0, 3.0), (1, 1, 1.0), (0, 2, 2.0)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn row_major_follows_selection_order() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(1, 1, 1.0), (0, 2, 2.0), (1, 0, 3.0), (0, 0, 4.0)])
            .await?;

        // Output columns are y, x, v; sorted by y then x.
        let batches = collect(fx.plan(&["y", "x"], ResultOrder::RowMajor, 100)).await?;
        let schema = batches[0].schema();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["y", "x", "v"]);
        assert_eq!(
            flatten(&batches),
            vec![(0, 0, 4.0), (0, 1, 3.0), (1, 1, 1.0), (2, 0, 2.0)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn partial_selection_projects_only_selected_dims() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(3, 4, 1.0)]).await?;

        let batches = collect(fx.plan(&["y"], ResultOrder::Automatic, 100)).await?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_columns(), 2);
        assert_eq!(batches[0].schema().field(0).name(), "y");
        assert_eq!(batches[0].schema().field(1).name(), "v");
        Ok(())
    }

    #[tokio::test]
    async fn later_fragments_win_on_duplicate_coordinates() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(0, 0, 1.0), (1, 1, 1.0)]).await?;
        fx.add(&[(1, 1, 2.0)]).await?;
        fx.add(&[(1, 1, 3.0), (2, 2, 3.0)]).await?;

        let batches = collect(fx.plan(&[], ResultOrder::Automatic, 100)).await?;
        assert_eq!(
            flatten(&batches),
            vec![(0, 0, 1.0), (1, 1, 3.0), (2, 2, 3.0)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_fragments_merge_in_bounded_batches() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(0, 0, 1.0), (2, 2, 1.0), (4, 4, 1.0), (6, 6, 1.0)])
            .await?;
        fx.add(&[(1, 1, 2.0), (2, 2, 2.0), (5, 5, 2.0)]).await?;
        fx.add(&[(2, 2, 3.0), (3, 3, 3.0), (6, 6, 3.0)]).await?;

        let expected = vec![
            (0, 0, 1.0),
            (1, 1, 2.0),
            (2, 2, 3.0),
            (3, 3, 3.0),
            (4, 4, 1.0),
            (5, 5, 2.0),
            (6, 6, 3.0),
        ];
        for batch_cells in [1, 2, 3, 7, 50] {
            let batches = collect(fx.plan(&[], ResultOrder::Automatic, batch_cells)).await?;
            assert!(batches.iter().all(|b| b.num_rows() <= batch_cells));
            assert_eq!(batches.len(), 7_usize.div_ceil(batch_cells));
            assert_eq!(flatten(&batches), expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn column_major_merges_across_fragments() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(0, 1, 1.0), (1, 0, 1.0), (2, 1, 1.0)]).await?;
        fx.add(&[(0, 0, 2.0), (2, 1, 2.0)]).await?;

        let batches = collect(fx.plan(&["x", "y"], ResultOrder::ColumnMajor, 2)).await?;
        assert_eq!(
            flatten(&batches),
            vec![(0, 0, 2.0), (1, 0, 1.0), (0, 1, 1.0), (2, 1, 2.0)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn fragments_are_opened_only_when_the_merge_reaches_them() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(0, 0, 1.0), (0, 1, 1.0)]).await?;
        fx.add(&[(4, 0, 2.0)]).await?;
        fx.add(&[(8, 0, 3.0)]).await?;

        let mut stream = scan(fx.plan(&[], ResultOrder::Automatic, 1));
        let first = stream.next().await.expect("first batch")?;
        assert_eq!(triples(&first), vec![(0, 0, 1.0)]);

        // Nothing past the first fragment has been read yet.
        std::fs::remove_dir_all(fx._tmp.path().join(FRAGMENTS_DIR))?;

        let second = stream.next().await.expect("second batch")?;
        assert_eq!(triples(&second), vec![(0, 1, 1.0)]);
        let third = stream.next().await.expect("third item");
        assert!(matches!(third, Err(EngineError::Storage { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn batches_are_bounded_and_gap_free() -> TestResult {
        let mut fx = Fixture::new();
        let rows: Vec<_> = (0..10).map(|i| (i % 10, i / 10, i as f64)).collect();
        fx.add(&rows).await?;

        let full = flatten(&collect(fx.plan(&[], ResultOrder::Automatic, 100)).await?);
        for batch_cells in [1, 3, 4, 10, 11] {
            let batches = collect(fx.plan(&[], ResultOrder::Automatic, batch_cells)).await?;
            assert!(
                batches
                    .iter()
                    .all(|b| b.num_rows() >= 1 && b.num_rows() <= batch_cells)
            );
            assert_eq!(batches.len(), 10_usize.div_ceil(batch_cells));
            assert_eq!(flatten(&batches), full);
        }
        Ok(())
    }

    #[tokio::test]
    async fn empty_array_yields_no_batches() -> TestResult {
        let fx = Fixture::new();
        let mut stream = scan(fx.plan(&[], ResultOrder::Automatic, 10));
        assert!(stream.next().await.is_none());
        assert!(non_empty_domain(&fx.fragments, 2).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn count_cells_uses_bounds_when_disjoint_and_scans_otherwise() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(0, 0, 1.0), (1, 1, 1.0)]).await?;
        fx.add(&[(5, 5, 1.0), (6, 6, 1.0)]).await?;
        assert_eq!(count_cells(&fx.location, &fx.fragments, &fx.schema).await?, 4);

        // Remove a fragment file: the fast path must not touch storage.
        std::fs::remove_file(fx._tmp.path().join(&fx.fragments[0].path))?;
        assert_eq!(count_cells(&fx.location, &fx.fragments, &fx.schema).await?, 4);

        let mut fx = Fixture::new();
        fx.add(&[(0, 0, 1.0), (1, 1, 1.0)]).await?;
        fx.add(&[(1, 1, 2.0), (2, 2, 2.0)]).await?;
        assert_eq!(count_cells(&fx.location, &fx.fragments, &fx.schema).await?, 3);
        assert_eq!(non_empty_domain(&fx.fragments, 2), Some(vec![(0, 2), (0, 2)]));
        Ok(())
    }

    #[tokio::test]
    async fn scan_surfaces_missing_fragment_as_error() -> TestResult {
        let mut fx = Fixture::new();
        fx.add(&[(0, 0, 1.0)]).await?;
        std::fs::remove_file(fx._tmp.path().join(&fx.fragments[0].path))?;

        let mut stream = scan(fx.plan(&[], ResultOrder::Automatic, 10));
        let first = stream.next().await.expect("one item");
        assert!(matches!(first, Err(EngineError::Storage { .. })));
        Ok(())
    }

    #[test]
    fn latest_unique_sorted_keeps_last_occurrence() -> TestResult {
        let arrow = two_dim_schema().arrow_schema();
        let batch = cells(&arrow, &[(1, 1, 1.0), (0, 0, 2.0), (1, 1, 3.0)])?;
        let indices = latest_unique_sorted(&batch, &[0, 1])?;
        assert_eq!(indices.values().to_vec(), vec![1, 2]);
        Ok(())
    }
}
