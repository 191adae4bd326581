//! Streaming k-way merge over sorted fragments.
//!
//! Every fragment written by [`crate::engine::ingest`] is sorted row-major
//! over the schema dimensions and holds each coordinate once. A read in that
//! order merges the fragment readers directly and keeps one decoded batch per
//! open fragment. Any other key order sorts a fragment in memory when it is
//! opened, so the working set is bounded by the open fragments, each capped by
//! the write flush threshold.
//!
//! Fragments are opened lazily. A fragment is only read once the merge
//! frontier reaches the lower bound of its leading key dimension; until then
//! every cell it could hold sorts after the cells being emitted.
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::{ArrayRef, AsArray, Int64Array, RecordBatch};
use arrow::compute::{cast, concat_batches, take_record_batch};
use arrow::datatypes::{DataType, Int64Type, SchemaRef};
use arrow::row::{Row, RowConverter, Rows, SortField};
use futures::{Stream, stream};
use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
use snafu::prelude::*;

use crate::engine::fragments::{open_fragment, rebind};
use crate::engine::query::latest_unique_sorted;
use crate::engine::{ArrowSnafu, EngineError};
use crate::metadata::FragmentMeta;
use crate::storage::ArrayLocation;

/// Key encoding shared by every cursor of one merge.
struct KeyCodec {
    schema: SchemaRef,
    key: Vec<usize>,
    lead_dim: usize,
    converter: RowConverter,
}

impl KeyCodec {
    fn new(schema: SchemaRef, key: Vec<usize>) -> Result<Self, EngineError> {
        let fields = key
            .iter()
            .map(|&i| SortField::new(schema.field(i).data_type().clone()))
            .collect();
        let converter = RowConverter::new(fields).context(ArrowSnafu)?;
        let lead_dim = key.first().copied().unwrap_or(0);
        Ok(Self {
            schema,
            key,
            lead_dim,
            converter,
        })
    }

    /// Comparable keys of `batch` plus its leading dimension as `i64`.
    fn encode(&self, batch: &RecordBatch) -> Result<(Rows, Int64Array), EngineError> {
        let columns: Vec<ArrayRef> = self
            .key
            .iter()
            .map(|&i| Arc::clone(batch.column(i)))
            .collect();
        let rows = self.converter.convert_columns(&columns).context(ArrowSnafu)?;
        let lead = cast(batch.column(self.lead_dim), &DataType::Int64).context(ArrowSnafu)?;
        Ok((rows, lead.as_primitive::<Int64Type>().clone()))
    }
}

/// Position inside one open fragment.
struct FragmentCursor {
    /// Commit position of the fragment; the higher rank wins on equal keys.
    rank: usize,
    path: String,
    reader: Option<ParquetRecordBatchReader>,
    batch: RecordBatch,
    keys: Rows,
    lead: Int64Array,
    pos: usize,
    /// Bumped whenever `batch` is replaced.
    generation: u64,
}

impl FragmentCursor {
    fn new(
        rank: usize,
        path: &str,
        batch: RecordBatch,
        reader: Option<ParquetRecordBatchReader>,
        codec: &KeyCodec,
    ) -> Result<Self, EngineError> {
        let (keys, lead) = codec.encode(&batch)?;
        Ok(Self {
            rank,
            path: path.to_string(),
            reader,
            batch,
            keys,
            lead,
            pos: 0,
            generation: 0,
        })
    }

    fn key(&self) -> Row<'_> {
        self.keys.row(self.pos)
    }

    fn lead_value(&self) -> i64 {
        self.lead.value(self.pos)
    }

    /// Step past the current cell. Returns `false` once the fragment is spent.
    fn advance(&mut self, codec: &KeyCodec) -> Result<bool, EngineError> {
        self.pos += 1;
        while self.pos >= self.batch.num_rows() {
            let Some(next) = self.reader.as_mut().and_then(|r| r.next()) else {
                return Ok(false);
            };
            let batch = rebind(&self.path, &next.context(ArrowSnafu)?, &codec.schema)?;
            let (keys, lead) = codec.encode(&batch)?;
            self.batch = batch;
            self.keys = keys;
            self.lead = lead;
            self.pos = 0;
            self.generation += 1;
        }
        Ok(true)
    }
}

/// Contiguous cells taken from one cursor batch.
struct Run {
    rank: usize,
    generation: u64,
    batch: RecordBatch,
    start: usize,
    len: usize,
}

impl Run {
    fn extends(&self, cursor: &FragmentCursor) -> bool {
        self.rank == cursor.rank
            && self.generation == cursor.generation
            && self.start + self.len == cursor.pos
    }

    fn into_slice(self) -> RecordBatch {
        self.batch.slice(self.start, self.len)
    }
}

/// Latest-wins merge of fragments into batches of at most `batch_cells`
/// cells, sorted by a dimension key.
pub(crate) struct MergeScan {
    location: ArrayLocation,
    codec: KeyCodec,
    schema_order: bool,
    batch_cells: usize,
    /// Unopened fragments with their commit rank, by leading lower bound.
    pending: VecDeque<(usize, FragmentMeta)>,
    active: Vec<FragmentCursor>,
}

impl MergeScan {
    /// Plan a merge of `fragments` (in commit order) over full-schema
    /// batches. `key` lists every dimension, slowest varying first.
    pub(crate) fn new(
        location: ArrayLocation,
        fragments: &[FragmentMeta],
        schema: SchemaRef,
        key: Vec<usize>,
        batch_cells: usize,
    ) -> Result<Self, EngineError> {
        let schema_order = key.iter().copied().eq(0..key.len());
        let codec = KeyCodec::new(schema, key)?;

        let mut pending: Vec<(usize, FragmentMeta)> = fragments
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, f)| f.cell_count > 0)
            .collect();
        pending.sort_by_key(|(_, f)| lead_lower_bound(f, codec.lead_dim));

        Ok(Self {
            location,
            codec,
            schema_order,
            batch_cells: batch_cells.max(1),
            pending: pending.into(),
            active: Vec::new(),
        })
    }

    pub(crate) fn into_stream(
        self,
    ) -> impl Stream<Item = Result<RecordBatch, EngineError>> + Send {
        stream::try_unfold(self, |mut merge| async move {
            Ok(merge.next_batch().await?.map(|batch| (batch, merge)))
        })
    }

    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, EngineError> {
        let mut runs = Vec::new();
        let mut run: Option<Run> = None;
        let mut taken = 0;

        while taken < self.batch_cells {
            self.open_reachable().await?;
            let Some(winner) = self.leading_cursor() else {
                break;
            };

            let cursor = &self.active[winner];
            match run.as_mut() {
                Some(current) if current.extends(cursor) => current.len += 1,
                _ => {
                    runs.extend(run.take().map(Run::into_slice));
                    run = Some(Run {
                        rank: cursor.rank,
                        generation: cursor.generation,
                        batch: cursor.batch.clone(),
                        start: cursor.pos,
                        len: 1,
                    });
                }
            }
            taken += 1;
            self.advance_past(winner)?;
        }
        runs.extend(run.map(Run::into_slice));

        if runs.is_empty() {
            return Ok(None);
        }
        concat_batches(&self.codec.schema, &runs)
            .map(Some)
            .context(ArrowSnafu)
    }

    /// Open every pending fragment that could hold a cell at or before the
    /// current frontier.
    async fn open_reachable(&mut self) -> Result<(), EngineError> {
        let lead_dim = self.codec.lead_dim;
        while let Some(lower) = self
            .pending
            .front()
            .map(|(_, f)| lead_lower_bound(f, lead_dim))
        {
            let frontier = self.active.iter().map(FragmentCursor::lead_value).min();
            if frontier.is_some_and(|f| lower > f) {
                break;
            }
            let Some((rank, fragment)) = self.pending.pop_front() else {
                break;
            };
            if let Some(cursor) = self.open(rank, &fragment).await? {
                self.active.push(cursor);
            }
        }
        Ok(())
    }

    async fn open(
        &mut self,
        rank: usize,
        fragment: &FragmentMeta,
    ) -> Result<Option<FragmentCursor>, EngineError> {
        let mut reader = open_fragment(&self.location, fragment, self.batch_cells).await?;
        let schema = &self.codec.schema;

        if self.schema_order {
            let batch = loop {
                let Some(batch) = reader.next() else {
                    return Ok(None);
                };
                let batch = rebind(&fragment.path, &batch.context(ArrowSnafu)?, schema)?;
                if batch.num_rows() > 0 {
                    break batch;
                }
            };
            return FragmentCursor::new(rank, &fragment.path, batch, Some(reader), &self.codec)
                .map(Some);
        }

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(rebind(&fragment.path, &batch.context(ArrowSnafu)?, schema)?);
        }
        let all = concat_batches(schema, &batches).context(ArrowSnafu)?;
        if all.num_rows() == 0 {
            return Ok(None);
        }
        let indices = latest_unique_sorted(&all, &self.codec.key)?;
        let sorted = take_record_batch(&all, &indices).context(ArrowSnafu)?;
        FragmentCursor::new(rank, &fragment.path, sorted, None, &self.codec).map(Some)
    }

    /// Index of the active cursor holding the smallest key, preferring the
    /// latest commit among equal keys.
    fn leading_cursor(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, cursor) in self.active.iter().enumerate() {
            best = match best {
                None => Some(i),
                Some(b) => {
                    let other = &self.active[b];
                    match cursor.key().cmp(&other.key()) {
                        Ordering::Less => Some(i),
                        Ordering::Equal if cursor.rank > other.rank => Some(i),
                        _ => Some(b),
                    }
                }
            };
        }
        best
    }

    /// Advance every cursor positioned on the winner's key, dropping the
    /// ones that run dry.
    fn advance_past(&mut self, winner: usize) -> Result<(), EngineError> {
        let key = self.active[winner].key().owned();
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].key() == key.row() && !self.active[i].advance(&self.codec)? {
                self.active.swap_remove(i);
                continue;
            }
            i += 1;
        }
        Ok(())
    }
}

fn lead_lower_bound(fragment: &FragmentMeta, lead_dim: usize) -> i64 {
    fragment.bounds.get(lead_dim).map_or(i64::MIN, |&(lo, _)| lo)
}
