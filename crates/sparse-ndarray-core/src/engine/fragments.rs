//! Parquet encoding and decoding of fragment files.
//!
//! A fragment holds cells in array-schema column order: every dimension, then
//! every attribute. Fragment files live under `fragments/` and are never
//! rewritten; their names derive from [`fragment_id_v1`].
use std::path::Path;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::compute::{cast, concat_batches, max, min};
use arrow::datatypes::{DataType, Int64Type, SchemaRef};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::basic::{Compression as ParquetCompression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;

use crate::config::Compression;
use crate::engine::{
    ArrowSnafu, CorruptFragmentSnafu, EngineError, ParquetReadSnafu, ParquetWriteSnafu,
    StorageSnafu,
};
use crate::metadata::fragments::fragment_id_v1;
use crate::metadata::{FileFormat, FragmentMeta};
use crate::storage::{self, ArrayLocation, StorageError};

/// Directory holding fragment files, relative to the array root.
pub const FRAGMENTS_DIR: &str = "fragments";

fn writer_properties(compression: Compression) -> WriterProperties {
    let codec = match compression {
        Compression::Zstd => ParquetCompression::ZSTD(ZstdLevel::default()),
        Compression::Snappy => ParquetCompression::SNAPPY,
        Compression::Uncompressed => ParquetCompression::UNCOMPRESSED,
    };
    WriterProperties::builder().set_compression(codec).build()
}

/// Encode a schema-ordered batch as an in-memory Parquet file.
pub fn encode_fragment(
    batch: &RecordBatch,
    compression: Compression,
) -> Result<Bytes, EngineError> {
    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(
            &mut buf,
            batch.schema(),
            Some(writer_properties(compression)),
        )
        .context(ParquetWriteSnafu)?;
        writer.write(batch).context(ParquetWriteSnafu)?;
        writer.close().context(ParquetWriteSnafu)?;
    }
    Ok(Bytes::from(buf))
}

/// Per-dimension `(min, max)` over the leading `ndim` columns of `batch`.
///
/// Returns an empty vector for an empty batch.
pub fn compute_bounds(batch: &RecordBatch, ndim: usize) -> Result<Vec<(i64, i64)>, EngineError> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }

    let mut bounds = Vec::with_capacity(ndim);
    for column in batch.columns().iter().take(ndim) {
        let as_i64 = cast(column, &DataType::Int64).context(ArrowSnafu)?;
        let values = as_i64.as_primitive::<Int64Type>();
        match (min(values), max(values)) {
            (Some(lo), Some(hi)) => bounds.push((lo, hi)),
            _ => {
                return CorruptFragmentSnafu {
                    path: "<pending>",
                    reason: "dimension column has no non-null values",
                }
                .fail();
            }
        }
    }
    Ok(bounds)
}

/// Encode `batch`, store it under `fragments/` and describe it.
///
/// The batch must already be in array-schema column order and hold unique
/// coordinates. A file that already exists under the derived name carries the
/// same content and is reused.
pub async fn write_fragment(
    location: &ArrayLocation,
    batch: &RecordBatch,
    ndim: usize,
    stamp_ms: u64,
    sequence: u64,
    compression: Compression,
) -> Result<FragmentMeta, EngineError> {
    let bounds = compute_bounds(batch, ndim)?;
    let data = encode_fragment(batch, compression)?;
    let fragment_id = fragment_id_v1(stamp_ms, sequence, &data);
    let rel_path = format!("{FRAGMENTS_DIR}/{fragment_id}.parquet");

    match storage::write_new(location, Path::new(&rel_path), &data).await {
        Ok(()) | Err(StorageError::AlreadyExists { .. }) => {}
        Err(source) => return Err(EngineError::Storage { source }),
    }

    Ok(FragmentMeta {
        fragment_id,
        path: rel_path,
        format: FileFormat::Parquet,
        cell_count: batch.num_rows() as u64,
        bounds,
        file_size: data.len() as u64,
    })
}

/// Read a fragment and rebind its columns to `schema`.
///
/// Fails with `CorruptFragment` when the file's columns do not line up with
/// the array schema.
pub async fn read_fragment(
    location: &ArrayLocation,
    fragment: &FragmentMeta,
    schema: &SchemaRef,
) -> Result<RecordBatch, EngineError> {
    let bytes = storage::read_all_bytes(location, Path::new(&fragment.path))
        .await
        .context(StorageSnafu)?;
    decode_fragment(&fragment.path, Bytes::from(bytes), schema)
}

/// Open a fragment for incremental decoding, `batch_cells` rows at a time.
///
/// Batches come back in file order with the file's own schema; callers
/// [`rebind`] them.
pub(crate) async fn open_fragment(
    location: &ArrayLocation,
    fragment: &FragmentMeta,
    batch_cells: usize,
) -> Result<ParquetRecordBatchReader, EngineError> {
    let path = fragment.path.as_str();
    let bytes = storage::read_all_bytes(location, Path::new(path))
        .await
        .context(StorageSnafu)?;
    ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .context(ParquetReadSnafu { path })?
        .with_batch_size(batch_cells.max(1))
        .build()
        .context(ParquetReadSnafu { path })
}

pub(crate) fn decode_fragment(
    path: &str,
    bytes: Bytes,
    schema: &SchemaRef,
) -> Result<RecordBatch, EngineError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context(ParquetReadSnafu { path })?
        .build()
        .context(ParquetReadSnafu { path })?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;
        batches.push(rebind(path, &batch, schema)?);
    }

    concat_batches(schema, &batches).context(ArrowSnafu)
}

/// Attach `schema` to a decoded batch after checking its columns line up.
pub(crate) fn rebind(
    path: &str,
    batch: &RecordBatch,
    schema: &SchemaRef,
) -> Result<RecordBatch, EngineError> {
    ensure!(
        batch.num_columns() == schema.fields().len(),
        CorruptFragmentSnafu {
            path,
            reason: format!(
                "expected {} columns, found {}",
                schema.fields().len(),
                batch.num_columns()
            ),
        }
    );

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        ensure!(
            field.data_type() == column.data_type(),
            CorruptFragmentSnafu {
                path,
                reason: format!(
                    "column {} has type {}, expected {}",
                    field.name(),
                    column.data_type(),
                    field.data_type()
                ),
            }
        );
    }

    RecordBatch::try_new(schema.clone(), batch.columns().to_vec()).map_err(|e| {
        EngineError::CorruptFragment {
            path: path.to_string(),
            reason: e.to_string(),
        }
    })
}
