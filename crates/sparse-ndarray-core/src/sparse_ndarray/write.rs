//! Write sink: batch validation and the per-session ingest state.
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch, new_null_array};
use arrow::compute::{cast, max, min};
use arrow::datatypes::{DataType, Int64Type};
use snafu::prelude::*;

use crate::config::TimestampWindow;
use crate::engine::FragmentWriter;
use crate::metadata::{MetadataValue, SchemaDescriptor};
use crate::sparse_ndarray::buffers::BufferBatch;
use crate::sparse_ndarray::error::{
    ArrayError, CoordinateOutOfDomainSnafu, MalformedBatchSnafu, UnknownColumnSnafu,
};
use crate::transaction_log::LogAction;

/// State owned by a handle opened for write.
#[derive(Debug)]
pub(crate) struct WriteSession {
    pub(crate) window: TimestampWindow,
    pub(crate) writer: FragmentWriter,
    /// Metadata as seen by this session, including its own changes.
    pub(crate) metadata: BTreeMap<String, MetadataValue>,
    /// Metadata changes to commit at close, in call order.
    pub(crate) metadata_actions: Vec<LogAction>,
    pub(crate) aborted: bool,
}

impl WriteSession {
    pub(crate) fn new(
        window: TimestampWindow,
        writer: FragmentWriter,
        metadata: BTreeMap<String, MetadataValue>,
    ) -> Self {
        Self {
            window,
            writer,
            metadata,
            metadata_actions: Vec::new(),
            aborted: false,
        }
    }
}

/// Validate `batch` against `schema` and reorder it into schema column order.
///
/// Checks run in a fixed order and stop at the first failure:
/// 1. at least one column, no duplicate names,
/// 2. every name is a schema column,
/// 3. all columns have the same length,
/// 4. every dimension and non-nullable attribute is present,
/// 5. Arrow types match the schema,
/// 6. no nulls in dimensions or non-nullable attributes,
/// 7. coordinates lie in their dimension domains.
///
/// Missing nullable attributes are filled with nulls.
pub(crate) fn conform_batch(
    schema: &SchemaDescriptor,
    batch: BufferBatch,
) -> Result<RecordBatch, ArrayError> {
    ensure!(
        batch.num_columns() > 0,
        MalformedBatchSnafu {
            reason: "batch has no columns",
        }
    );

    let mut seen = HashSet::with_capacity(batch.num_columns());
    for name in batch.column_names() {
        ensure!(
            seen.insert(name),
            MalformedBatchSnafu {
                reason: format!("column {name:?} appears more than once"),
            }
        );
    }

    for name in batch.column_names() {
        ensure!(schema.has_column(name), UnknownColumnSnafu { column: name });
    }

    let num_cells = batch.num_cells();
    for (name, array) in batch.iter() {
        ensure!(
            array.len() == num_cells,
            MalformedBatchSnafu {
                reason: format!(
                    "column {name:?} has {} cells, expected {num_cells}",
                    array.len()
                ),
            }
        );
    }

    for dim in schema.dimensions() {
        ensure!(
            batch.column(&dim.name).is_some(),
            MalformedBatchSnafu {
                reason: format!("missing dimension column {:?}", dim.name),
            }
        );
    }
    for attr in schema.attributes().iter().filter(|a| !a.nullable) {
        ensure!(
            batch.column(&attr.name).is_some(),
            MalformedBatchSnafu {
                reason: format!("missing non-nullable attribute column {:?}", attr.name),
            }
        );
    }

    let arrow_schema = schema.arrow_schema();
    for field in arrow_schema.fields() {
        if let Some(array) = batch.column(field.name()) {
            ensure!(
                array.data_type() == field.data_type(),
                MalformedBatchSnafu {
                    reason: format!(
                        "column {:?} has type {}, expected {}",
                        field.name(),
                        array.data_type(),
                        field.data_type()
                    ),
                }
            );
        }
    }

    for field in arrow_schema.fields().iter().filter(|f| !f.is_nullable()) {
        if let Some(array) = batch.column(field.name()) {
            ensure!(
                array.null_count() == 0,
                MalformedBatchSnafu {
                    reason: format!("column {:?} contains nulls", field.name()),
                }
            );
        }
    }

    for dim in schema.dimensions() {
        if let Some(array) = batch.column(&dim.name) {
            check_domain(&dim.name, dim.domain, array)?;
        }
    }

    let columns: Vec<ArrayRef> = arrow_schema
        .fields()
        .iter()
        .map(|field| match batch.column(field.name()) {
            Some(array) => Arc::clone(array),
            None => new_null_array(field.data_type(), num_cells),
        })
        .collect();

    RecordBatch::try_new(arrow_schema, columns).map_err(|e| ArrayError::MalformedBatch {
        reason: e.to_string(),
    })
}

fn check_domain(
    dimension: &str,
    (lower, upper): (i64, i64),
    array: &ArrayRef,
) -> Result<(), ArrayError> {
    if array.is_empty() {
        return Ok(());
    }
    let as_i64 = cast(array, &DataType::Int64).map_err(|e| ArrayError::MalformedBatch {
        reason: format!("dimension {dimension:?} is not integral: {e}"),
    })?;
    let values = as_i64.as_primitive::<Int64Type>();

    if let Some(lo) = min(values) {
        ensure!(
            lo >= lower,
            CoordinateOutOfDomainSnafu {
                dimension,
                value: lo,
                lower,
                upper,
            }
        );
    }
    if let Some(hi) = max(values) {
        ensure!(
            hi <= upper,
            CoordinateOutOfDomainSnafu {
                dimension,
                value: hi,
                lower,
                upper,
            }
        );
    }
    Ok(())
}
