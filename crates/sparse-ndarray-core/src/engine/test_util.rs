use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;

use crate::metadata::{Attribute, Dimension, LogicalDataType, SchemaDescriptor};

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

/// `x`, `y` in `[0, 9]` with a float64 attribute `v`.
pub(crate) fn two_dim_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        vec![
            Dimension::new("x", LogicalDataType::Int64, 0, 9),
            Dimension::new("y", LogicalDataType::Int64, 0, 9),
        ],
        vec![Attribute::new("v", LogicalDataType::Float64)],
    )
    .expect("valid schema")
}

pub(crate) fn one_dim_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        vec![Dimension::new("i", LogicalDataType::Int64, 0, 99)],
        vec![Attribute::new("v", LogicalDataType::Float64)],
    )
    .expect("valid schema")
}

/// Batch over [`two_dim_schema`] from `(x, y, v)` triples.
pub(crate) fn cells(
    schema: &SchemaRef,
    rows: &[(i64, i64, f64)],
) -> Result<RecordBatch, ArrowError> {
    let xs: ArrayRef = Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0)));
    let ys: ArrayRef = Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1)));
    let vs: ArrayRef = Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.2)));
    RecordBatch::try_new(schema.clone(), vec![xs, ys, vs])
}

/// `(x, y, v)` triples from a batch whose first three columns are `x`, `y`, `v`.
pub(crate) fn triples(batch: &RecordBatch) -> Vec<(i64, i64, f64)> {
    let xs = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 x");
    let ys = batch
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 y");
    let vs = batch
        .column(2)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("float64 v");
    (0..batch.num_rows())
        .map(|i| (xs.value(i), ys.value(i), vs.value(i)))
        .collect()
}
