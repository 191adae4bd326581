//! Column-oriented buffers exchanged with the array handle.
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::datatypes::{Field, Schema};
use arrow::error::ArrowError;

/// Ordered set of named Arrow columns describing a run of cells.
///
/// Produced by [`crate::SparseNDArray::read_next`] and consumed by
/// [`crate::SparseNDArray::write`]. Construction does not validate; a batch
/// handed to `write` is checked against the array schema there.
#[derive(Debug, Clone, Default)]
pub struct BufferBatch {
    columns: Vec<(String, ArrayRef)>,
}

impl BufferBatch {
    /// Empty batch with no columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn with_column(mut self, name: impl Into<String>, array: ArrayRef) -> Self {
        self.push_column(name, array);
        self
    }

    /// Append a column in place.
    pub fn push_column(&mut self, name: impl Into<String>, array: ArrayRef) {
        self.columns.push((name.into(), array));
    }

    /// Columns of a record batch, keyed by field name.
    pub fn from_record_batch(batch: &RecordBatch) -> Self {
        let columns = batch
            .schema()
            .fields()
            .iter()
            .zip(batch.columns())
            .map(|(field, array)| (field.name().clone(), Arc::clone(array)))
            .collect();
        Self { columns }
    }

    /// Convert into a record batch. Every field is declared nullable.
    pub fn into_record_batch(self) -> Result<RecordBatch, ArrowError> {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|(name, array)| Field::new(name.clone(), array.data_type().clone(), true))
            .collect();
        let arrays = self.columns.into_iter().map(|(_, array)| array).collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
    }

    /// Column by name (first match).
    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, array)| array)
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Number of cells, taken from the first column.
    pub fn num_cells(&self) -> usize {
        self.columns.first().map_or(0, |(_, array)| array.len())
    }

    /// Whether the batch holds no cells.
    pub fn is_empty(&self) -> bool {
        self.num_cells() == 0
    }

    /// Iterate `(name, array)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayRef)> {
        self.columns.iter().map(|(name, array)| (name.as_str(), array))
    }

    /// Take the columns out of the batch.
    pub fn into_columns(self) -> Vec<(String, ArrayRef)> {
        self.columns
    }
}

impl From<RecordBatch> for BufferBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::from_record_batch(&batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    #[test]
    fn builds_and_looks_up_columns() {
        let batch = BufferBatch::new()
            .with_column("x", Arc::new(Int64Array::from(vec![1, 2, 3])))
            .with_column("name", Arc::new(StringArray::from(vec!["a", "b", "c"])));

        assert_eq!(batch.column_names(), vec!["x", "name"]);
        assert_eq!(batch.num_cells(), 3);
        assert_eq!(batch.num_columns(), 2);
        assert!(batch.column("name").is_some());
        assert!(batch.column("missing").is_none());
        assert!(BufferBatch::new().is_empty());
    }

    #[test]
    fn record_batch_conversion_keeps_order() -> Result<(), ArrowError> {
        let batch = BufferBatch::new()
            .with_column("b", Arc::new(Int64Array::from(vec![1])))
            .with_column("a", Arc::new(Int64Array::from(vec![2])));

        let record = batch.into_record_batch()?;
        assert_eq!(record.schema().field(0).name(), "b");

        let back = BufferBatch::from(record);
        assert_eq!(back.column_names(), vec!["b", "a"]);
        Ok(())
    }

    #[test]
    fn unequal_lengths_fail_conversion() {
        let batch = BufferBatch::new()
            .with_column("a", Arc::new(Int64Array::from(vec![1, 2])))
            .with_column("b", Arc::new(Int64Array::from(vec![1])));
        assert!(batch.into_record_batch().is_err());
    }
}
