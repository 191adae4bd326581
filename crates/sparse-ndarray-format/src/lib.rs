//! # sparse-ndarray-format
//!
//! Sparse N-dimensional arrays stored as an append-only log of immutable
//! Parquet fragments, with time travel over commit stamps.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sparse_ndarray_format::prelude::*;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Platform configuration namespace.
pub mod config {
    pub use sparse_ndarray_core::config::{
        Compression, ConfigError, Context, PlatformConfig, READ_BATCH_CELLS_KEY,
        TimestampWindow, WRITE_COMMIT_RETRIES_KEY, WRITE_COMPRESSION_KEY, WRITE_FLUSH_CELLS_KEY,
    };
}

pub use sparse_ndarray_core::metadata::{
    ArrayKind, Attribute, Dimension, LogicalDataType, MetadataValue, SchemaDescriptor, SchemaError,
};
pub use sparse_ndarray_core::storage::ArrayLocation;
pub use sparse_ndarray_core::{
    ArrayError, ArrayResult, BufferBatch, Context, HandleState, OpenMode, OpenOptions,
    PlatformConfig, ResultOrder, SparseNDArray, TimestampWindow,
};
