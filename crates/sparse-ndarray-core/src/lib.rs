//! Core engine for a log-structured sparse N-dimensional array format.
//!
//! This crate provides the pieces behind `sparse-ndarray-format`:
//!
//! - A strongly-typed schema model: integer dimensions with inclusive
//!   domains and typed attributes (`metadata` module).
//! - An append-only transaction log with version-guard optimistic
//!   concurrency control and timestamp-windowed state rebuilds
//!   (`transaction_log` module).
//! - An async engine that writes immutable Parquet fragments and answers
//!   ordered, deduplicated, chunked reads over them (`engine` module).
//! - The blocking [`SparseNDArray`] handle with its read/write lifecycle
//!   (`sparse_ndarray` module).
//! - Platform configuration and timestamp windows (`config` module) and
//!   local filesystem helpers (`storage` module).
//!
//! ```rust,ignore
//! use sparse_ndarray_core::{Context, LogicalDataType, OpenMode, SchemaDescriptor, SparseNDArray};
//!
//! let ctx = Context::new();
//! let schema = SchemaDescriptor::for_shape(LogicalDataType::Float64, &[10, 10])?;
//! let mut array = SparseNDArray::create("file:///tmp/a", schema, &ctx)?;
//! array.reopen(OpenMode::Write, None)?;
//! array.write(batch)?;
//! array.close()?;
//! ```
#![deny(missing_docs)]
pub mod config;
pub mod engine;
pub mod metadata;
pub mod runtime;
pub mod sparse_ndarray;
pub mod storage;
pub mod transaction_log;

pub use config::{Compression, ConfigError, Context, PlatformConfig, TimestampWindow};
pub use engine::ResultOrder;
pub use metadata::{
    ArrayKind, Attribute, Dimension, LogicalDataType, MetadataValue, SchemaDescriptor, SchemaError,
};
pub use sparse_ndarray::{
    ArrayError, ArrayResult, BufferBatch, HandleState, OpenMode, OpenOptions, SparseNDArray,
};
pub use storage::ArrayLocation;
