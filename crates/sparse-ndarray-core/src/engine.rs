//! Async backing engine: fragment files, queries and ingestion.
//!
//! The engine sits between the blocking array handle and the storage/log
//! layers:
//!
//! - [`fragments`] encodes and decodes immutable Parquet fragment files.
//! - [`query`] turns the visible fragments of a snapshot into an ordered,
//!   deduplicated, chunked stream of record batches, pulled through a
//!   streaming k-way merge (`merge`).
//! - [`ingest`] buffers validated cells during a write session and flushes
//!   them into fragment files.
//!
//! Nothing here knows about handle lifecycle; errors are reported as
//! [`EngineError`] and mapped to caller-facing errors by the handle.
pub mod fragments;
pub mod ingest;
mod merge;
pub mod query;

#[cfg(test)]
pub(crate) mod test_util;

pub use ingest::FragmentWriter;
pub use query::{ArrayScan, ResultOrder, ScanPlan};

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{storage::StorageError, transaction_log::CommitError};

/// Errors raised by the backing engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Storage failure while reading or writing a fragment.
    #[snafu(display("Storage error while accessing fragment data: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Failure in the transaction log.
    #[snafu(display("Transaction log error: {source}"))]
    Commit {
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Parquet decode failure for a fragment.
    #[snafu(display("Parquet read error for fragment at {path}: {source}"))]
    ParquetRead {
        /// Fragment path relative to the array root.
        path: String,
        /// Underlying parquet error.
        source: ParquetError,
    },

    /// Parquet encode failure while flushing a fragment.
    #[snafu(display("Parquet write error: {source}"))]
    ParquetWrite {
        /// Underlying parquet error.
        source: ParquetError,
    },

    /// Arrow compute or conversion failure.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A fragment decoded fine but does not match the array schema.
    #[snafu(display("Fragment at {path} does not match the array schema: {reason}"))]
    CorruptFragment {
        /// Fragment path relative to the array root.
        path: String,
        /// What did not match.
        reason: String,
    },
}
