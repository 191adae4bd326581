//! Error types and SNAFU context selectors for [`crate::sparse_ndarray`].
//!
//! Every caller-facing failure of the array handle is an [`ArrayError`].
//! Validation failures are reported before any effect; engine failures keep
//! their [`EngineError`] source for diagnostics.
use std::{fmt, io};

use snafu::prelude::*;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::metadata::{ArrayKind, SchemaError};
use crate::storage::StorageError;

/// Lifecycle state of a handle, as reported by [`ArrayError::InvalidState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// No session is bound.
    Closed,
    /// Bound for reading.
    OpenRead,
    /// Bound for reading, but the cursor failed and must be reopened.
    ReadFailed,
    /// Bound for writing.
    OpenWrite,
    /// Bound for writing, but a flush failed and the session was aborted.
    WriteAborted,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Closed => "closed",
            HandleState::OpenRead => "open for read",
            HandleState::ReadFailed => "open for read (cursor failed)",
            HandleState::OpenWrite => "open for write",
            HandleState::WriteAborted => "open for write (session aborted)",
        };
        f.write_str(name)
    }
}

/// Errors from sparse array handle operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArrayError {
    /// `create` found an array already present at the URI.
    #[snafu(display("An array already exists at {uri}"))]
    AlreadyExists {
        /// Target URI.
        uri: String,
    },

    /// No array exists at the URI.
    #[snafu(display("No array found at {uri}"))]
    NotFound {
        /// Target URI.
        uri: String,
    },

    /// The schema descriptor was rejected.
    #[snafu(display("Invalid schema: {source}"))]
    InvalidSchema {
        /// Specific cause.
        source: SchemaError,
    },

    /// An index column is not a dimension, or is selected twice.
    #[snafu(display("Invalid index column {column:?}"))]
    InvalidIndexColumn {
        /// Offending column name.
        column: String,
    },

    /// A write batch names a column that is not in the schema.
    #[snafu(display("Unknown column {column:?} in write batch"))]
    UnknownColumn {
        /// Offending column name.
        column: String,
    },

    /// A write batch is structurally invalid.
    #[snafu(display("Malformed write batch: {reason}"))]
    MalformedBatch {
        /// What is wrong with the batch.
        reason: String,
    },

    /// A write batch addresses a coordinate outside the dimension domain.
    #[snafu(display(
        "Coordinate {value} for dimension {dimension:?} is outside domain [{lower}, {upper}]"
    ))]
    CoordinateOutOfDomain {
        /// Dimension name.
        dimension: String,
        /// Offending coordinate.
        value: i64,
        /// Domain lower bound.
        lower: i64,
        /// Domain upper bound.
        upper: i64,
    },

    /// The operation is not allowed in the handle's current state.
    #[snafu(display("Cannot {operation} while the array is {state}"))]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// State at the time of the call.
        state: HandleState,
    },

    /// The engine failed while producing read results.
    #[snafu(display("Read failed: {source}"))]
    ReadFailure {
        /// Underlying engine error.
        source: EngineError,
    },

    /// The engine failed while persisting written cells.
    #[snafu(display("Write failed: {source}"))]
    WriteFailure {
        /// Underlying engine error.
        source: EngineError,
    },

    /// `close` on a write session that was aborted by an earlier failure.
    #[snafu(display("Write session was aborted; nothing was committed"))]
    SessionAborted,

    /// The stored array is not sparse.
    #[snafu(display("Array kind is {kind}, expected SOMASparseNDArray"))]
    WrongArrayKind {
        /// Kind found in the log.
        kind: ArrayKind,
    },

    /// The metadata key is reserved for the array itself.
    #[snafu(display("Metadata key {key:?} is reserved"))]
    ReservedMetadataKey {
        /// Offending key.
        key: String,
    },

    /// The metadata key or value cannot be stored.
    #[snafu(display("Invalid metadata for key {key:?}: {reason}"))]
    InvalidMetadataValue {
        /// Target key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Platform configuration could not be parsed.
    #[snafu(display("Invalid configuration: {source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },

    /// The URI does not name a supported location.
    #[snafu(display("Invalid array location: {source}"))]
    Location {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The async runtime could not be started.
    #[snafu(display("Failed to start the I/O runtime: {source}"))]
    Runtime {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The engine failed while binding an array.
    #[snafu(display("Failed to open array at {uri}: {source}"))]
    Open {
        /// Target URI.
        uri: String,
        /// Underlying engine error.
        source: EngineError,
    },

    /// The engine failed while creating an array.
    #[snafu(display("Failed to create array at {uri}: {source}"))]
    Create {
        /// Target URI.
        uri: String,
        /// Underlying engine error.
        source: EngineError,
    },
}

impl ArrayError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only engine I/O failures qualify; validation and state errors repeat
    /// deterministically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArrayError::ReadFailure { .. } | ArrayError::WriteFailure { .. }
        )
    }
}

impl From<SchemaError> for ArrayError {
    fn from(source: SchemaError) -> Self {
        ArrayError::InvalidSchema { source }
    }
}

impl From<ConfigError> for ArrayError {
    fn from(source: ConfigError) -> Self {
        ArrayError::Config { source }
    }
}

/// Convenience alias for handle results.
#[allow(clippy::result_large_err)]
pub type ArrayResult<T> = Result<T, ArrayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_engine_failures_are_retryable() {
        let io = || EngineError::Storage {
            source: StorageError::UnsupportedUri {
                uri: "x".to_string(),
                reason: "test".to_string(),
                backtrace: snafu::Backtrace::capture(),
            },
        };
        assert!(ArrayError::ReadFailure { source: io() }.is_retryable());
        assert!(ArrayError::WriteFailure { source: io() }.is_retryable());
        assert!(!ArrayError::SessionAborted.is_retryable());
        assert!(
            !ArrayError::InvalidState {
                operation: "write",
                state: HandleState::OpenRead,
            }
            .is_retryable()
        );
    }

    #[test]
    fn messages_name_the_problem() {
        let err = ArrayError::CoordinateOutOfDomain {
            dimension: "x".to_string(),
            value: 12,
            lower: 0,
            upper: 9,
        };
        assert_eq!(
            err.to_string(),
            r#"Coordinate 12 for dimension "x" is outside domain [0, 9]"#
        );

        let err = ArrayError::InvalidState {
            operation: "read",
            state: HandleState::OpenWrite,
        };
        assert_eq!(err.to_string(), "Cannot read while the array is open for write");
    }
}
