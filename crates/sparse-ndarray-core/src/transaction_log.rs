//! Append-only array log and materialized array state.
//!
//! Every change to an array is a [`Commit`] stored as one JSON file under
//! `<root>/_array_log/`, plus a `CURRENT` pointer naming the latest version:
//!
//! ```text
//! array_root/
//!   _array_log/
//!     CURRENT                  # latest committed version (e.g. "3\n")
//!     0000000001.json          # bootstrap: CreateArray + reserved metadata
//!     0000000002.json          # a write session: AddFragment*, PutMetadata*
//!     0000000003.json
//!   fragments/
//!     frag-<hash>.parquet
//! ```
//!
//! Commit files are created exactly once; a writer that loses the race for a
//! version sees either [`CommitError::Conflict`] or a storage `AlreadyExists`
//! and may rebase with [`TransactionLogStore::commit_with_retries`].
//!
//! Each commit carries a logical `timestamp_ms` stamp. Readers rebuild an
//! [`ArrayState`] under a [`crate::config::TimestampWindow`]; the bootstrap
//! commit is always applied and every other commit is applied only when its
//! stamp falls inside the window.
pub mod actions;
pub mod array_state;
pub mod log_store;

pub use actions::{Commit, LogAction};
pub use array_state::ArrayState;
pub use log_store::TransactionLogStore;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the commit log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// The caller's expected version does not match the CURRENT pointer.
    #[snafu(display("Commit conflict: expected version {expected}, but CURRENT is {found}"))]
    Conflict {
        /// The version the caller expected to be current.
        expected: u64,
        /// The actual current version found.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the log or CURRENT file.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log or CURRENT file is in an unexpected or malformed state.
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The log has no commits, so there is no array at this location.
    #[snafu(display("No commits found under {location}"))]
    NoCommits {
        /// Array root that was inspected.
        location: String,
    },

    /// Every rebase attempt lost the race for the next version.
    #[snafu(display("Commit gave up after {attempts} conflicting attempts"))]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: usize,
    },
}

impl CommitError {
    /// Whether this error means another writer claimed the version first.
    pub fn is_version_race(&self) -> bool {
        matches!(
            self,
            CommitError::Conflict { .. }
                | CommitError::Storage {
                    source: StorageError::AlreadyExists { .. }
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        ArrayMeta, Dimension, FileFormat, FragmentId, FragmentMeta, LogicalDataType,
        MetadataValue, SchemaDescriptor,
    };
    use chrono::{TimeZone, Utc};

    fn sample_meta() -> ArrayMeta {
        let schema = SchemaDescriptor::new(
            vec![Dimension::new("x", LogicalDataType::Int64, 0, 99)],
            vec![],
        )
        .expect("valid schema");
        ArrayMeta::new_sparse(schema)
    }

    #[test]
    fn commit_json_roundtrip() {
        let commit = Commit {
            version: 2,
            base_version: 1,
            timestamp_ms: 1_700_000_000_000,
            committed_at: Utc
                .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .single()
                .expect("valid UTC timestamp"),
            actions: vec![
                LogAction::CreateArray(sample_meta()),
                LogAction::AddFragment(FragmentMeta {
                    fragment_id: FragmentId("frag-1".to_string()),
                    path: "fragments/frag-1.parquet".to_string(),
                    format: FileFormat::Parquet,
                    cell_count: 10,
                    bounds: vec![(0, 9)],
                    file_size: 512,
                }),
                LogAction::PutMetadata {
                    key: "note".to_string(),
                    value: MetadataValue::from("hello"),
                },
                LogAction::DeleteMetadata {
                    key: "old".to_string(),
                },
            ],
        };

        let json = serde_json::to_string_pretty(&commit).expect("serialize commit");
        let decoded: Commit = serde_json::from_str(&json).expect("deserialize commit");
        assert_eq!(commit, decoded);
    }

    #[test]
    fn delete_metadata_action_layout() {
        let action = LogAction::DeleteMetadata {
            key: "k".to_string(),
        };
        let json = serde_json::to_string(&action).expect("serialize");
        assert_eq!(json, r#"{"DeleteMetadata":{"key":"k"}}"#);
    }
}
