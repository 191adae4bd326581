//! Log actions and commit payload definitions.
//!
//! Each commit file stores a [`Commit`] containing ordered [`LogAction`] values.
//! The data they carry is defined under [`crate::metadata`]; this module only
//! holds the log's verbs.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::{ArrayMeta, FragmentMeta, MetadataValue};

/// An action recorded in a commit, applied in order during state rebuild.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum LogAction {
    /// Bootstrap the array: kind and schema.
    CreateArray(ArrayMeta),

    /// Make a fragment file visible.
    AddFragment(FragmentMeta),

    /// Insert or replace a metadata entry.
    PutMetadata {
        /// Metadata key.
        key: String,
        /// New value.
        value: MetadataValue,
    },

    /// Remove a metadata entry. Removing an absent key is a no-op.
    DeleteMetadata {
        /// Metadata key.
        key: String,
    },
}

/// A single, immutable commit in the array log.
///
/// Commits are written to files such as `_array_log/0000000001.json`. The
/// version field must match the file name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    /// The version number of this commit (monotonic, starting from 1).
    pub version: u64,

    /// The version the writer believed was current when preparing this commit.
    pub base_version: u64,

    /// Logical stamp in milliseconds since the Unix epoch, used for time travel.
    pub timestamp_ms: u64,

    /// Wall-clock time the commit file was written, RFC3339 UTC.
    pub committed_at: DateTime<Utc>,

    /// Ordered actions applied by this commit.
    pub actions: Vec<LogAction>,
}
