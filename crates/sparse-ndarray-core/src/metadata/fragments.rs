//! Fragment identifiers and per-file metadata recorded in the log.
//!
//! A fragment is one immutable data file produced by a write session flush.
//! These types are pure data; reading and writing fragment files lives in
//! [`crate::engine::fragments`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical identifier of a fragment file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FragmentId(pub String);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// On-disk format of a fragment.
///
/// JSON layout example: `"format": "parquet"`
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Apache Parquet columnar format.
    #[default]
    Parquet,
}

/// Metadata about a single fragment file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentMeta {
    /// Logical identifier.
    pub fragment_id: FragmentId,

    /// File path relative to the array root (for example `"fragments/frag-....parquet"`).
    pub path: String,

    /// File format.
    #[serde(default)]
    pub format: FileFormat,

    /// Number of cells stored in the file, duplicates included.
    pub cell_count: u64,

    /// Inclusive `(min, max)` coordinate per dimension in schema order.
    pub bounds: Vec<(i64, i64)>,

    /// File size in bytes.
    pub file_size: u64,
}

impl FragmentMeta {
    /// Whether the bounding boxes of `self` and `other` intersect.
    ///
    /// Boxes of different dimensionality are treated as overlapping.
    pub fn overlaps(&self, other: &FragmentMeta) -> bool {
        if self.bounds.len() != other.bounds.len() {
            return true;
        }
        self.bounds
            .iter()
            .zip(&other.bounds)
            .all(|(&(a_lo, a_hi), &(b_lo, b_hi))| a_lo <= b_hi && b_lo <= a_hi)
    }
}

/// Derive a fragment id from its commit stamp, session sequence and bytes.
///
/// The id is `frag-` followed by 32 hex chars of a BLAKE3 digest, so the same
/// payload flushed twice in one session still gets distinct ids.
pub fn fragment_id_v1(stamp_ms: u64, sequence: u64, data: &Bytes) -> FragmentId {
    let mut h = blake3::Hasher::new();
    h.update(b"fragment-id-v1");
    h.update(b"\0");
    h.update(&stamp_ms.to_le_bytes());
    h.update(&sequence.to_le_bytes());
    h.update(b"\0");
    h.update(data.as_ref());
    let hex = h.finalize().to_hex();
    FragmentId(format!("frag-{}", &hex[..32]))
}
