//! Array-level metadata written by the bootstrap commit.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::schema::SchemaDescriptor;

/// Prefix shared by every metadata key the array manages itself.
pub const RESERVED_KEY_PREFIX: &str = "soma_";
/// Metadata key holding the object type name.
pub const OBJECT_TYPE_KEY: &str = "soma_object_type";
/// Metadata key holding the encoding version.
pub const ENCODING_VERSION_KEY: &str = "soma_encoding_version";
/// Encoding version written at create time.
pub const ENCODING_VERSION: &str = "1.1.0";

/// Current on-disk format version for [`ArrayMeta`].
pub const FORMAT_VERSION: u32 = 1;

/// Storage kind of an array.
///
/// JSON layout example: `"kind": "Sparse"`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArrayKind {
    /// Only populated cells are stored.
    Sparse,
    /// Every cell of the domain is materialized. Recognized but not creatable.
    Dense,
}

impl ArrayKind {
    /// Object type name reported for arrays of this kind.
    pub fn object_type(self) -> &'static str {
        match self {
            ArrayKind::Sparse => "SOMASparseNDArray",
            ArrayKind::Dense => "SOMADenseNDArray",
        }
    }
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.object_type())
    }
}

/// Array-level metadata describing kind and schema.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArrayMeta {
    /// Storage kind.
    pub kind: ArrayKind,
    /// Dimensions and attributes, fixed at create time.
    pub schema: SchemaDescriptor,
    /// Wall-clock creation time, RFC3339 UTC.
    pub created_at: DateTime<Utc>,
    /// On-disk format version.
    pub format_version: u32,
}

impl ArrayMeta {
    /// Metadata for a new sparse array created now.
    pub fn new_sparse(schema: SchemaDescriptor) -> Self {
        Self {
            kind: ArrayKind::Sparse,
            schema,
            created_at: Utc::now(),
            format_version: FORMAT_VERSION,
        }
    }
}

/// Whether `key` belongs to the reserved namespace.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::schema::{Dimension, LogicalDataType};

    #[test]
    fn kind_serializes_as_bare_name() {
        let json = serde_json::to_string(&ArrayKind::Sparse).expect("serialize");
        assert_eq!(json, r#""Sparse""#);
        assert_eq!(ArrayKind::Dense.object_type(), "SOMADenseNDArray");
    }

    #[test]
    fn array_meta_roundtrip() {
        let schema = SchemaDescriptor::new(
            vec![Dimension::new("x", LogicalDataType::Int64, 0, 9)],
            vec![],
        )
        .expect("valid schema");
        let meta = ArrayMeta::new_sparse(schema);

        let json = serde_json::to_string(&meta).expect("serialize");
        let decoded: ArrayMeta = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(meta, decoded);
        assert_eq!(decoded.format_version, FORMAT_VERSION);
    }

    #[test]
    fn reserved_prefix() {
        assert!(is_reserved_key(OBJECT_TYPE_KEY));
        assert!(is_reserved_key("soma_anything"));
        assert!(!is_reserved_key("somatic"));
    }
}
