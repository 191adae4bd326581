//! Values stored in per-array key/value metadata.
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single metadata value.
///
/// Serialized untagged, so JSON booleans, integers, floats and strings map
/// directly onto the variants.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int64(i64),
    /// Finite floating point number.
    Float64(f64),
    /// UTF-8 string.
    String(String),
}

impl MetadataValue {
    /// String payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(v) => v.fmt(f),
            MetadataValue::Int64(v) => v.fmt(f),
            MetadataValue::Float64(v) => v.fmt(f),
            MetadataValue::String(v) => v.fmt(f),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int64(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float64(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_keeps_variant() {
        let values = vec![
            MetadataValue::Bool(true),
            MetadataValue::Int64(-3),
            MetadataValue::Float64(1.0),
            MetadataValue::Float64(2.5),
            MetadataValue::from("abc"),
        ];
        for value in values {
            let json = serde_json::to_string(&value).expect("serialize");
            let decoded: MetadataValue = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(value, decoded, "json was {json}");
        }
    }

    #[test]
    fn accessors() {
        assert_eq!(MetadataValue::from("x").as_str(), Some("x"));
        assert_eq!(MetadataValue::from(7_i64).as_i64(), Some(7));
        assert_eq!(MetadataValue::from(true).as_i64(), None);
    }
}
