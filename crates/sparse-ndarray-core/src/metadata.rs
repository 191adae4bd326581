//! Pure metadata model recorded in the transaction log.
//!
//! Everything under `metadata/` is plain data plus non-IO validation. Code that
//! touches storage lives in [`crate::transaction_log`] and [`crate::engine`].

pub mod array_meta;
pub mod fragments;
pub mod schema;
pub mod values;

pub use array_meta::{ArrayKind, ArrayMeta};
pub use fragments::{FileFormat, FragmentId, FragmentMeta};
pub use schema::{Attribute, Dimension, LogicalDataType, SchemaDescriptor, SchemaError};
pub use values::MetadataValue;
