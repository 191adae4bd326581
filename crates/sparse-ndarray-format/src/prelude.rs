//! Wrapper prelude.
//!
//! The `sparse-ndarray-format` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::config;
pub use crate::{
    ArrayError, ArrayResult, Attribute, BufferBatch, Context, Dimension, HandleState,
    LogicalDataType, MetadataValue, OpenMode, OpenOptions, PlatformConfig, ResultOrder,
    SchemaDescriptor, SparseNDArray, TimestampWindow,
};
