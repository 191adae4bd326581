//! Schema descriptor for sparse arrays.
//!
//! A [`SchemaDescriptor`] is the immutable description of an array's index
//! space (ordered [`Dimension`]s with inclusive integer domains) and of the
//! values stored per populated cell (ordered [`Attribute`]s). It is validated
//! once on construction, including when it is decoded from the log, so every
//! descriptor in memory upholds:
//!
//! - at least one dimension,
//! - non-empty names, unique across dimensions and attributes,
//! - dimension types whose values fit in `i64`,
//! - `lower <= upper`, bounds representable in the dimension type, and a
//!   capacity (`upper - lower + 1`) that fits in `i64`.
use std::{collections::HashSet, fmt, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Logical element types for dimensions and attributes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LogicalDataType {
    /// Boolean value.
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit unsigned integer (attributes only).
    UInt64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 encoded string.
    Utf8,
    /// Variable-length binary data.
    Binary,
}

impl LogicalDataType {
    /// Arrow data type used for columns of this logical type.
    pub fn to_arrow_datatype(self) -> DataType {
        match self {
            LogicalDataType::Bool => DataType::Boolean,
            LogicalDataType::Int8 => DataType::Int8,
            LogicalDataType::Int16 => DataType::Int16,
            LogicalDataType::Int32 => DataType::Int32,
            LogicalDataType::Int64 => DataType::Int64,
            LogicalDataType::UInt8 => DataType::UInt8,
            LogicalDataType::UInt16 => DataType::UInt16,
            LogicalDataType::UInt32 => DataType::UInt32,
            LogicalDataType::UInt64 => DataType::UInt64,
            LogicalDataType::Float32 => DataType::Float32,
            LogicalDataType::Float64 => DataType::Float64,
            LogicalDataType::Utf8 => DataType::Utf8,
            LogicalDataType::Binary => DataType::Binary,
        }
    }

    /// Inclusive value range for types usable as dimensions.
    ///
    /// Returns `None` for types that cannot index a dimension.
    pub fn dimension_range(self) -> Option<(i64, i64)> {
        match self {
            LogicalDataType::Int8 => Some((i8::MIN.into(), i8::MAX.into())),
            LogicalDataType::Int16 => Some((i16::MIN.into(), i16::MAX.into())),
            LogicalDataType::Int32 => Some((i32::MIN.into(), i32::MAX.into())),
            LogicalDataType::Int64 => Some((i64::MIN, i64::MAX)),
            LogicalDataType::UInt8 => Some((0, u8::MAX.into())),
            LogicalDataType::UInt16 => Some((0, u16::MAX.into())),
            LogicalDataType::UInt32 => Some((0, u32::MAX.into())),
            _ => None,
        }
    }

    /// Whether values of this type can be used as dimension coordinates.
    pub fn is_dimension_type(self) -> bool {
        self.dimension_range().is_some()
    }
}

impl fmt::Display for LogicalDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalDataType::Bool => "bool",
            LogicalDataType::Int8 => "int8",
            LogicalDataType::Int16 => "int16",
            LogicalDataType::Int32 => "int32",
            LogicalDataType::Int64 => "int64",
            LogicalDataType::UInt8 => "uint8",
            LogicalDataType::UInt16 => "uint16",
            LogicalDataType::UInt32 => "uint32",
            LogicalDataType::UInt64 => "uint64",
            LogicalDataType::Float32 => "float32",
            LogicalDataType::Float64 => "float64",
            LogicalDataType::Utf8 => "utf8",
            LogicalDataType::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// A named axis of the coordinate space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimension {
    /// Dimension name, also the column name in buffer batches.
    pub name: String,
    /// Coordinate type.
    pub data_type: LogicalDataType,
    /// Inclusive `[lower, upper]` bounds of addressable coordinates.
    pub domain: (i64, i64),
}

impl Dimension {
    /// Create a dimension over the inclusive domain `[lower, upper]`.
    pub fn new(
        name: impl Into<String>,
        data_type: LogicalDataType,
        lower: i64,
        upper: i64,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            domain: (lower, upper),
        }
    }

    /// Number of addressable coordinates along this dimension.
    pub fn capacity(&self) -> i64 {
        let (lower, upper) = self.domain;
        // Validated descriptors guarantee the result fits.
        (i128::from(upper) - i128::from(lower) + 1) as i64
    }

    /// Whether `value` lies inside the domain.
    pub fn contains(&self, value: i64) -> bool {
        let (lower, upper) = self.domain;
        lower <= value && value <= upper
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let (lower, upper) = self.domain;
        let Some((type_min, type_max)) = self.data_type.dimension_range() else {
            return UnsupportedDimensionTypeSnafu {
                dimension: self.name.clone(),
                data_type: self.data_type,
            }
            .fail();
        };

        ensure!(
            lower <= upper,
            InvalidDomainSnafu {
                dimension: self.name.clone(),
                lower,
                upper,
            }
        );

        ensure!(
            type_min <= lower && upper <= type_max,
            DomainOutOfTypeRangeSnafu {
                dimension: self.name.clone(),
                data_type: self.data_type,
                lower,
                upper,
            }
        );

        let capacity = i128::from(upper) - i128::from(lower) + 1;
        ensure!(
            capacity <= i128::from(i64::MAX),
            CapacityOverflowSnafu {
                dimension: self.name.clone(),
            }
        );

        Ok(())
    }
}

/// A named value stored per populated cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name, also the column name in buffer batches.
    pub name: String,
    /// Value type.
    pub data_type: LogicalDataType,
    /// Whether cells may hold a null value for this attribute.
    #[serde(default)]
    pub nullable: bool,
}

impl Attribute {
    /// Create a non-nullable attribute.
    pub fn new(name: impl Into<String>, data_type: LogicalDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    /// Set whether the attribute accepts nulls.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Reasons a schema descriptor is rejected.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// The schema declares no dimensions.
    #[snafu(display("Schema must declare at least one dimension"))]
    NoDimensions,

    /// A dimension or attribute has an empty name.
    #[snafu(display("Column at position {position} has an empty name"))]
    EmptyName {
        /// Zero-based position across dimensions followed by attributes.
        position: usize,
    },

    /// Two columns share a name.
    #[snafu(display("Duplicate column name {name:?} in schema"))]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// The dimension type cannot index coordinates.
    #[snafu(display("Dimension {dimension:?} has unsupported type {data_type}"))]
    UnsupportedDimensionType {
        /// Offending dimension.
        dimension: String,
        /// Declared type.
        data_type: LogicalDataType,
    },

    /// `lower > upper`.
    #[snafu(display("Dimension {dimension:?} has empty domain [{lower}, {upper}]"))]
    InvalidDomain {
        /// Offending dimension.
        dimension: String,
        /// Declared lower bound.
        lower: i64,
        /// Declared upper bound.
        upper: i64,
    },

    /// The domain does not fit the dimension type.
    #[snafu(display(
        "Dimension {dimension:?} domain [{lower}, {upper}] exceeds the range of {data_type}"
    ))]
    DomainOutOfTypeRange {
        /// Offending dimension.
        dimension: String,
        /// Declared type.
        data_type: LogicalDataType,
        /// Declared lower bound.
        lower: i64,
        /// Declared upper bound.
        upper: i64,
    },

    /// `upper - lower + 1` does not fit in `i64`.
    #[snafu(display("Dimension {dimension:?} capacity overflows i64"))]
    CapacityOverflow {
        /// Offending dimension.
        dimension: String,
    },
}

/// Immutable description of an array's dimensions and attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "SchemaDescriptorRepr")]
pub struct SchemaDescriptor {
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
}

#[derive(Deserialize)]
struct SchemaDescriptorRepr {
    dimensions: Vec<Dimension>,
    #[serde(default)]
    attributes: Vec<Attribute>,
}

impl TryFrom<SchemaDescriptorRepr> for SchemaDescriptor {
    type Error = SchemaError;

    fn try_from(repr: SchemaDescriptorRepr) -> Result<Self, Self::Error> {
        SchemaDescriptor::new(repr.dimensions, repr.attributes)
    }
}

impl SchemaDescriptor {
    /// Name of the single attribute created by [`SchemaDescriptor::for_shape`].
    pub const DATA_ATTRIBUTE: &str = "soma_data";
    /// Prefix of the dimension names created by [`SchemaDescriptor::for_shape`].
    pub const DIMENSION_PREFIX: &str = "soma_dim_";

    /// Build and validate a schema descriptor.
    pub fn new(
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
    ) -> Result<Self, SchemaError> {
        ensure!(!dimensions.is_empty(), NoDimensionsSnafu);

        let mut seen = HashSet::with_capacity(dimensions.len() + attributes.len());
        let names = dimensions
            .iter()
            .map(|d| d.name.as_str())
            .chain(attributes.iter().map(|a| a.name.as_str()));
        for (position, name) in names.enumerate() {
            ensure!(!name.is_empty(), EmptyNameSnafu { position });
            ensure!(seen.insert(name), DuplicateNameSnafu { name });
        }

        for dim in &dimensions {
            dim.validate()?;
        }

        Ok(Self {
            dimensions,
            attributes,
        })
    }

    /// Schema with `shape.len()` int64 dimensions `soma_dim_N` over
    /// `[0, extent - 1]` and a single non-nullable `soma_data` attribute.
    pub fn for_shape(value_type: LogicalDataType, shape: &[i64]) -> Result<Self, SchemaError> {
        let dimensions = shape
            .iter()
            .enumerate()
            .map(|(i, &extent)| {
                Dimension::new(
                    format!("{}{i}", Self::DIMENSION_PREFIX),
                    LogicalDataType::Int64,
                    0,
                    extent.saturating_sub(1),
                )
            })
            .collect();
        Self::new(
            dimensions,
            vec![Attribute::new(Self::DATA_ATTRIBUTE, value_type)],
        )
    }

    /// Dimensions in declared order.
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Attributes in declared order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.dimensions.len()
    }

    /// Capacity of each dimension in declared order.
    pub fn shape(&self) -> Vec<i64> {
        self.dimensions.iter().map(Dimension::capacity).collect()
    }

    /// Look up a dimension by name.
    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    /// Position of a dimension in declared order.
    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Whether `name` is a dimension or attribute of this schema.
    pub fn has_column(&self, name: &str) -> bool {
        self.dimension(name).is_some() || self.attribute(name).is_some()
    }

    /// Dimension names in declared order.
    pub fn dimension_names(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.name.clone()).collect()
    }

    /// Arrow schema for stored cells: dimensions (non-nullable) then attributes.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .dimensions
            .iter()
            .map(|d| Field::new(d.name.clone(), d.data_type.to_arrow_datatype(), false))
            .chain(self.attributes.iter().map(|a| {
                Field::new(a.name.clone(), a.data_type.to_arrow_datatype(), a.nullable)
            }))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dims[")?;
        for (i, d) in self.dimensions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {} [{}, {}]", d.name, d.data_type, d.domain.0, d.domain.1)?;
        }
        write!(f, "] attrs[")?;
        for (i, a) in self.attributes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if a.nullable {
                write!(f, "{}?: {}", a.name, a.data_type)?;
            } else {
                write!(f, "{}: {}", a.name, a.data_type)?;
            }
        }
        write!(f, "]")
    }
}
