use std::fmt;

/// Time resolution of a timestamp column. The payload is always an `i64`
/// count of the given unit since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, strum::EnumIter,
)]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
}

/// The logical (SQL-facing) type of a column or value.
///
/// This is a closed set: operators and kernels dispatch over it with
/// exhaustive matches, so adding a variant is a cross-cutting change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LogicalType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Float,
    Double,
    /// Fixed-point decimal, stored as an `i64` payload scaled by `scale`.
    Decimal { width: u8, scale: u8 },
    String,
    Timestamp(TimeUnit),
    /// Dictionary-encoded enumeration; the payload is the `u32` tag.
    Enum { values: Vec<String> },
    /// Ordered, named children.
    Struct { fields: Vec<(String, LogicalType)> },
    List { child: Box<LogicalType> },
    /// The type of NULL literals and empty aggregates.
    Null,
}

impl LogicalType {
    /// The storage discriminant used by vectors, segments and kernels.
    pub fn physical_type(&self) -> PhysicalType {
        match self {
            LogicalType::Boolean => PhysicalType::Bool,
            LogicalType::Int8 => PhysicalType::Int8,
            LogicalType::Int16 => PhysicalType::Int16,
            LogicalType::Int32 => PhysicalType::Int32,
            LogicalType::Int64 => PhysicalType::Int64,
            LogicalType::Int128 => PhysicalType::Int128,
            LogicalType::UInt8 => PhysicalType::UInt8,
            LogicalType::UInt16 => PhysicalType::UInt16,
            LogicalType::UInt32 => PhysicalType::UInt32,
            LogicalType::UInt64 => PhysicalType::UInt64,
            LogicalType::UInt128 => PhysicalType::UInt128,
            LogicalType::Float => PhysicalType::Float32,
            LogicalType::Double => PhysicalType::Float64,
            LogicalType::Decimal { .. } => PhysicalType::Int64,
            LogicalType::String => PhysicalType::Bytes,
            LogicalType::Timestamp(_) => PhysicalType::Int64,
            LogicalType::Enum { .. } => PhysicalType::UInt32,
            LogicalType::Struct { .. } => PhysicalType::Nested,
            LogicalType::List { .. } => PhysicalType::Nested,
            LogicalType::Null => PhysicalType::Nested,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.physical_type().is_numeric()
    }

    pub fn is_integral(&self) -> bool {
        self.physical_type().is_integral()
    }

    /// Stable single-byte tag used by the on-disk catalog and metadata
    /// formats. Nested and parameterized types keep their discriminant only;
    /// their shape is serialized separately where it matters.
    pub fn type_tag(&self) -> u8 {
        match self {
            LogicalType::Boolean => 1,
            LogicalType::Int8 => 2,
            LogicalType::Int16 => 3,
            LogicalType::Int32 => 4,
            LogicalType::Int64 => 5,
            LogicalType::Int128 => 6,
            LogicalType::UInt8 => 7,
            LogicalType::UInt16 => 8,
            LogicalType::UInt32 => 9,
            LogicalType::UInt64 => 10,
            LogicalType::UInt128 => 11,
            LogicalType::Float => 12,
            LogicalType::Double => 13,
            LogicalType::Decimal { .. } => 14,
            LogicalType::String => 15,
            LogicalType::Timestamp(TimeUnit::Second) => 16,
            LogicalType::Timestamp(TimeUnit::Millisecond) => 17,
            LogicalType::Timestamp(TimeUnit::Microsecond) => 18,
            LogicalType::Timestamp(TimeUnit::Nanosecond) => 19,
            LogicalType::Enum { .. } => 20,
            LogicalType::Struct { .. } => 21,
            LogicalType::List { .. } => 22,
            LogicalType::Null => 0,
        }
    }

    /// Inverse of [`LogicalType::type_tag`] for the scalar types that the
    /// catalog persists. Nested types are not reconstructible from the tag
    /// alone and map to `None`.
    pub fn from_type_tag(tag: u8) -> Option<LogicalType> {
        Some(match tag {
            0 => LogicalType::Null,
            1 => LogicalType::Boolean,
            2 => LogicalType::Int8,
            3 => LogicalType::Int16,
            4 => LogicalType::Int32,
            5 => LogicalType::Int64,
            6 => LogicalType::Int128,
            7 => LogicalType::UInt8,
            8 => LogicalType::UInt16,
            9 => LogicalType::UInt32,
            10 => LogicalType::UInt64,
            11 => LogicalType::UInt128,
            12 => LogicalType::Float,
            13 => LogicalType::Double,
            14 => LogicalType::Decimal { width: 18, scale: 3 },
            15 => LogicalType::String,
            16 => LogicalType::Timestamp(TimeUnit::Second),
            17 => LogicalType::Timestamp(TimeUnit::Millisecond),
            18 => LogicalType::Timestamp(TimeUnit::Microsecond),
            19 => LogicalType::Timestamp(TimeUnit::Nanosecond),
            _ => return None,
        })
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Decimal { width, scale } => write!(f, "DECIMAL({width},{scale})"),
            LogicalType::Timestamp(unit) => write!(f, "TIMESTAMP({unit:?})"),
            LogicalType::Enum { .. } => write!(f, "ENUM"),
            LogicalType::Struct { .. } => write!(f, "STRUCT"),
            LogicalType::List { .. } => write!(f, "LIST"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Physical storage type of a vector's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum PhysicalType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Float32,
    Float64,
    Bytes,
    /// Struct, list and null payloads; stored row-wise as values.
    Nested,
}

impl PhysicalType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, PhysicalType::Bytes | PhysicalType::Nested | PhysicalType::Bool)
    }

    pub fn is_integral(self) -> bool {
        self.is_numeric() && !matches!(self, PhysicalType::Float32 | PhysicalType::Float64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, PhysicalType::Float32 | PhysicalType::Float64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PhysicalType::Int8
                | PhysicalType::Int16
                | PhysicalType::Int32
                | PhysicalType::Int64
                | PhysicalType::Int128
        )
    }
}
