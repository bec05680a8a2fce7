use crate::types::{LogicalType, PhysicalType};
use crate::value::Value;
use crate::TypeError;

/// Per-row validity bitmap. `None` bits means "all rows valid", which is the
/// common case and keeps freshly materialized vectors allocation-free.
#[derive(Debug, Clone, Default)]
pub struct Validity {
    bits: Option<Vec<u64>>,
    len: usize,
}

impl Validity {
    pub fn all_valid(len: usize) -> Self {
        Self { bits: None, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_valid(&self, row: usize) -> bool {
        match &self.bits {
            None => true,
            Some(bits) => bits[row / 64] & (1 << (row % 64)) != 0,
        }
    }

    pub fn set_valid(&mut self, row: usize) {
        if let Some(bits) = &mut self.bits {
            bits[row / 64] |= 1 << (row % 64);
        }
    }

    pub fn set_invalid(&mut self, row: usize) {
        self.materialize();
        let bits = self.bits.as_mut().unwrap();
        bits[row / 64] &= !(1 << (row % 64));
    }

    pub fn set(&mut self, row: usize, valid: bool) {
        if valid {
            self.set_valid(row);
        } else {
            self.set_invalid(row);
        }
    }

    /// True when no row is invalid.
    pub fn no_nulls(&self) -> bool {
        match &self.bits {
            None => true,
            Some(bits) => {
                (0..self.len).all(|row| bits[row / 64] & (1 << (row % 64)) != 0)
            }
        }
    }

    pub fn count_invalid(&self) -> usize {
        match &self.bits {
            None => 0,
            Some(_) => (0..self.len).filter(|&row| !self.is_valid(row)).count(),
        }
    }

    pub fn resize(&mut self, len: usize) {
        if let Some(bits) = &mut self.bits {
            let words = len.div_ceil(64);
            // new rows start valid
            bits.resize(words, u64::MAX);
            if len > self.len {
                for row in self.len..len {
                    bits[row / 64] |= 1 << (row % 64);
                }
            }
        }
        self.len = len;
    }

    fn materialize(&mut self) {
        if self.bits.is_none() {
            self.bits = Some(vec![u64::MAX; self.len.div_ceil(64).max(1)]);
        }
    }
}

/// Layout of a vector's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    /// One physical slot per row.
    Flat,
    /// One physical slot broadcast to every row.
    Constant,
}

/// Typed contiguous payload of a vector. String payloads are owned row-wise;
/// struct/list/null payloads fall back to boxed values.
#[derive(Debug, Clone)]
pub enum VectorData {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Int128(Vec<i128>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    UInt128(Vec<u128>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Bytes(Vec<String>),
    Nested(Vec<Value>),
}

macro_rules! for_each_variant {
    ($data:expr, $v:ident, $body:expr) => {
        match $data {
            VectorData::Bool($v) => $body,
            VectorData::Int8($v) => $body,
            VectorData::Int16($v) => $body,
            VectorData::Int32($v) => $body,
            VectorData::Int64($v) => $body,
            VectorData::Int128($v) => $body,
            VectorData::UInt8($v) => $body,
            VectorData::UInt16($v) => $body,
            VectorData::UInt32($v) => $body,
            VectorData::UInt64($v) => $body,
            VectorData::UInt128($v) => $body,
            VectorData::Float32($v) => $body,
            VectorData::Float64($v) => $body,
            VectorData::Bytes($v) => $body,
            VectorData::Nested($v) => $body,
        }
    };
}

impl VectorData {
    fn with_len(physical: PhysicalType, len: usize) -> Self {
        match physical {
            PhysicalType::Bool => VectorData::Bool(vec![false; len]),
            PhysicalType::Int8 => VectorData::Int8(vec![0; len]),
            PhysicalType::Int16 => VectorData::Int16(vec![0; len]),
            PhysicalType::Int32 => VectorData::Int32(vec![0; len]),
            PhysicalType::Int64 => VectorData::Int64(vec![0; len]),
            PhysicalType::Int128 => VectorData::Int128(vec![0; len]),
            PhysicalType::UInt8 => VectorData::UInt8(vec![0; len]),
            PhysicalType::UInt16 => VectorData::UInt16(vec![0; len]),
            PhysicalType::UInt32 => VectorData::UInt32(vec![0; len]),
            PhysicalType::UInt64 => VectorData::UInt64(vec![0; len]),
            PhysicalType::UInt128 => VectorData::UInt128(vec![0; len]),
            PhysicalType::Float32 => VectorData::Float32(vec![0.0; len]),
            PhysicalType::Float64 => VectorData::Float64(vec![0.0; len]),
            PhysicalType::Bytes => VectorData::Bytes(vec![String::new(); len]),
            PhysicalType::Nested => VectorData::Nested(vec![Value::Null; len]),
        }
    }

    fn len(&self) -> usize {
        for_each_variant!(self, v, v.len())
    }

    fn truncate(&mut self, len: usize) {
        for_each_variant!(self, v, v.truncate(len))
    }
}

/// A typed, length-N column of values with a validity bitmap.
#[derive(Debug, Clone)]
pub struct Vector {
    ty: LogicalType,
    alias: Option<String>,
    kind: VectorKind,
    data: VectorData,
    validity: Validity,
}

impl Vector {
    /// A flat vector of `len` default-initialized, valid rows.
    pub fn with_len(ty: LogicalType, len: usize) -> Self {
        let data = VectorData::with_len(ty.physical_type(), len);
        Self { ty, alias: None, kind: VectorKind::Flat, data, validity: Validity::all_valid(len) }
    }

    /// An empty flat vector that values can be pushed into.
    pub fn empty(ty: LogicalType) -> Self {
        Self::with_len(ty, 0)
    }

    /// A constant vector: one slot broadcast to any row index.
    pub fn constant(ty: LogicalType, value: &Value) -> Result<Self, TypeError> {
        let mut this = Self::with_len(ty, 1);
        this.kind = VectorKind::Constant;
        this.set_value(0, value)?;
        Ok(this)
    }

    pub fn ty(&self) -> &LogicalType {
        &self.ty
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.ty.physical_type()
    }

    pub fn kind(&self) -> VectorKind {
        self.kind
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = Some(alias.into());
    }

    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    pub fn validity_mut(&mut self) -> &mut Validity {
        &mut self.validity
    }

    /// Number of physical slots. For a constant vector this is 1 regardless
    /// of the logical row count it is broadcast over.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    fn slot(&self, row: usize) -> usize {
        match self.kind {
            VectorKind::Flat => row,
            VectorKind::Constant => 0,
        }
    }

    pub fn is_null(&self, row: usize) -> bool {
        !self.validity.is_valid(self.slot(row))
    }

    /// Materialize the logical value at `row`.
    pub fn value(&self, row: usize) -> Value {
        let slot = self.slot(row);
        if !self.validity.is_valid(slot) {
            return Value::Null;
        }
        match &self.data {
            VectorData::Bool(v) => Value::Boolean(v[slot]),
            VectorData::Int8(v) => Value::Int8(v[slot]),
            VectorData::Int16(v) => Value::Int16(v[slot]),
            VectorData::Int32(v) => Value::Int32(v[slot]),
            VectorData::Int64(v) => match &self.ty {
                LogicalType::Decimal { width, scale } => {
                    Value::Decimal { value: v[slot], width: *width, scale: *scale }
                }
                LogicalType::Timestamp(unit) => Value::Timestamp { value: v[slot], unit: *unit },
                _ => Value::Int64(v[slot]),
            },
            VectorData::Int128(v) => Value::Int128(v[slot]),
            VectorData::UInt8(v) => Value::UInt8(v[slot]),
            VectorData::UInt16(v) => Value::UInt16(v[slot]),
            VectorData::UInt32(v) => match &self.ty {
                LogicalType::Enum { .. } => Value::Enum(v[slot]),
                _ => Value::UInt32(v[slot]),
            },
            VectorData::UInt64(v) => Value::UInt64(v[slot]),
            VectorData::UInt128(v) => Value::UInt128(v[slot]),
            VectorData::Float32(v) => Value::Float(v[slot]),
            VectorData::Float64(v) => Value::Double(v[slot]),
            VectorData::Bytes(v) => Value::String(v[slot].clone()),
            VectorData::Nested(v) => v[slot].clone(),
        }
    }

    /// Store `value` at `row`, casting to the vector's type when the value
    /// is of a different but convertible type.
    pub fn set_value(&mut self, row: usize, value: &Value) -> Result<(), TypeError> {
        let slot = self.slot(row);
        if slot >= self.data.len() {
            return Err(TypeError::RowOutOfBounds { row, len: self.data.len() });
        }
        if value.is_null() {
            self.validity.set_invalid(slot);
            return Ok(());
        }
        let cast;
        let value = if value.logical_type().physical_type() == self.physical_type() {
            value
        } else {
            cast = value.cast(&self.ty)?;
            &cast
        };
        match (&mut self.data, value) {
            (VectorData::Bool(v), Value::Boolean(b)) => v[slot] = *b,
            (VectorData::Int8(v), Value::Int8(x)) => v[slot] = *x,
            (VectorData::Int16(v), Value::Int16(x)) => v[slot] = *x,
            (VectorData::Int32(v), Value::Int32(x)) => v[slot] = *x,
            (VectorData::Int64(v), Value::Int64(x)) => v[slot] = *x,
            (VectorData::Int64(v), Value::Decimal { value: x, .. }) => v[slot] = *x,
            (VectorData::Int64(v), Value::Timestamp { value: x, .. }) => v[slot] = *x,
            (VectorData::Int128(v), Value::Int128(x)) => v[slot] = *x,
            (VectorData::UInt8(v), Value::UInt8(x)) => v[slot] = *x,
            (VectorData::UInt16(v), Value::UInt16(x)) => v[slot] = *x,
            (VectorData::UInt32(v), Value::UInt32(x)) => v[slot] = *x,
            (VectorData::UInt32(v), Value::Enum(x)) => v[slot] = *x,
            (VectorData::UInt64(v), Value::UInt64(x)) => v[slot] = *x,
            (VectorData::UInt128(v), Value::UInt128(x)) => v[slot] = *x,
            (VectorData::Float32(v), Value::Float(x)) => v[slot] = *x,
            (VectorData::Float64(v), Value::Double(x)) => v[slot] = *x,
            (VectorData::Bytes(v), Value::String(s)) => v[slot] = s.clone(),
            (VectorData::Nested(v), x) => v[slot] = x.clone(),
            _ => {
                return Err(TypeError::Mismatch {
                    expected: self.ty.clone(),
                    actual: value.logical_type(),
                });
            }
        }
        self.validity.set_valid(slot);
        Ok(())
    }

    /// Append one value, growing the vector by a row.
    pub fn push_value(&mut self, value: &Value) -> Result<(), TypeError> {
        debug_assert_eq!(self.kind, VectorKind::Flat);
        let row = self.data.len();
        for_each_variant!(&mut self.data, v, v.push(Default::default()));
        self.validity.resize(row + 1);
        self.set_value(row, value)
    }

    /// Turn a constant vector into a flat vector of `count` rows. Flat
    /// vectors are returned unchanged.
    pub fn flatten(&mut self, count: usize) {
        if self.kind == VectorKind::Flat {
            return;
        }
        let value = self.value(0);
        let mut flat = Vector::with_len(self.ty.clone(), count);
        flat.alias = self.alias.take();
        for row in 0..count {
            // set_value on a same-typed value cannot fail
            let _ = flat.set_value(row, &value);
        }
        *self = flat;
    }

    /// Gather rows by index into a new flat vector.
    pub fn slice(&self, sel: &[usize]) -> Vector {
        let mut out = Vector::with_len(self.ty.clone(), sel.len());
        out.alias = self.alias.clone();
        for (i, &row) in sel.iter().enumerate() {
            let _ = out.set_value(i, &self.value(row));
        }
        out
    }

    pub fn truncate(&mut self, len: usize) {
        if self.kind == VectorKind::Flat {
            self.data.truncate(len);
            self.validity.resize(len);
        }
    }

    pub fn data(&self) -> &VectorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut VectorData {
        &mut self.data
    }
}

macro_rules! typed_accessor {
    ($name:ident, $name_mut:ident, $variant:ident, $ty:ty) => {
        impl Vector {
            /// Raw payload access. Panics on internal type confusion, which
            /// is a bug in the caller's dispatch.
            pub fn $name(&self) -> &[$ty] {
                match &self.data {
                    VectorData::$variant(v) => v,
                    other => panic!(
                        "vector payload is {:?}, not {}",
                        std::mem::discriminant(other),
                        stringify!($variant)
                    ),
                }
            }

            pub fn $name_mut(&mut self) -> &mut [$ty] {
                match &mut self.data {
                    VectorData::$variant(v) => v,
                    _ => panic!("vector payload is not {}", stringify!($variant)),
                }
            }
        }
    };
}

typed_accessor!(bools, bools_mut, Bool, bool);
typed_accessor!(i8s, i8s_mut, Int8, i8);
typed_accessor!(i16s, i16s_mut, Int16, i16);
typed_accessor!(i32s, i32s_mut, Int32, i32);
typed_accessor!(i64s, i64s_mut, Int64, i64);
typed_accessor!(i128s, i128s_mut, Int128, i128);
typed_accessor!(u8s, u8s_mut, UInt8, u8);
typed_accessor!(u16s, u16s_mut, UInt16, u16);
typed_accessor!(u32s, u32s_mut, UInt32, u32);
typed_accessor!(u64s, u64s_mut, UInt64, u64);
typed_accessor!(u128s, u128s_mut, UInt128, u128);
typed_accessor!(f32s, f32s_mut, Float32, f32);
typed_accessor!(f64s, f64s_mut, Float64, f64);
typed_accessor!(strs, strs_mut, Bytes, String);
