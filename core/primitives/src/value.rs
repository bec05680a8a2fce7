use crate::types::{LogicalType, TimeUnit};
use crate::TypeError;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A single logical value: one variant per logical type plus `Null`.
///
/// Equality, ordering and hashing are defined on the underlying physical
/// payload. Integral values of different widths and signedness compare
/// numerically; a float equals an integer only when the conversion is exact.
/// `Null` orders below every other value. Column naming does not live here:
/// aliases are carried by vectors and column definitions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    UInt128(u128),
    Float(f32),
    Double(f64),
    Decimal { value: i64, width: u8, scale: u8 },
    String(String),
    Timestamp { value: i64, unit: TimeUnit },
    Enum(u32),
    Struct(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

/// Numeric payload, promoted for cross-width comparison and arithmetic.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    I(i128),
    U(u128),
    F(f64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn logical_type(&self) -> LogicalType {
        match self {
            Value::Null => LogicalType::Null,
            Value::Boolean(_) => LogicalType::Boolean,
            Value::Int8(_) => LogicalType::Int8,
            Value::Int16(_) => LogicalType::Int16,
            Value::Int32(_) => LogicalType::Int32,
            Value::Int64(_) => LogicalType::Int64,
            Value::Int128(_) => LogicalType::Int128,
            Value::UInt8(_) => LogicalType::UInt8,
            Value::UInt16(_) => LogicalType::UInt16,
            Value::UInt32(_) => LogicalType::UInt32,
            Value::UInt64(_) => LogicalType::UInt64,
            Value::UInt128(_) => LogicalType::UInt128,
            Value::Float(_) => LogicalType::Float,
            Value::Double(_) => LogicalType::Double,
            Value::Decimal { width, scale, .. } => {
                LogicalType::Decimal { width: *width, scale: *scale }
            }
            Value::String(_) => LogicalType::String,
            Value::Timestamp { unit, .. } => LogicalType::Timestamp(*unit),
            Value::Enum(_) => LogicalType::Enum { values: vec![] },
            Value::Struct(fields) => LogicalType::Struct {
                fields: fields.iter().map(|(n, v)| (n.clone(), v.logical_type())).collect(),
            },
            Value::List(items) => LogicalType::List {
                child: Box::new(
                    items.first().map(Value::logical_type).unwrap_or(LogicalType::Null),
                ),
            },
        }
    }

    pub(crate) fn numeric(&self) -> Option<Num> {
        Some(match self {
            Value::Int8(v) => Num::I(*v as i128),
            Value::Int16(v) => Num::I(*v as i128),
            Value::Int32(v) => Num::I(*v as i128),
            Value::Int64(v) => Num::I(*v as i128),
            Value::Int128(v) => Num::I(*v),
            Value::UInt8(v) => Num::U(*v as u128),
            Value::UInt16(v) => Num::U(*v as u128),
            Value::UInt32(v) => Num::U(*v as u128),
            Value::UInt64(v) => Num::U(*v as u128),
            Value::UInt128(v) => Num::U(*v),
            Value::Float(v) => Num::F(*v as f64),
            Value::Double(v) => Num::F(*v),
            Value::Decimal { value, .. } => Num::I(*value as i128),
            Value::Timestamp { value, .. } => Num::I(*value as i128),
            Value::Enum(v) => Num::U(*v as u128),
            _ => return None,
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.numeric()? {
            Num::I(v) => i64::try_from(v).ok(),
            Num::U(v) => i64::try_from(v).ok(),
            Num::F(v) if v.fract() == 0.0 => Some(v as i64),
            Num::F(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.numeric()? {
            Num::I(v) => Some(v as f64),
            Num::U(v) => Some(v as f64),
            Num::F(v) => Some(v),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Cast to `target`, failing when the conversion loses information in a
    /// way SQL forbids (integral narrowing out of range, non-numeric to
    /// numeric). `Null` casts to anything.
    pub fn cast(&self, target: &LogicalType) -> Result<Value, TypeError> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let bad = || TypeError::BadCast { from: self.logical_type(), to: target.clone() };
        macro_rules! int_cast {
            ($variant:ident, $ty:ty) => {{
                let num = self.numeric().ok_or_else(bad)?;
                let v: $ty = match num {
                    Num::I(v) => <$ty>::try_from(v).map_err(|_| bad())?,
                    Num::U(v) => <$ty>::try_from(v).map_err(|_| bad())?,
                    Num::F(v) => {
                        if v.fract() != 0.0 {
                            return Err(bad());
                        }
                        <$ty>::try_from(v as i128).map_err(|_| bad())?
                    }
                };
                Ok(Value::$variant(v))
            }};
        }
        match target {
            LogicalType::Boolean => self.as_bool().map(Value::Boolean).ok_or_else(bad),
            LogicalType::Int8 => int_cast!(Int8, i8),
            LogicalType::Int16 => int_cast!(Int16, i16),
            LogicalType::Int32 => int_cast!(Int32, i32),
            LogicalType::Int64 => int_cast!(Int64, i64),
            LogicalType::Int128 => match self.numeric().ok_or_else(bad)? {
                Num::I(v) => Ok(Value::Int128(v)),
                Num::U(v) => i128::try_from(v).map(Value::Int128).map_err(|_| bad()),
                Num::F(v) if v.fract() == 0.0 => Ok(Value::Int128(v as i128)),
                Num::F(_) => Err(bad()),
            },
            LogicalType::UInt8 => int_cast!(UInt8, u8),
            LogicalType::UInt16 => int_cast!(UInt16, u16),
            LogicalType::UInt32 => int_cast!(UInt32, u32),
            LogicalType::UInt64 => int_cast!(UInt64, u64),
            LogicalType::UInt128 => match self.numeric().ok_or_else(bad)? {
                Num::I(v) => u128::try_from(v).map(Value::UInt128).map_err(|_| bad()),
                Num::U(v) => Ok(Value::UInt128(v)),
                Num::F(v) if v.fract() == 0.0 && v >= 0.0 => Ok(Value::UInt128(v as u128)),
                Num::F(_) => Err(bad()),
            },
            LogicalType::Float => self.as_f64().map(|v| Value::Float(v as f32)).ok_or_else(bad),
            LogicalType::Double => self.as_f64().map(Value::Double).ok_or_else(bad),
            LogicalType::Decimal { width, scale } => {
                let v = self.as_i64().ok_or_else(bad)?;
                Ok(Value::Decimal { value: v, width: *width, scale: *scale })
            }
            LogicalType::String => match self {
                Value::String(s) => Ok(Value::String(s.clone())),
                _ => Err(bad()),
            },
            LogicalType::Timestamp(unit) => {
                let v = self.as_i64().ok_or_else(bad)?;
                Ok(Value::Timestamp { value: v, unit: *unit })
            }
            LogicalType::Enum { .. } => match self.numeric().ok_or_else(bad)? {
                Num::U(v) => u32::try_from(v).map(Value::Enum).map_err(|_| bad()),
                Num::I(v) => u32::try_from(v).map(Value::Enum).map_err(|_| bad()),
                Num::F(_) => Err(bad()),
            },
            LogicalType::Struct { .. } | LogicalType::List { .. } | LogicalType::Null => {
                if self.logical_type().physical_type() == target.physical_type() {
                    Ok(self.clone())
                } else {
                    Err(bad())
                }
            }
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            // All numerics share a rank so they compare by value.
            Value::Int8(_)
            | Value::Int16(_)
            | Value::Int32(_)
            | Value::Int64(_)
            | Value::Int128(_)
            | Value::UInt8(_)
            | Value::UInt16(_)
            | Value::UInt32(_)
            | Value::UInt64(_)
            | Value::UInt128(_)
            | Value::Float(_)
            | Value::Double(_)
            | Value::Decimal { .. }
            | Value::Timestamp { .. }
            | Value::Enum(_) => 2,
            Value::String(_) => 3,
            Value::Struct(_) => 4,
            Value::List(_) => 5,
        }
    }
}

fn cmp_num(a: Num, b: Num) -> Ordering {
    match (a, b) {
        (Num::I(x), Num::I(y)) => x.cmp(&y),
        (Num::U(x), Num::U(y)) => x.cmp(&y),
        (Num::I(x), Num::U(y)) => {
            if x < 0 {
                Ordering::Less
            } else {
                (x as u128).cmp(&y)
            }
        }
        (Num::U(x), Num::I(y)) => cmp_num(Num::I(y), Num::U(x)).reverse(),
        (Num::F(x), Num::F(y)) => x.total_cmp(&y),
        (Num::F(x), Num::I(y)) => x.total_cmp(&(y as f64)),
        (Num::F(x), Num::U(y)) => x.total_cmp(&(y as f64)),
        (Num::I(x), Num::F(y)) => (x as f64).total_cmp(&y),
        (Num::U(x), Num::F(y)) => (x as f64).total_cmp(&y),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> Ordering {
        let rank = self.kind_rank().cmp(&other.kind_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Struct(a), Value::Struct(b)) => {
                a.iter().map(|(_, v)| v).cmp(b.iter().map(|(_, v)| v))
            }
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => cmp_num(x, y),
                _ => Ordering::Equal,
            },
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Boolean(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::String(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Value::Struct(fields) => {
                state.write_u8(4);
                for (_, v) in fields {
                    v.hash(state);
                }
            }
            Value::List(items) => {
                state.write_u8(5);
                for v in items {
                    v.hash(state);
                }
            }
            other => {
                state.write_u8(2);
                // Integral values of equal magnitude must hash identically
                // regardless of their width or signedness; exact-integer
                // floats join them so that Eq and Hash stay consistent.
                match other.numeric().expect("numeric variant") {
                    Num::I(v) => {
                        if let Ok(u) = u128::try_from(v) {
                            state.write_u128(u);
                        } else {
                            state.write_u8(0xff);
                            state.write_i128(v);
                        }
                    }
                    Num::U(v) => state.write_u128(v),
                    Num::F(v) => {
                        if v.fract() == 0.0 && v >= 0.0 && v <= u128::MAX as f64 {
                            state.write_u128(v as u128);
                        } else if v.fract() == 0.0 && v >= i128::MIN as f64 && v < 0.0 {
                            state.write_u8(0xff);
                            state.write_i128(v as i128);
                        } else {
                            state.write_u64(v.to_bits());
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Int128(v) => write!(f, "{v}"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::UInt128(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal { value, scale, .. } => {
                let divisor = 10i64.pow(*scale as u32);
                write!(f, "{}.{:0width$}", value / divisor, (value % divisor).abs(), width = *scale as usize)
            }
            Value::String(s) => write!(f, "{s}"),
            Value::Timestamp { value, .. } => write!(f, "{value}"),
            Value::Enum(tag) => write!(f, "{tag}"),
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}
