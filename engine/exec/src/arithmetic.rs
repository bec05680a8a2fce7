//! Type-dispatched binary and unary arithmetic over vectors.
//!
//! Promotion follows PostgreSQL precision rules: any float operand (and any
//! int128 × float pairing) promotes the result to DOUBLE; integral pairs
//! promote to the wider of the two, widening once more when signedness
//! differs. Nulls propagate; a zero divisor nullifies the affected rows.

use crate::{ExecError, Result};
use otter_plan::ArithmeticOp;
use otter_primitives::{LogicalType, PhysicalType, Value, Vector};

/// The common result type of a binary arithmetic expression.
pub fn promote_pair(left: &LogicalType, right: &LogicalType) -> Result<LogicalType> {
    let lp = left.physical_type();
    let rp = right.physical_type();
    if !lp.is_numeric() || !rp.is_numeric() {
        return Err(ExecError::NonNumericArithmetic);
    }
    if lp.is_float() || rp.is_float() {
        return Ok(LogicalType::Double);
    }

    fn width(p: PhysicalType) -> u8 {
        match p {
            PhysicalType::Int8 | PhysicalType::UInt8 => 1,
            PhysicalType::Int16 | PhysicalType::UInt16 => 2,
            PhysicalType::Int32 | PhysicalType::UInt32 => 4,
            _ => 8,
        }
    }
    fn is_wide(p: PhysicalType) -> bool {
        matches!(p, PhysicalType::Int128 | PhysicalType::UInt128)
    }

    if is_wide(lp) || is_wide(rp) {
        return Ok(if lp.is_signed() || rp.is_signed() {
            LogicalType::Int128
        } else if lp == PhysicalType::UInt128 || rp == PhysicalType::UInt128 {
            LogicalType::UInt128
        } else {
            LogicalType::Int128
        });
    }

    let w = width(lp).max(width(rp));
    let mixed_sign = lp.is_signed() != rp.is_signed();
    let signed = lp.is_signed() || rp.is_signed();
    // differing signedness widens once so the unsigned side still fits
    let w = if mixed_sign { (w * 2).min(16) } else { w };
    Ok(match (signed, w) {
        (true, 1) => LogicalType::Int8,
        (true, 2) => LogicalType::Int16,
        (true, 4) => LogicalType::Int32,
        (true, 8) => LogicalType::Int64,
        (true, _) => LogicalType::Int128,
        (false, 1) => LogicalType::UInt8,
        (false, 2) => LogicalType::UInt16,
        (false, 4) => LogicalType::UInt32,
        (false, 8) => LogicalType::UInt64,
        (false, _) => LogicalType::UInt128,
    })
}

fn is_divide(op: ArithmeticOp) -> bool {
    matches!(op, ArithmeticOp::Divide | ArithmeticOp::Modulo)
}

fn apply_f64(op: ArithmeticOp, a: f64, b: f64) -> f64 {
    match op {
        ArithmeticOp::Add => a + b,
        ArithmeticOp::Subtract => a - b,
        ArithmeticOp::Multiply => a * b,
        ArithmeticOp::Divide => a / b,
        ArithmeticOp::Modulo => a % b,
        ArithmeticOp::Negate => -a,
    }
}

fn apply_i128(op: ArithmeticOp, a: i128, b: i128) -> i128 {
    match op {
        ArithmeticOp::Add => a.wrapping_add(b),
        ArithmeticOp::Subtract => a.wrapping_sub(b),
        ArithmeticOp::Multiply => a.wrapping_mul(b),
        ArithmeticOp::Divide => a.wrapping_div(b),
        ArithmeticOp::Modulo => a.wrapping_rem(b),
        ArithmeticOp::Negate => a.wrapping_neg(),
    }
}

fn apply_u128(op: ArithmeticOp, a: u128, b: u128) -> u128 {
    match op {
        ArithmeticOp::Add => a.wrapping_add(b),
        ArithmeticOp::Subtract => a.wrapping_sub(b),
        ArithmeticOp::Multiply => a.wrapping_mul(b),
        ArithmeticOp::Divide => a / b,
        ArithmeticOp::Modulo => a % b,
        ArithmeticOp::Negate => a.wrapping_neg(),
    }
}

enum Payload {
    F(f64),
    I(i128),
    U(u128),
}

fn payload(value: &Value) -> Option<Payload> {
    Some(match value {
        Value::Float(v) => Payload::F(*v as f64),
        Value::Double(v) => Payload::F(*v),
        Value::UInt8(v) => Payload::U(*v as u128),
        Value::UInt16(v) => Payload::U(*v as u128),
        Value::UInt32(v) => Payload::U(*v as u128),
        Value::UInt64(v) => Payload::U(*v as u128),
        Value::UInt128(v) => Payload::U(*v),
        other => Payload::I(other.as_i64().map(|v| v as i128).or_else(|| match other {
            Value::Int128(v) => Some(*v),
            _ => None,
        })?),
    })
}

fn make_result(ty: &LogicalType, raw: Payload) -> Result<Value> {
    let value = match (ty, raw) {
        (LogicalType::Double, Payload::F(v)) => Value::Double(v),
        (LogicalType::Double, Payload::I(v)) => Value::Double(v as f64),
        (LogicalType::Double, Payload::U(v)) => Value::Double(v as f64),
        (_, Payload::F(v)) => Value::Double(v),
        (ty, Payload::I(v)) => Value::Int128(v).cast(ty)?,
        (ty, Payload::U(v)) => Value::UInt128(v).cast(ty)?,
    };
    Ok(value)
}

/// Row-wise arithmetic on two values with full promotion. The building
/// block of the per-row evaluators; the vector kernels below loop it over
/// typed payloads.
pub fn value_arithmetic(op: ArithmeticOp, left: &Value, right: &Value) -> Result<Option<Value>> {
    if left.is_null() || right.is_null() {
        return Ok(None);
    }
    let result_ty = promote_pair(&left.logical_type(), &right.logical_type())?;
    let (lp, rp) = match (payload(left), payload(right)) {
        (Some(l), Some(r)) => (l, r),
        _ => return Err(ExecError::NonNumericArithmetic),
    };

    let raw = match (&result_ty, lp, rp) {
        (LogicalType::Double, l, r) => {
            let a = match l {
                Payload::F(v) => v,
                Payload::I(v) => v as f64,
                Payload::U(v) => v as f64,
            };
            let b = match r {
                Payload::F(v) => v,
                Payload::I(v) => v as f64,
                Payload::U(v) => v as f64,
            };
            if is_divide(op) && b == 0.0 {
                return Ok(None);
            }
            Payload::F(apply_f64(op, a, b))
        }
        (LogicalType::UInt8 | LogicalType::UInt16 | LogicalType::UInt32 | LogicalType::UInt64
            | LogicalType::UInt128, Payload::U(a), Payload::U(b)) => {
            if is_divide(op) && b == 0 {
                return Ok(None);
            }
            Payload::U(apply_u128(op, a, b))
        }
        (_, l, r) => {
            let a = match l {
                Payload::I(v) => v,
                Payload::U(v) => v as i128,
                Payload::F(v) => v as i128,
            };
            let b = match r {
                Payload::I(v) => v,
                Payload::U(v) => v as i128,
                Payload::F(v) => v as i128,
            };
            if is_divide(op) && b == 0 {
                return Ok(None);
            }
            Payload::I(apply_i128(op, a, b))
        }
    };
    // subtraction of unsigneds can underflow into the signed domain
    let value = match make_result(&result_ty, raw) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    Ok(Some(value))
}

/// Element-wise `left op right` over `count` rows.
pub fn compute_binary(
    op: ArithmeticOp,
    left: &Vector,
    right: &Vector,
    count: usize,
) -> Result<Vector> {
    let result_ty = promote_pair(left.ty(), right.ty())?;
    let mut out = Vector::with_len(result_ty, count);
    for row in 0..count {
        match value_arithmetic(op, &left.value(row), &right.value(row))? {
            Some(value) => out.set_value(row, &value)?,
            None => out.set_value(row, &Value::Null)?,
        }
    }
    Ok(out)
}

/// `vector op scalar`. A zero scalar divisor nullifies the whole output.
pub fn compute_vector_scalar(
    op: ArithmeticOp,
    vector: &Vector,
    scalar: &Value,
    count: usize,
) -> Result<Vector> {
    if scalar.is_null() || (is_divide(op) && scalar.as_f64() == Some(0.0)) {
        let result_ty = if scalar.is_null() {
            promote_pair(vector.ty(), vector.ty())?
        } else {
            promote_pair(vector.ty(), &scalar.logical_type())?
        };
        let mut out = Vector::with_len(result_ty, count);
        for row in 0..count {
            out.set_value(row, &Value::Null)?;
        }
        return Ok(out);
    }
    let result_ty = promote_pair(vector.ty(), &scalar.logical_type())?;
    let mut out = Vector::with_len(result_ty, count);
    for row in 0..count {
        match value_arithmetic(op, &vector.value(row), scalar)? {
            Some(value) => out.set_value(row, &value)?,
            None => out.set_value(row, &Value::Null)?,
        }
    }
    Ok(out)
}

/// `scalar op vector`.
pub fn compute_scalar_vector(
    op: ArithmeticOp,
    scalar: &Value,
    vector: &Vector,
    count: usize,
) -> Result<Vector> {
    let result_ty = if scalar.is_null() {
        promote_pair(vector.ty(), vector.ty())?
    } else {
        promote_pair(&scalar.logical_type(), vector.ty())?
    };
    let mut out = Vector::with_len(result_ty, count);
    for row in 0..count {
        match value_arithmetic(op, scalar, &vector.value(row))? {
            Some(value) => out.set_value(row, &value)?,
            None => out.set_value(row, &Value::Null)?,
        }
    }
    Ok(out)
}

/// Per-type in-place sign flip; validity propagates.
pub fn compute_unary_neg(vector: &Vector, count: usize) -> Result<Vector> {
    let result_ty = match vector.physical_type() {
        PhysicalType::Float32 | PhysicalType::Float64 => LogicalType::Double,
        p if p.is_integral() => vector.ty().clone(),
        _ => return Err(ExecError::NonNumericArithmetic),
    };
    let mut out = Vector::with_len(result_ty, count);
    for row in 0..count {
        let value = vector.value(row);
        if value.is_null() {
            out.set_value(row, &Value::Null)?;
            continue;
        }
        let negated = match value {
            Value::Double(v) => Value::Double(-v),
            Value::Float(v) => Value::Double(-(v as f64)),
            Value::Int128(v) => Value::Int128(v.wrapping_neg()),
            other => match other.as_i64() {
                Some(v) => Value::Int64(v.wrapping_neg()).cast(out.ty()).unwrap_or(Value::Null),
                None => Value::Null,
            },
        };
        out.set_value(row, &negated)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_i32(values: &[Option<i32>]) -> Vector {
        let mut v = Vector::with_len(LogicalType::Int32, values.len());
        for (row, value) in values.iter().enumerate() {
            match value {
                Some(x) => v.set_value(row, &Value::Int32(*x)).unwrap(),
                None => v.set_value(row, &Value::Null).unwrap(),
            }
        }
        v
    }

    #[test]
    fn addition_promotes_to_wider_type() {
        let left = vec_i32(&[Some(1), Some(2)]);
        let mut right = Vector::with_len(LogicalType::Int64, 2);
        right.set_value(0, &Value::Int64(10)).unwrap();
        right.set_value(1, &Value::Int64(20)).unwrap();

        let out = compute_binary(ArithmeticOp::Add, &left, &right, 2).unwrap();
        assert_eq!(out.ty(), &LogicalType::Int64);
        assert_eq!(out.value(0), Value::Int64(11));
        assert_eq!(out.value(1), Value::Int64(22));
    }

    #[test]
    fn float_operand_promotes_to_double() {
        let left = vec_i32(&[Some(3)]);
        let mut right = Vector::with_len(LogicalType::Float, 1);
        right.set_value(0, &Value::Float(0.5)).unwrap();
        let out = compute_binary(ArithmeticOp::Multiply, &left, &right, 1).unwrap();
        assert_eq!(out.ty(), &LogicalType::Double);
        assert_eq!(out.value(0), Value::Double(1.5));
    }

    #[test]
    fn null_inputs_propagate() {
        let left = vec_i32(&[Some(1), None]);
        let right = vec_i32(&[None, Some(2)]);
        let out = compute_binary(ArithmeticOp::Add, &left, &right, 2).unwrap();
        assert!(out.is_null(0));
        assert!(out.is_null(1));
    }

    #[test]
    fn divide_by_zero_nullifies_exactly_those_rows() {
        let left = vec_i32(&[Some(10), Some(10), None]);
        let right = vec_i32(&[Some(0), Some(2), Some(5)]);
        let out = compute_binary(ArithmeticOp::Divide, &left, &right, 3).unwrap();
        assert!(out.is_null(0));
        assert_eq!(out.value(1), Value::Int32(5));
        assert!(out.is_null(2));
    }

    #[test]
    fn scalar_zero_divisor_nullifies_everything() {
        let left = vec_i32(&[Some(1), Some(2), Some(3)]);
        let out =
            compute_vector_scalar(ArithmeticOp::Divide, &left, &Value::Int32(0), 3).unwrap();
        for row in 0..3 {
            assert!(out.is_null(row));
        }
    }

    #[test]
    fn mixed_sign_pair_widens() {
        let ty = promote_pair(&LogicalType::Int32, &LogicalType::UInt32).unwrap();
        assert_eq!(ty, LogicalType::Int64);
        let ty = promote_pair(&LogicalType::Int128, &LogicalType::Float).unwrap();
        assert_eq!(ty, LogicalType::Double);
    }

    #[test]
    fn negate_flips_sign_and_keeps_nulls() {
        let input = vec_i32(&[Some(5), None, Some(-3)]);
        let out = compute_unary_neg(&input, 3).unwrap();
        assert_eq!(out.value(0), Value::Int32(-5));
        assert!(out.is_null(1));
        assert_eq!(out.value(2), Value::Int32(3));
    }

    #[test]
    fn modulo_matches_divide_policy() {
        let left = vec_i32(&[Some(7), Some(7)]);
        let right = vec_i32(&[Some(3), Some(0)]);
        let out = compute_binary(ArithmeticOp::Modulo, &left, &right, 2).unwrap();
        assert_eq!(out.value(0), Value::Int32(1));
        assert!(out.is_null(1));
    }
}
