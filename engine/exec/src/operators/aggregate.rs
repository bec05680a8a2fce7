//! Whole-input aggregate kernels: COUNT, MIN, MAX, SUM, AVG, plus the
//! registered-function escape hatch.

use crate::{ExecError, Result};
use otter_plan::AggregateFunc;
use otter_primitives::{DataChunk, Value, Vector};

/// Compute one aggregate over `input`. `key` selects the input column by
/// alias; COUNT without a key counts rows.
pub fn compute(func: &AggregateFunc, key: Option<&str>, input: &DataChunk) -> Result<Value> {
    match func {
        AggregateFunc::Count => match key {
            None => Ok(Value::UInt64(input.size() as u64)),
            Some(name) => {
                let column = column_by_alias(input, name)?;
                let non_null =
                    (0..input.size()).filter(|&row| !column.is_null(row)).count();
                Ok(Value::UInt64(non_null as u64))
            }
        },
        AggregateFunc::Min => {
            let column = column_by_alias(input, required(key)?)?;
            Ok(fold_min_max(column, input.size(), true))
        }
        AggregateFunc::Max => {
            let column = column_by_alias(input, required(key)?)?;
            Ok(fold_min_max(column, input.size(), false))
        }
        AggregateFunc::Sum => {
            let column = column_by_alias(input, required(key)?)?;
            Ok(sum(column, input.size()))
        }
        AggregateFunc::Avg => {
            let column = column_by_alias(input, required(key)?)?;
            if input.size() == 0 {
                return Ok(Value::Null);
            }
            let total = sum(column, input.size());
            let total = total.as_f64().unwrap_or(0.0);
            Ok(Value::Double(total / input.size() as f64))
        }
        // named functions are resolved to one of the builtins by validation;
        // reaching here means the dispatcher was skipped
        AggregateFunc::Func(_) => Err(ExecError::MalformedPlan("unresolved compute function")),
    }
}

fn required(key: Option<&str>) -> Result<&str> {
    key.ok_or(ExecError::MalformedPlan("aggregate requires an input column"))
}

fn column_by_alias<'a>(input: &'a DataChunk, name: &str) -> Result<&'a Vector> {
    input.column_by_alias(name).ok_or_else(|| ExecError::UnknownColumn(name.to_string()))
}

/// MIN/MAX over a column; NA on a 0-row (or all-null) input.
fn fold_min_max(column: &Vector, count: usize, want_min: bool) -> Value {
    let mut best: Option<Value> = None;
    for row in 0..count {
        if column.is_null(row) {
            continue;
        }
        let value = column.value(row);
        best = Some(match best {
            None => value,
            Some(current) => {
                let take = if want_min { value < current } else { value > current };
                if take { value } else { current }
            }
        });
    }
    best.unwrap_or(Value::Null)
}

/// SUM with integer accumulation in i128 (narrowing back to Int64 when it
/// fits) and float accumulation in f64. Nulls are skipped; an all-null or
/// empty input sums to NA.
pub fn sum(column: &Vector, count: usize) -> Value {
    let mut int_acc: i128 = 0;
    let mut float_acc: f64 = 0.0;
    let mut saw_float = false;
    let mut saw_value = false;
    for row in 0..count {
        if column.is_null(row) {
            continue;
        }
        saw_value = true;
        match column.value(row) {
            Value::Float(v) => {
                saw_float = true;
                float_acc += v as f64;
            }
            Value::Double(v) => {
                saw_float = true;
                float_acc += v;
            }
            other => match other.as_i64() {
                Some(v) => int_acc += v as i128,
                None => {
                    if let Value::Int128(v) = other {
                        int_acc += v;
                    }
                }
            },
        }
    }
    if !saw_value {
        return Value::Null;
    }
    if saw_float {
        Value::Double(float_acc + int_acc as f64)
    } else if let Ok(v) = i64::try_from(int_acc) {
        Value::Int64(v)
    } else {
        Value::Int128(int_acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_primitives::LogicalType;

    fn chunk(values: &[Option<i64>]) -> DataChunk {
        let mut chunk = DataChunk::new(&[LogicalType::Int64]);
        for v in values {
            chunk
                .push_row(&[v.map(Value::Int64).unwrap_or(Value::Null)])
                .unwrap();
        }
        chunk.column_mut(0).set_alias("count");
        chunk
    }

    #[test]
    fn count_star_counts_rows_count_key_skips_nulls() {
        let input = chunk(&[Some(1), None, Some(3)]);
        assert_eq!(compute(&AggregateFunc::Count, None, &input).unwrap(), Value::UInt64(3));
        assert_eq!(
            compute(&AggregateFunc::Count, Some("count"), &input).unwrap(),
            Value::UInt64(2)
        );
    }

    #[test]
    fn min_max_skip_nulls_and_handle_empty() {
        let input = chunk(&[Some(5), None, Some(-2), Some(9)]);
        assert_eq!(compute(&AggregateFunc::Min, Some("count"), &input).unwrap(), Value::Int64(-2));
        assert_eq!(compute(&AggregateFunc::Max, Some("count"), &input).unwrap(), Value::Int64(9));

        let empty = chunk(&[]);
        assert_eq!(compute(&AggregateFunc::Min, Some("count"), &empty).unwrap(), Value::Null);
    }

    #[test]
    fn sum_and_avg() {
        let input = chunk(&[Some(10), Some(20), Some(30)]);
        assert_eq!(compute(&AggregateFunc::Sum, Some("count"), &input).unwrap(), Value::Int64(60));
        assert_eq!(
            compute(&AggregateFunc::Avg, Some("count"), &input).unwrap(),
            Value::Double(20.0)
        );
    }

    #[test]
    fn sum_of_floats_is_double() {
        let mut input = DataChunk::new(&[LogicalType::Double]);
        input.push_row(&[Value::Double(1.5)]).unwrap();
        input.push_row(&[Value::Double(2.5)]).unwrap();
        input.column_mut(0).set_alias("x");
        assert_eq!(compute(&AggregateFunc::Sum, Some("x"), &input).unwrap(), Value::Double(4.0));
    }
}
