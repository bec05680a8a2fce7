//! Nested-loop inner join. Both inputs are fully materialized chunks; the
//! predicate is evaluated on the concatenated row.

use crate::eval::{self, RegexCache};
use crate::Result;
use otter_plan::{CompareExpr, ParameterBinding};
use otter_primitives::DataChunk;

pub fn execute(
    on: &CompareExpr,
    left: &DataChunk,
    right: &DataChunk,
    params: &ParameterBinding,
) -> Result<DataChunk> {
    let mut columns = Vec::with_capacity(left.column_count() + right.column_count());
    for column in left.columns().iter().chain(right.columns()) {
        let mut empty = otter_primitives::Vector::empty(column.ty().clone());
        if let Some(alias) = column.alias() {
            empty.set_alias(alias.to_string());
        }
        columns.push(empty);
    }
    let mut out = DataChunk::from_columns(columns, 0);

    let mut regexes = RegexCache::default();
    for l in 0..left.size() {
        for r in 0..right.size() {
            let probe = combined_row(left, l, right, r);
            if eval::eval_compare_row(on, &probe, params, 0, &mut regexes)? {
                let row: Vec<otter_primitives::Value> =
                    (0..probe.column_count()).map(|c| probe.value(c, 0)).collect();
                out.push_row(&row)?;
            }
        }
    }
    Ok(out)
}

fn combined_row(left: &DataChunk, l: usize, right: &DataChunk, r: usize) -> DataChunk {
    let mut columns = Vec::with_capacity(left.column_count() + right.column_count());
    for column in left.columns() {
        columns.push(column.slice(&[l]));
    }
    for column in right.columns() {
        columns.push(column.slice(&[r]));
    }
    DataChunk::from_columns(columns, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::{CompareOp, KeyPath, Operand};
    use otter_primitives::{LogicalType, Value};

    #[test]
    fn inner_join_on_equality() {
        let mut left = DataChunk::new(&[LogicalType::Int64, LogicalType::String]);
        left.push_row(&[Value::Int64(1), Value::String("a".into())]).unwrap();
        left.push_row(&[Value::Int64(2), Value::String("b".into())]).unwrap();
        left.column_mut(0).set_alias("id");
        left.column_mut(1).set_alias("name");

        let mut right = DataChunk::new(&[LogicalType::Int64, LogicalType::Int64]);
        right.push_row(&[Value::Int64(2), Value::Int64(100)]).unwrap();
        right.push_row(&[Value::Int64(3), Value::Int64(200)]).unwrap();
        right.push_row(&[Value::Int64(2), Value::Int64(300)]).unwrap();
        right.column_mut(0).set_alias("user_id");
        right.column_mut(1).set_alias("amount");

        let on = CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("id")),
            op: CompareOp::Eq,
            right: Operand::Key(KeyPath::column("user_id")),
        };
        let out = execute(&on, &left, &right, &ParameterBinding::new()).unwrap();
        assert_eq!(out.size(), 2);
        assert_eq!(out.value(1, 0), Value::String("b".into()));
        assert_eq!(out.value(3, 0), Value::Int64(100));
        assert_eq!(out.value(3, 1), Value::Int64(300));
    }
}
