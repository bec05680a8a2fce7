//! Sort: full materialization, stable row-index sort over the key columns,
//! then a gather. Nulls order low; ties keep input order.

use crate::{ExecError, Result};
use otter_plan::SortKey;
use otter_primitives::DataChunk;
use std::cmp::Ordering;

pub fn execute(keys: &[SortKey], input: &DataChunk) -> Result<DataChunk> {
    if keys.is_empty() || input.size() <= 1 {
        return Ok(input.clone());
    }

    let mut key_columns = Vec::with_capacity(keys.len());
    for key in keys {
        let idx = input
            .column_index_by_alias(&key.key)
            .ok_or_else(|| ExecError::UnknownColumn(key.key.clone()))?;
        key_columns.push((idx, key.ascending));
    }

    let mut order: Vec<usize> = (0..input.size()).collect();
    order.sort_by(|&a, &b| {
        for &(column, ascending) in &key_columns {
            let va = input.value(column, a);
            let vb = input.value(column, b);
            let cmp = va.cmp(&vb);
            let cmp = if ascending { cmp } else { cmp.reverse() };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });

    Ok(input.slice(&order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_primitives::{LogicalType, Value};

    fn chunk(rows: &[(Option<i64>, &str)]) -> DataChunk {
        let mut chunk = DataChunk::new(&[LogicalType::Int64, LogicalType::String]);
        for (n, s) in rows {
            chunk
                .push_row(&[n.map(Value::Int64).unwrap_or(Value::Null), Value::String((*s).into())])
                .unwrap();
        }
        chunk.column_mut(0).set_alias("n");
        chunk.column_mut(1).set_alias("s");
        chunk
    }

    fn asc(key: &str) -> SortKey {
        SortKey { key: key.into(), ascending: true }
    }

    #[test]
    fn sorts_ascending_with_nulls_low() {
        let input = chunk(&[(Some(3), "c"), (None, "x"), (Some(1), "a")]);
        let out = execute(&[asc("n")], &input).unwrap();
        assert!(out.value(0, 0).is_null());
        assert_eq!(out.value(0, 1), Value::Int64(1));
        assert_eq!(out.value(0, 2), Value::Int64(3));
    }

    #[test]
    fn descending_reverses_but_keeps_tie_order() {
        let input = chunk(&[(Some(1), "first"), (Some(2), "mid"), (Some(1), "second")]);
        let out = execute(&[SortKey { key: "n".into(), ascending: false }], &input).unwrap();
        assert_eq!(out.value(0, 0), Value::Int64(2));
        // stable: "first" precedes "second" among the ties
        assert_eq!(out.value(1, 1), Value::String("first".into()));
        assert_eq!(out.value(1, 2), Value::String("second".into()));
    }

    #[test]
    fn multi_key_sort() {
        let input = chunk(&[(Some(1), "b"), (Some(2), "a"), (Some(1), "a")]);
        let out = execute(&[asc("n"), asc("s")], &input).unwrap();
        assert_eq!(out.value(1, 0), Value::String("a".into()));
        assert_eq!(out.value(1, 1), Value::String("b".into()));
        assert_eq!(out.value(0, 2), Value::Int64(2));
    }
}
