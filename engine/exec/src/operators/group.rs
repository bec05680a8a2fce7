//! The GROUP BY operator: the central pipeline stage of aggregation
//! queries.
//!
//! Execution phases over the input chunk:
//! 1. evaluate computed columns (arithmetic / CASE) and append them,
//! 2. group rows by key: hash fast path over top-level columns, slow path
//!    for wildcard or missing keys; rows with any null key are dropped,
//! 3. aggregate each group by slicing its rows,
//! 4. evaluate post-aggregate arithmetic over the aggregate columns,
//! 5. drop internal `__agg_*` columns,
//! 6. apply the HAVING filter.
//!
//! Group output order is first-encounter order of the keys, and collisions
//! resolve deterministically: the first group inserted keeps the earlier
//! position.

use super::aggregate;
use crate::eval;
use crate::Result;
use otter_plan::{GroupNode, ParameterBinding};
use otter_primitives::{DataChunk, LogicalType, Value, Vector};
use std::collections::HashMap;

pub fn execute(node: &GroupNode, input: &DataChunk, params: &ParameterBinding) -> Result<DataChunk> {
    // Phase 1: computed columns join the input chunk.
    let mut input = input.clone();
    for computed in &node.computed {
        let mut vector = eval::eval_scalar_chunk(&computed.expr, &input, params)?;
        vector.set_alias(computed.alias.clone());
        input.columns_mut().push(vector);
    }

    // Phase 2: group rows by key.
    let groups = build_groups(node, &input)?;

    // Phase 3: one output row per group.
    let mut result = aggregate_groups(node, &input, &groups)?;

    // Phase 4: post-aggregate arithmetic over the fresh aggregate columns.
    for post in &node.post_aggregates {
        let mut vector = eval::eval_scalar_chunk(&post.expr, &result, params)?;
        vector.set_alias(post.alias.clone());
        result.columns_mut().push(vector);
    }

    // Phase 5: internal __agg_ columns served the post-aggregates only.
    if !node.post_aggregates.is_empty() {
        result
            .columns_mut()
            .retain(|column| !column.alias().is_some_and(|a| a.starts_with("__agg_")));
    }

    // Phase 6: HAVING.
    if let Some(having) = &node.having {
        let selected = eval::filter_chunk(having, &result, params)?;
        result = result.slice(&selected);
    }

    Ok(result)
}

struct Groups {
    /// Key values per group, in first-encounter order.
    keys: Vec<Vec<Value>>,
    /// Input row offsets per group, parallel to `keys`.
    rows: Vec<Vec<usize>>,
}

fn build_groups(node: &GroupNode, input: &DataChunk) -> Result<Groups> {
    let mut groups = Groups { keys: Vec::new(), rows: Vec::new() };
    let row_count = input.size();

    // No keys: a single group holding every row.
    if node.keys.is_empty() {
        if row_count > 0 || !node.values.is_empty() {
            groups.keys.push(Vec::new());
            groups.rows.push((0..row_count).collect());
        }
        return Ok(groups);
    }
    if row_count == 0 {
        return Ok(groups);
    }

    // Fast path requires every key to resolve to a top-level column.
    let key_columns: Option<Vec<usize>> = node
        .keys
        .iter()
        .map(|key| {
            if key == "*" { None } else { input.column_index_by_alias(key) }
        })
        .collect();

    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();

    match key_columns {
        Some(ref columns) => {
            let mut hashes = Vec::new();
            input.hash_rows(columns, &mut hashes);
            for row in 0..row_count {
                if columns.iter().any(|&col| input.column(col).is_null(row)) {
                    continue;
                }
                insert_row(&mut groups, &mut index, hashes[row], row, || {
                    columns.iter().map(|&col| input.value(col, row)).collect()
                });
            }
        }
        None => {
            // Slow path: per-row getter evaluation. Wildcard keys collapse
            // into a single synthetic key; nested keys walk the row value.
            for row in 0..row_count {
                let mut key_values = Vec::with_capacity(node.keys.len());
                let mut has_null = false;
                for key in &node.keys {
                    let value = if key == "*" {
                        Value::Boolean(true)
                    } else {
                        let path = otter_plan::KeyPath::new(
                            key.split('.').map(str::to_string).collect(),
                        );
                        eval::key_value(input, &path, row)?
                    };
                    if value.is_null() {
                        has_null = true;
                        break;
                    }
                    key_values.push(value);
                }
                if has_null {
                    continue;
                }
                let mut hasher =
                    std::collections::hash_map::DefaultHasher::new();
                use std::hash::{Hash, Hasher};
                for value in &key_values {
                    value.hash(&mut hasher);
                }
                insert_row(&mut groups, &mut index, hasher.finish(), row, || key_values.clone());
            }
        }
    }

    Ok(groups)
}

fn insert_row(
    groups: &mut Groups,
    index: &mut HashMap<u64, Vec<usize>>,
    hash: u64,
    row: usize,
    make_keys: impl FnOnce() -> Vec<Value>,
) {
    let keys = make_keys();
    if let Some(candidates) = index.get(&hash) {
        for &group_idx in candidates {
            if groups.keys[group_idx] == keys {
                groups.rows[group_idx].push(row);
                return;
            }
        }
    }
    let group_idx = groups.keys.len();
    index.entry(hash).or_default().push(group_idx);
    groups.keys.push(keys);
    groups.rows.push(vec![row]);
}

fn aggregate_groups(node: &GroupNode, input: &DataChunk, groups: &Groups) -> Result<DataChunk> {
    let group_count = groups.keys.len();

    // Output columns: the keys, then every aggregate, in declaration order.
    let mut key_vectors: Vec<Vector> = Vec::with_capacity(node.keys.len());
    for (key_idx, key) in node.keys.iter().enumerate() {
        let ty = groups
            .keys
            .iter()
            .map(|k| k[key_idx].logical_type())
            .find(|ty| *ty != LogicalType::Null)
            .unwrap_or(LogicalType::Int64);
        let mut vector = Vector::with_len(ty, group_count);
        vector.set_alias(key.clone());
        for (group_idx, group_keys) in groups.keys.iter().enumerate() {
            vector.set_value(group_idx, &group_keys[key_idx])?;
        }
        key_vectors.push(vector);
    }

    let mut value_vectors: Vec<Vector> = Vec::with_capacity(node.values.len());
    for value in &node.values {
        let mut results = Vec::with_capacity(group_count);
        for rows in &groups.rows {
            let slice = input.slice(rows);
            results.push(aggregate::compute(&value.func, value.key.as_deref(), &slice)?);
        }
        let ty = results
            .iter()
            .find(|v| !v.is_null())
            .map(Value::logical_type)
            .unwrap_or(LogicalType::Int64);
        let mut vector = Vector::with_len(ty, group_count);
        vector.set_alias(value.alias.clone());
        for (group_idx, result) in results.iter().enumerate() {
            vector.set_value(group_idx, result)?;
        }
        value_vectors.push(vector);
    }

    let mut columns = key_vectors;
    columns.append(&mut value_vectors);
    if columns.is_empty() {
        return Ok(DataChunk::default());
    }
    Ok(DataChunk::from_columns(columns, group_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::{
        AggregateFunc, ArithmeticOp, CompareExpr, CompareOp, GroupValue, KeyPath, Operand,
        ScalarExpr, SelectColumn,
    };

    fn input_chunk() -> DataChunk {
        // (dept, salary) rows
        let mut chunk = DataChunk::new(&[LogicalType::String, LogicalType::Int64]);
        for (dept, salary) in [
            ("eng", 100),
            ("ops", 50),
            ("eng", 200),
            ("ops", 70),
            ("eng", 300),
        ] {
            chunk.push_row(&[Value::String(dept.into()), Value::Int64(salary)]).unwrap();
        }
        chunk.column_mut(0).set_alias("dept");
        chunk.column_mut(1).set_alias("salary");
        chunk
    }

    fn count_and_sum() -> Vec<GroupValue> {
        vec![
            GroupValue { alias: "count".into(), func: AggregateFunc::Count, key: None },
            GroupValue {
                alias: "total".into(),
                func: AggregateFunc::Sum,
                key: Some("salary".into()),
            },
        ]
    }

    #[test]
    fn groups_emit_in_first_encounter_order() {
        let node = GroupNode {
            keys: vec!["dept".into()],
            values: count_and_sum(),
            ..Default::default()
        };
        let result = execute(&node, &input_chunk(), &ParameterBinding::new()).unwrap();
        assert_eq!(result.size(), 2);
        assert_eq!(result.value(0, 0), Value::String("eng".into()));
        assert_eq!(result.value(1, 0), Value::UInt64(3));
        assert_eq!(result.value(2, 0), Value::Int64(600));
        assert_eq!(result.value(0, 1), Value::String("ops".into()));
        assert_eq!(result.value(1, 1), Value::UInt64(2));
        assert_eq!(result.value(2, 1), Value::Int64(120));
    }

    #[test]
    fn group_count_partitions_the_input() {
        let input = input_chunk();
        let node = GroupNode {
            keys: vec!["dept".into()],
            values: vec![GroupValue {
                alias: "count".into(),
                func: AggregateFunc::Count,
                key: None,
            }],
            ..Default::default()
        };
        let result = execute(&node, &input, &ParameterBinding::new()).unwrap();
        let total: u64 = (0..result.size())
            .map(|row| match result.value(1, row) {
                Value::UInt64(v) => v,
                _ => 0,
            })
            .sum();
        assert_eq!(total, input.size() as u64);
    }

    #[test]
    fn null_keys_drop_rows() {
        let mut chunk = input_chunk();
        chunk.column_mut(0).set_value(1, &Value::Null).unwrap();
        let node = GroupNode {
            keys: vec!["dept".into()],
            values: vec![GroupValue {
                alias: "count".into(),
                func: AggregateFunc::Count,
                key: None,
            }],
            ..Default::default()
        };
        let result = execute(&node, &chunk, &ParameterBinding::new()).unwrap();
        let total: u64 = (0..result.size())
            .map(|row| match result.value(1, row) {
                Value::UInt64(v) => v,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn having_filters_groups() {
        let node = GroupNode {
            keys: vec!["dept".into()],
            values: count_and_sum(),
            having: Some(CompareExpr::Compare {
                left: Operand::Key(KeyPath::column("total")),
                op: CompareOp::Gt,
                right: Operand::Literal(Value::Int64(200)),
            }),
            ..Default::default()
        };
        let result = execute(&node, &input_chunk(), &ParameterBinding::new()).unwrap();
        assert_eq!(result.size(), 1);
        assert_eq!(result.value(0, 0), Value::String("eng".into()));
    }

    #[test]
    fn post_aggregates_drop_internal_columns() {
        let node = GroupNode {
            keys: vec!["dept".into()],
            values: vec![
                GroupValue {
                    alias: "__agg_0".into(),
                    func: AggregateFunc::Sum,
                    key: Some("salary".into()),
                },
                GroupValue {
                    alias: "__agg_1".into(),
                    func: AggregateFunc::Count,
                    key: None,
                },
            ],
            post_aggregates: vec![SelectColumn {
                alias: "sum_plus_count".into(),
                expr: ScalarExpr::Arithmetic {
                    op: ArithmeticOp::Add,
                    operands: vec![
                        ScalarExpr::Key(KeyPath::column("__agg_0")),
                        ScalarExpr::Key(KeyPath::column("__agg_1")),
                    ],
                },
            }],
            ..Default::default()
        };
        let result = execute(&node, &input_chunk(), &ParameterBinding::new()).unwrap();
        assert_eq!(result.column_count(), 2);
        assert_eq!(result.column(0).alias(), Some("dept"));
        assert_eq!(result.column(1).alias(), Some("sum_plus_count"));
        // eng: 600 + 3
        assert_eq!(result.value(1, 0), Value::Int64(603));
    }

    #[test]
    fn no_keys_is_one_group_even_on_empty_input() {
        let empty = DataChunk::new(&[LogicalType::Int64]);
        let node = GroupNode {
            keys: vec![],
            values: vec![GroupValue {
                alias: "count".into(),
                func: AggregateFunc::Count,
                key: None,
            }],
            ..Default::default()
        };
        let result = execute(&node, &empty, &ParameterBinding::new()).unwrap();
        assert_eq!(result.size(), 1);
        assert_eq!(result.value(0, 0), Value::UInt64(0));
    }

    #[test]
    fn computed_column_feeds_grouping() {
        // group by salary >= 100 via a CASE computed column
        let node = GroupNode {
            keys: vec!["band".into()],
            values: vec![GroupValue {
                alias: "count".into(),
                func: AggregateFunc::Count,
                key: None,
            }],
            computed: vec![SelectColumn {
                alias: "band".into(),
                expr: ScalarExpr::CaseWhen {
                    branches: vec![(
                        CompareExpr::Compare {
                            left: Operand::Key(KeyPath::column("salary")),
                            op: CompareOp::Gte,
                            right: Operand::Literal(Value::Int64(100)),
                        },
                        ScalarExpr::Literal(Value::String("high".into())),
                    )],
                    otherwise: Some(Box::new(ScalarExpr::Literal(Value::String("low".into())))),
                },
            }],
            ..Default::default()
        };
        let result = execute(&node, &input_chunk(), &ParameterBinding::new()).unwrap();
        assert_eq!(result.size(), 2);
        // first row is "high" (salary 100 comes first)
        assert_eq!(result.value(0, 0), Value::String("high".into()));
        assert_eq!(result.value(1, 0), Value::UInt64(3));
        assert_eq!(result.value(0, 1), Value::String("low".into()));
        assert_eq!(result.value(1, 1), Value::UInt64(2));
    }
}
