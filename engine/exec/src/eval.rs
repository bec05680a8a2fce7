//! Per-row and chunk-level evaluation of compare and scalar expressions.

use crate::arithmetic::{self, value_arithmetic};
use crate::{ExecError, Result};
use otter_plan::{
    ArithmeticOp, CompareExpr, CompareOp, KeyPath, Operand, ParameterBinding, ScalarExpr,
    UpdateExpr,
};
use otter_primitives::{DataChunk, LogicalType, Value, Vector};
use std::collections::HashMap;

/// Compiled-regex cache for the `Regex` compare op; one per evaluation
/// pass so a pattern compiles once per chunk, not once per row.
#[derive(Default)]
pub struct RegexCache {
    compiled: HashMap<String, regex::Regex>,
}

impl RegexCache {
    fn get(&mut self, pattern: &str) -> Result<&regex::Regex> {
        if !self.compiled.contains_key(pattern) {
            let compiled = regex::Regex::new(pattern)?;
            self.compiled.insert(pattern.to_string(), compiled);
        }
        Ok(&self.compiled[pattern])
    }
}

/// Fetch the value a key path names for one row, walking nested struct
/// fields by name past the root column.
pub fn key_value(chunk: &DataChunk, key: &KeyPath, row: usize) -> Result<Value> {
    let column = chunk
        .column_by_alias(key.root())
        .ok_or_else(|| ExecError::UnknownColumn(key.root().to_string()))?;
    let mut value = column.value(row);
    for part in &key.parts[1..] {
        value = match value {
            Value::Struct(fields) => fields
                .into_iter()
                .find(|(name, _)| name == part)
                .map(|(_, v)| v)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    Ok(value)
}

fn operand_value(
    operand: &Operand,
    chunk: &DataChunk,
    params: &ParameterBinding,
    row: usize,
) -> Result<Value> {
    match operand {
        Operand::Key(key) => key_value(chunk, key, row),
        Operand::Parameter(id) => {
            params.get(*id).cloned().ok_or(ExecError::UnboundParameter(id.0))
        }
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Scalar(expr) => eval_scalar_row(expr, chunk, params, row),
    }
}

/// Evaluate a predicate for one row. Three-valued logic is collapsed:
/// a comparison against NULL is false unless the op is IS NULL-shaped.
pub fn eval_compare_row(
    expr: &CompareExpr,
    chunk: &DataChunk,
    params: &ParameterBinding,
    row: usize,
    regexes: &mut RegexCache,
) -> Result<bool> {
    match expr {
        CompareExpr::And(children) => {
            for child in children {
                if !eval_compare_row(child, chunk, params, row, regexes)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        CompareExpr::Or(children) => {
            for child in children {
                if eval_compare_row(child, chunk, params, row, regexes)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        CompareExpr::Not(child) => Ok(!eval_compare_row(child, chunk, params, row, regexes)?),
        CompareExpr::Compare { left, op, right } => {
            if *op == CompareOp::AllTrue {
                return Ok(true);
            }
            let lhs = operand_value(left, chunk, params, row)?;
            match op {
                CompareOp::IsNull => return Ok(lhs.is_null()),
                CompareOp::IsNotNull => return Ok(!lhs.is_null()),
                _ => {}
            }
            let rhs = operand_value(right, chunk, params, row)?;
            if lhs.is_null() || rhs.is_null() {
                return Ok(false);
            }
            Ok(match op {
                CompareOp::Eq => lhs == rhs,
                CompareOp::Ne => lhs != rhs,
                CompareOp::Gt => lhs > rhs,
                CompareOp::Gte => lhs >= rhs,
                CompareOp::Lt => lhs < rhs,
                CompareOp::Lte => lhs <= rhs,
                CompareOp::Regex => {
                    let pattern = rhs.as_str().unwrap_or_default().to_string();
                    let text = lhs.as_str().unwrap_or_default();
                    regexes.get(&pattern)?.is_match(text)
                }
                CompareOp::IsNull
                | CompareOp::IsNotNull
                | CompareOp::AllTrue => unreachable!("handled above"),
            })
        }
    }
}

/// Row indices of `chunk` that satisfy `expr`.
pub fn filter_chunk(
    expr: &CompareExpr,
    chunk: &DataChunk,
    params: &ParameterBinding,
) -> Result<Vec<usize>> {
    let mut regexes = RegexCache::default();
    let mut selected = Vec::new();
    for row in 0..chunk.size() {
        if eval_compare_row(expr, chunk, params, row, &mut regexes)? {
            selected.push(row);
        }
    }
    Ok(selected)
}

/// Evaluate a scalar expression for one row.
pub fn eval_scalar_row(
    expr: &ScalarExpr,
    chunk: &DataChunk,
    params: &ParameterBinding,
    row: usize,
) -> Result<Value> {
    match expr {
        ScalarExpr::Key(key) => key_value(chunk, key, row),
        ScalarExpr::Parameter(id) => {
            params.get(*id).cloned().ok_or(ExecError::UnboundParameter(id.0))
        }
        ScalarExpr::Literal(value) => Ok(value.clone()),
        ScalarExpr::Arithmetic { op, operands } => {
            if *op == ArithmeticOp::Negate {
                let value = eval_scalar_row(&operands[0], chunk, params, row)?;
                return Ok(value_arithmetic(ArithmeticOp::Subtract, &Value::Int64(0), &value)?
                    .unwrap_or(Value::Null));
            }
            let mut acc = eval_scalar_row(&operands[0], chunk, params, row)?;
            for operand in &operands[1..] {
                let rhs = eval_scalar_row(operand, chunk, params, row)?;
                acc = value_arithmetic(*op, &acc, &rhs)?.unwrap_or(Value::Null);
                if acc.is_null() {
                    // null propagates through the rest of the chain
                    return Ok(Value::Null);
                }
            }
            Ok(acc)
        }
        ScalarExpr::CaseWhen { branches, otherwise } => {
            let mut regexes = RegexCache::default();
            for (condition, then) in branches {
                if eval_compare_row(condition, chunk, params, row, &mut regexes)? {
                    return eval_scalar_row(then, chunk, params, row);
                }
            }
            match otherwise {
                Some(expr) => eval_scalar_row(expr, chunk, params, row),
                None => Ok(Value::Null),
            }
        }
        ScalarExpr::Coalesce(children) => {
            for child in children {
                let value = eval_scalar_row(child, chunk, params, row)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
    }
}

/// Evaluate a scalar expression across a whole chunk into one vector.
///
/// Plain two-operand arithmetic over columns and scalars takes the
/// vectorized kernels; everything else (CASE, COALESCE, longer chains with
/// nested sub-expressions) falls back to the per-row evaluator. The result
/// vector's type is that of the first row's value, per-row values being
/// cast into it where safe.
pub fn eval_scalar_chunk(
    expr: &ScalarExpr,
    chunk: &DataChunk,
    params: &ParameterBinding,
) -> Result<Vector> {
    let count = chunk.size();

    // vectorized fast path for simple binary arithmetic
    if let ScalarExpr::Arithmetic { op, operands } = expr {
        if operands.len() == 2 && *op != ArithmeticOp::Negate {
            match (simple_operand(&operands[0], chunk, params)?, simple_operand(&operands[1], chunk, params)?)
            {
                (Some(SimpleOperand::Column(l)), Some(SimpleOperand::Column(r))) => {
                    return arithmetic::compute_binary(*op, l, r, count);
                }
                (Some(SimpleOperand::Column(l)), Some(SimpleOperand::Scalar(r))) => {
                    return arithmetic::compute_vector_scalar(*op, l, &r, count);
                }
                (Some(SimpleOperand::Scalar(l)), Some(SimpleOperand::Column(r))) => {
                    return arithmetic::compute_scalar_vector(*op, &l, r, count);
                }
                _ => {}
            }
        }
        if operands.len() == 1 && *op == ArithmeticOp::Negate {
            if let Some(SimpleOperand::Column(v)) = simple_operand(&operands[0], chunk, params)? {
                return arithmetic::compute_unary_neg(v, count);
            }
        }
    }

    let mut values = Vec::with_capacity(count);
    for row in 0..count {
        values.push(eval_scalar_row(expr, chunk, params, row)?);
    }
    let result_ty = values
        .iter()
        .find(|v| !v.is_null())
        .map(Value::logical_type)
        .unwrap_or(LogicalType::Int64);
    let mut out = Vector::with_len(result_ty.clone(), count);
    for (row, value) in values.iter().enumerate() {
        match value.cast(&result_ty) {
            Ok(cast) => out.set_value(row, &cast)?,
            Err(_) => out.set_value(row, value)?,
        }
    }
    Ok(out)
}

enum SimpleOperand<'a> {
    Column(&'a Vector),
    Scalar(Value),
}

fn simple_operand<'a>(
    expr: &ScalarExpr,
    chunk: &'a DataChunk,
    params: &ParameterBinding,
) -> Result<Option<SimpleOperand<'a>>> {
    Ok(match expr {
        ScalarExpr::Key(key) if !key.is_nested() => {
            chunk.column_by_alias(key.root()).map(SimpleOperand::Column)
        }
        ScalarExpr::Parameter(id) => Some(SimpleOperand::Scalar(
            params.get(*id).cloned().ok_or(ExecError::UnboundParameter(id.0))?,
        )),
        ScalarExpr::Literal(value) => Some(SimpleOperand::Scalar(value.clone())),
        _ => None,
    })
}

/// Evaluate one `UPDATE ... SET` expression tree for a row, returning the
/// column path and its new value.
pub fn eval_update_expr(
    expr: &UpdateExpr,
    chunk: &DataChunk,
    params: &ParameterBinding,
    row: usize,
) -> Result<(KeyPath, Value)> {
    match expr {
        UpdateExpr::Set { column, value } => {
            let new_value = eval_update_value(value, chunk, params, row)?;
            Ok((column.clone(), new_value))
        }
        _ => Err(ExecError::MalformedPlan("update expression must be rooted at a SET")),
    }
}

fn eval_update_value(
    expr: &UpdateExpr,
    chunk: &DataChunk,
    params: &ParameterBinding,
    row: usize,
) -> Result<Value> {
    match expr {
        UpdateExpr::Set { .. } => {
            Err(ExecError::MalformedPlan("nested SET inside update expression"))
        }
        UpdateExpr::GetConstValue(id) => {
            params.get(*id).cloned().ok_or(ExecError::UnboundParameter(id.0))
        }
        UpdateExpr::GetValue(key) => key_value(chunk, key, row),
        UpdateExpr::Literal(value) => Ok(value.clone()),
        UpdateExpr::Calculate { op, operands } => {
            let mut acc = eval_update_value(&operands[0], chunk, params, row)?;
            for operand in &operands[1..] {
                let rhs = eval_update_value(operand, chunk, params, row)?;
                acc = value_arithmetic(*op, &acc, &rhs)?.unwrap_or(Value::Null);
            }
            Ok(acc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::ParameterId;

    fn test_chunk() -> DataChunk {
        let mut chunk = DataChunk::new(&[LogicalType::Int64, LogicalType::String]);
        chunk.push_row(&[Value::Int64(1), Value::String("apple".into())]).unwrap();
        chunk.push_row(&[Value::Int64(2), Value::String("banana".into())]).unwrap();
        chunk.push_row(&[Value::Null, Value::String("cherry".into())]).unwrap();
        chunk.column_mut(0).set_alias("count");
        chunk.column_mut(1).set_alias("name");
        chunk
    }

    #[test]
    fn compare_with_parameter() {
        let chunk = test_chunk();
        let mut params = ParameterBinding::new();
        params.bind(ParameterId(1), Value::Int64(2));
        let expr = CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("count")),
            op: CompareOp::Eq,
            right: Operand::Parameter(ParameterId(1)),
        };
        assert_eq!(filter_chunk(&expr, &chunk, &params).unwrap(), vec![1]);
    }

    #[test]
    fn null_comparisons_are_false_but_is_null_matches() {
        let chunk = test_chunk();
        let params = ParameterBinding::new();
        let gt = CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("count")),
            op: CompareOp::Gt,
            right: Operand::Literal(Value::Int64(0)),
        };
        assert_eq!(filter_chunk(&gt, &chunk, &params).unwrap(), vec![0, 1]);

        let is_null = CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("count")),
            op: CompareOp::IsNull,
            right: Operand::Literal(Value::Null),
        };
        assert_eq!(filter_chunk(&is_null, &chunk, &params).unwrap(), vec![2]);
    }

    #[test]
    fn regex_matches_strings() {
        let chunk = test_chunk();
        let params = ParameterBinding::new();
        let expr = CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("name")),
            op: CompareOp::Regex,
            right: Operand::Literal(Value::String("an".into())),
        };
        assert_eq!(filter_chunk(&expr, &chunk, &params).unwrap(), vec![1]);
    }

    #[test]
    fn case_when_with_no_match_and_no_else_is_null() {
        let chunk = test_chunk();
        let params = ParameterBinding::new();
        let expr = ScalarExpr::CaseWhen {
            branches: vec![(
                CompareExpr::Compare {
                    left: Operand::Key(KeyPath::column("count")),
                    op: CompareOp::Gt,
                    right: Operand::Literal(Value::Int64(100)),
                },
                ScalarExpr::Literal(Value::String("big".into())),
            )],
            otherwise: None,
        };
        for row in 0..3 {
            assert_eq!(eval_scalar_row(&expr, &chunk, &params, row).unwrap(), Value::Null);
        }
    }

    #[test]
    fn chunk_arithmetic_uses_the_kernel_path() {
        let chunk = test_chunk();
        let params = ParameterBinding::new();
        let expr = ScalarExpr::Arithmetic {
            op: ArithmeticOp::Add,
            operands: vec![
                ScalarExpr::Key(KeyPath::column("count")),
                ScalarExpr::Literal(Value::Int64(10)),
            ],
        };
        let out = eval_scalar_chunk(&expr, &chunk, &params).unwrap();
        assert_eq!(out.value(0), Value::Int64(11));
        assert_eq!(out.value(1), Value::Int64(12));
        assert!(out.is_null(2));
    }

    #[test]
    fn coalesce_takes_first_non_null() {
        let chunk = test_chunk();
        let params = ParameterBinding::new();
        let expr = ScalarExpr::Coalesce(vec![
            ScalarExpr::Key(KeyPath::column("count")),
            ScalarExpr::Literal(Value::Int64(-1)),
        ]);
        let out = eval_scalar_chunk(&expr, &chunk, &params).unwrap();
        assert_eq!(out.value(2), Value::Int64(-1));
    }

    #[test]
    fn update_expr_set_with_calculation() {
        let chunk = test_chunk();
        let mut params = ParameterBinding::new();
        params.bind(ParameterId(2), Value::Int64(100));
        let expr = UpdateExpr::Set {
            column: KeyPath::column("count"),
            value: Box::new(UpdateExpr::Calculate {
                op: ArithmeticOp::Add,
                operands: vec![
                    UpdateExpr::GetValue(KeyPath::column("count")),
                    UpdateExpr::GetConstValue(ParameterId(2)),
                ],
            }),
        };
        let (path, value) = eval_update_expr(&expr, &chunk, &params, 0).unwrap();
        assert_eq!(path, KeyPath::column("count"));
        assert_eq!(value, Value::Int64(101));
    }
}
