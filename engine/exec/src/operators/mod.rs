//! Physical operators: nodes of the executed plan tree.
//!
//! Operators are a closed set of tagged variants dispatched centrally, not
//! a trait hierarchy. Every node has up to two children and one output
//! chunk. The contract the executor drives:
//!
//! * `prepare` resets the tree for execution (injected scan outputs stay),
//! * `on_execute` computes the output once all inputs are ready, or leaves
//!   the node `Waiting` when it needs I/O,
//! * `find_waiting_operator` locates the blocked node so the executor can
//!   await its async resolution and re-execute,
//! * `inject_output` seeds a transfer scan with already-materialized rows.

pub mod aggregate;
pub mod group;
pub mod join;
pub mod sort;

use crate::eval;
use crate::{ExecError, Result};
use otter_plan::{
    AggregateFunc, ChunkPayload, CompareExpr, GroupNode, Limit, ParameterBinding, SelectColumn,
    SortKey, UpdateExpr,
};
use otter_primitives::{DataChunk, LogicalType, TransactionData, Value, Vector};
use otter_store::{CollectionScanState, DataTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-execution state shared by every operator of one plan.
pub struct PipelineContext {
    pub params: ParameterBinding,
    pub txn: TransactionData,
    /// Set by a transaction abort; suspension points observe it and
    /// short-circuit.
    pub cancelled: Arc<AtomicBool>,
}

impl PipelineContext {
    pub fn new(params: ParameterBinding, txn: TransactionData) -> Self {
        Self { params, txn, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Created,
    Waiting,
    Done,
}

/// The operator variants. Read-only ones feed chunks upward; the
/// read-write ones (insert/update/delete payload builders) produce the
/// chunk the executor hands to storage.
pub enum OperatorKind {
    /// Scan a table's visible rows. Suspends once, resolves through the
    /// storage layer.
    FullScan { table: Arc<DataTable> },
    /// Publishes whatever was injected into it.
    TransferScan,
    /// Materializes specific row ids (an index lookup's result) from a
    /// table.
    IndexScan { table: Arc<DataTable>, row_ids: Vec<i64> },
    /// Filter by a compare-expression tree.
    Match { expr: CompareExpr },
    /// Scalar projection: plain key lookups, COALESCE, CASE-WHEN and
    /// arithmetic select items.
    Projection { columns: Vec<SelectColumn> },
    /// A single whole-input aggregate.
    Aggregate { func: AggregateFunc, key: Option<String>, alias: String },
    /// GROUP BY with computed columns, HAVING and post-aggregates.
    Group { node: GroupNode },
    Sort { keys: Vec<SortKey> },
    Limit { limit: Limit },
    /// Nested-loop inner join of the two children on a predicate.
    Join { on: CompareExpr },
    /// Materialize an INSERT payload against the table schema.
    Insert { table: Arc<DataTable>, payload: ChunkPayload },
    /// Evaluate update expressions against matched rows; the output chunk
    /// carries the new values plus the source row ids.
    Update { table: Arc<DataTable>, updates: Vec<UpdateExpr> },
    /// Pass matched rows (with row ids) to the executor's delete path.
    Delete,
    /// Produces an empty chunk.
    Empty { types: Vec<LogicalType> },
}

pub struct OperatorNode {
    pub kind: OperatorKind,
    pub left: Option<Box<OperatorNode>>,
    pub right: Option<Box<OperatorNode>>,
    output: Option<DataChunk>,
    state: NodeState,
}

impl OperatorNode {
    pub fn new(kind: OperatorKind) -> Self {
        Self { kind, left: None, right: None, output: None, state: NodeState::Created }
    }

    pub fn with_left(mut self, child: OperatorNode) -> Self {
        self.left = Some(Box::new(child));
        self
    }

    pub fn with_right(mut self, child: OperatorNode) -> Self {
        self.right = Some(Box::new(child));
        self
    }

    pub fn output(&self) -> Option<&DataChunk> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<DataChunk> {
        self.output.take()
    }

    pub fn is_executed(&self) -> bool {
        self.state == NodeState::Done
    }

    /// Seed this node with already-materialized rows; it will publish them
    /// without touching storage. Tests and the dispatcher's shared-scan
    /// path use this.
    pub fn inject_output(&mut self, chunk: DataChunk) {
        self.output = Some(chunk);
        self.state = NodeState::Done;
    }

    /// Recursively reset for execution. Injected transfer-scan outputs are
    /// kept; everything else starts over.
    pub fn prepare(&mut self) {
        let keep = matches!(self.kind, OperatorKind::TransferScan) && self.output.is_some();
        if !keep {
            self.output = None;
            self.state = NodeState::Created;
        }
        if let Some(left) = &mut self.left {
            left.prepare();
        }
        if let Some(right) = &mut self.right {
            right.prepare();
        }
    }

    /// The deepest node blocked on I/O, if any.
    pub fn find_waiting_operator(&mut self) -> Option<&mut OperatorNode> {
        let self_ptr: *mut Self = self;
        // SAFETY: the three branches below borrow disjoint data (the left
        // subtree, the right subtree, or `self` itself) and never overlap at
        // runtime; the raw pointer only works around the borrow checker's
        // inability to see that a recursive call's borrow has already ended
        // by the time control reaches the next branch.
        unsafe {
            if let Some(left) = &mut (*self_ptr).left {
                if let Some(found) = left.find_waiting_operator() {
                    return Some(found);
                }
            }
            if let Some(right) = &mut (*self_ptr).right {
                if let Some(found) = right.find_waiting_operator() {
                    return Some(found);
                }
            }
            if (*self_ptr).state == NodeState::Waiting { Some(&mut *self_ptr) } else { None }
        }
    }

    /// Execute as far as inputs allow. Scans flag themselves `Waiting` on
    /// first touch; the executor resolves them and calls this again.
    pub fn on_execute(&mut self, ctx: &PipelineContext) -> Result<()> {
        if self.state == NodeState::Done {
            return Ok(());
        }

        if let Some(left) = &mut self.left {
            left.on_execute(ctx)?;
        }
        if let Some(right) = &mut self.right {
            right.on_execute(ctx)?;
        }
        let left_ready = self.left.as_ref().map(|n| n.is_executed()).unwrap_or(true);
        let right_ready = self.right.as_ref().map(|n| n.is_executed()).unwrap_or(true);
        if !left_ready || !right_ready {
            return Ok(());
        }

        match &self.kind {
            // I/O-bound sources: suspend on first touch.
            OperatorKind::FullScan { .. } | OperatorKind::IndexScan { .. } => {
                if self.state == NodeState::Created {
                    self.state = NodeState::Waiting;
                }
                Ok(())
            }
            OperatorKind::TransferScan => {
                // nothing was injected: publish an empty chunk
                if self.output.is_none() {
                    self.output = Some(DataChunk::default());
                }
                self.state = NodeState::Done;
                Ok(())
            }
            _ => {
                let output = self.compute(ctx)?;
                self.output = Some(output);
                self.state = NodeState::Done;
                Ok(())
            }
        }
    }

    /// Resolve a waiting scan: the executor awaits this at its suspension
    /// point. The actual storage read happens here.
    pub async fn resolve_async(&mut self, ctx: &PipelineContext) -> Result<()> {
        debug_assert_eq!(self.state, NodeState::Waiting);
        // the worker is free between suspension and resumption
        tokio::task::yield_now().await;
        let output = match &self.kind {
            OperatorKind::FullScan { table } => scan_all(table, ctx.txn)?,
            OperatorKind::IndexScan { table, row_ids } => {
                let column_ids: Vec<usize> = (0..table.column_count()).collect();
                let mut chunk = table.fetch(&column_ids, row_ids)?;
                apply_aliases(table, &mut chunk);
                let mut ids = Vector::with_len(LogicalType::Int64, row_ids.len());
                for (i, id) in row_ids.iter().enumerate() {
                    ids.set_value(i, &Value::Int64(*id))?;
                }
                chunk.set_row_ids(ids);
                chunk
            }
            _ => return Err(ExecError::MalformedPlan("resolve_async on a non-scan operator")),
        };
        self.output = Some(output);
        self.state = NodeState::Done;
        Ok(())
    }

    fn left_output(&self) -> Result<&DataChunk> {
        self.left
            .as_ref()
            .and_then(|n| n.output())
            .ok_or(ExecError::MalformedPlan("operator requires a left input"))
    }

    fn compute(&self, ctx: &PipelineContext) -> Result<DataChunk> {
        match &self.kind {
            OperatorKind::Match { expr } => {
                let input = self.left_output()?;
                let selected = eval::filter_chunk(expr, input, &ctx.params)?;
                Ok(input.slice(&selected))
            }
            OperatorKind::Projection { columns } => {
                let input = self.left_output()?;
                if columns.is_empty() {
                    return Ok(input.clone());
                }
                let mut out_columns = Vec::with_capacity(columns.len());
                for column in columns {
                    let mut vector = eval::eval_scalar_chunk(&column.expr, input, &ctx.params)?;
                    vector.set_alias(column.alias.clone());
                    out_columns.push(vector);
                }
                let mut out = DataChunk::from_columns(out_columns, input.size());
                if let Some(ids) = input.row_ids() {
                    out.set_row_ids(ids.clone());
                }
                Ok(out)
            }
            OperatorKind::Aggregate { func, key, alias } => {
                let input = self.left_output()?;
                let value = aggregate::compute(func, key.as_deref(), input)?;
                let ty = if value.is_null() { LogicalType::Int64 } else { value.logical_type() };
                let mut vector = Vector::with_len(ty, 1);
                vector.set_value(0, &value)?;
                vector.set_alias(alias.clone());
                Ok(DataChunk::from_columns(vec![vector], 1))
            }
            OperatorKind::Group { node } => {
                let input = self.left_output()?;
                group::execute(node, input, &ctx.params)
            }
            OperatorKind::Sort { keys } => {
                let input = self.left_output()?;
                sort::execute(keys, input)
            }
            OperatorKind::Limit { limit } => {
                let input = self.left_output()?;
                match limit.0 {
                    Some(n) if (input.size() as u64) > n => {
                        let sel: Vec<usize> = (0..n as usize).collect();
                        Ok(input.slice(&sel))
                    }
                    _ => Ok(input.clone()),
                }
            }
            OperatorKind::Join { on } => {
                let left = self.left_output()?;
                let right = self
                    .right
                    .as_ref()
                    .and_then(|n| n.output())
                    .ok_or(ExecError::MalformedPlan("join requires a right input"))?;
                join::execute(on, left, right, &ctx.params)
            }
            OperatorKind::Insert { table, payload } => materialize_insert(table, payload),
            OperatorKind::Update { table, updates } => {
                let input = self.left_output()?;
                apply_updates(table, updates, input, &ctx.params)
            }
            OperatorKind::Delete => Ok(self.left_output()?.clone()),
            OperatorKind::Empty { types } => Ok(DataChunk::new(types)),
            OperatorKind::FullScan { .. }
            | OperatorKind::IndexScan { .. }
            | OperatorKind::TransferScan => {
                unreachable!("scan outputs are produced in resolve_async")
            }
        }
    }
}

/// Scan every visible batch of `table` into one output chunk with aliases
/// and row ids attached.
fn scan_all(table: &Arc<DataTable>, txn: TransactionData) -> Result<DataChunk> {
    let column_ids: Vec<usize> = (0..table.column_count()).collect();
    let mut state: CollectionScanState = table.initialize_scan(column_ids, txn);
    let types = table.types();
    let mut out = DataChunk::new(&types);
    apply_aliases(table, &mut out);
    let mut all_ids = Vector::empty(LogicalType::Int64);
    while let Some(chunk) = table.scan_next(&mut state)? {
        if let Some(ids) = chunk.row_ids() {
            for row in 0..ids.len() {
                all_ids.push_value(&ids.value(row))?;
            }
        }
        out.append(&chunk)?;
    }
    if all_ids.len() == out.size() {
        out.set_row_ids(all_ids);
    }
    Ok(out)
}

/// Name the chunk's columns after the table's schema.
fn apply_aliases(table: &Arc<DataTable>, chunk: &mut DataChunk) {
    for (column, definition) in chunk.columns_mut().iter_mut().zip(table.columns()) {
        column.set_alias(definition.name.clone());
    }
}

/// Reorder an INSERT payload into the table's column order, null-filling
/// unnamed columns, and type-check against the schema.
fn materialize_insert(table: &Arc<DataTable>, payload: &ChunkPayload) -> Result<DataChunk> {
    let definitions = table.columns();
    let types = table.types();
    let mut chunk = DataChunk::new(&types);
    apply_aliases(table, &mut chunk);

    // payload column -> table column mapping
    let mapping: Vec<Option<usize>> = definitions
        .iter()
        .map(|def| payload.columns.iter().position(|name| *name == def.name))
        .collect();

    for row in &payload.rows {
        let mut out_row = Vec::with_capacity(definitions.len());
        for (definition, source) in definitions.iter().zip(&mapping) {
            let value = match source {
                Some(idx) => row.get(*idx).cloned().unwrap_or(Value::Null),
                None => Value::Null,
            };
            if value.is_null() && definition.not_null {
                return Err(ExecError::NullConstraint { column: definition.name.clone() });
            }
            out_row.push(value);
        }
        chunk.push_row(&out_row)?;
    }
    Ok(chunk)
}

/// Build the post-update image of the matched rows: the input chunk's
/// columns with every SET applied, row ids preserved.
fn apply_updates(
    table: &Arc<DataTable>,
    updates: &[UpdateExpr],
    input: &DataChunk,
    params: &ParameterBinding,
) -> Result<DataChunk> {
    let mut out = input.clone();
    for row in 0..input.size() {
        for update in updates {
            let (path, value) = eval::eval_update_expr(update, input, params, row)?;
            let column_idx = out
                .column_index_by_alias(path.root())
                .or_else(|| table.column_index(path.root()))
                .ok_or_else(|| ExecError::UnknownColumn(path.root().to_string()))?;
            if path.is_nested() {
                let mut current = out.value(column_idx, row);
                set_nested_value(&mut current, &path.parts[1..], value);
                out.set_value(column_idx, row, &current)?;
            } else {
                out.set_value(column_idx, row, &value)?;
            }
        }
    }
    Ok(out)
}

fn set_nested_value(current: &mut Value, path: &[String], new_value: Value) {
    if path.is_empty() {
        *current = new_value;
        return;
    }
    if let Value::Struct(fields) = current {
        if let Some((_, child)) = fields.iter_mut().find(|(name, _)| name == &path[0]) {
            set_nested_value(child, &path[1..], new_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::{CompareOp, KeyPath, Operand};

    fn injected_chunk(values: &[i64]) -> DataChunk {
        let mut chunk = DataChunk::new(&[LogicalType::Int64]);
        for &v in values {
            chunk.push_row(&[Value::Int64(v)]).unwrap();
        }
        chunk.column_mut(0).set_alias("value");
        chunk
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new(ParameterBinding::new(), TransactionData::none())
    }

    #[test]
    fn transfer_scan_publishes_injected_rows() {
        let mut scan = OperatorNode::new(OperatorKind::TransferScan);
        scan.inject_output(injected_chunk(&[1, 2, 3]));
        scan.prepare();
        scan.on_execute(&ctx()).unwrap();
        assert!(scan.is_executed());
        assert_eq!(scan.output().unwrap().size(), 3);
    }

    #[test]
    fn match_filters_rows() {
        let mut scan = OperatorNode::new(OperatorKind::TransferScan);
        scan.inject_output(injected_chunk(&[1, 5, 10, 3]));
        let mut root = OperatorNode::new(OperatorKind::Match {
            expr: CompareExpr::Compare {
                left: Operand::Key(KeyPath::column("value")),
                op: CompareOp::Gte,
                right: Operand::Literal(Value::Int64(5)),
            },
        })
        .with_left(scan);

        root.prepare();
        root.on_execute(&ctx()).unwrap();
        let output = root.output().unwrap();
        assert_eq!(output.size(), 2);
        assert_eq!(output.value(0, 0), Value::Int64(5));
        assert_eq!(output.value(0, 1), Value::Int64(10));
    }

    #[test]
    fn limit_truncates() {
        let mut scan = OperatorNode::new(OperatorKind::TransferScan);
        scan.inject_output(injected_chunk(&[1, 2, 3, 4, 5]));
        let mut root =
            OperatorNode::new(OperatorKind::Limit { limit: Limit::new(2) }).with_left(scan);
        root.prepare();
        root.on_execute(&ctx()).unwrap();
        assert_eq!(root.output().unwrap().size(), 2);
    }

    #[test]
    fn empty_operator_keeps_type_signature() {
        let mut node = OperatorNode::new(OperatorKind::Empty {
            types: vec![LogicalType::Int64, LogicalType::String],
        });
        node.prepare();
        node.on_execute(&ctx()).unwrap();
        let output = node.output().unwrap();
        assert_eq!(output.size(), 0);
        assert_eq!(output.types(), vec![LogicalType::Int64, LogicalType::String]);
    }

    #[test]
    fn empty_input_chunk_flows_through_match() {
        let mut scan = OperatorNode::new(OperatorKind::TransferScan);
        scan.inject_output(injected_chunk(&[]));
        let mut root = OperatorNode::new(OperatorKind::Match {
            expr: CompareExpr::all_true(),
        })
        .with_left(scan);
        root.prepare();
        root.on_execute(&ctx()).unwrap();
        let output = root.output().unwrap();
        assert_eq!(output.size(), 0);
        assert_eq!(output.types(), vec![LogicalType::Int64]);
    }
}
