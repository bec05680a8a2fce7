//! Logical-plan lowering: `PlanNode` trees become physical operator trees.
//!
//! DDL nodes never reach this point; the dispatcher applies them to the
//! catalog directly. Computed select items are pushed into the group node
//! when one exists, so grouping sees them as ordinary columns.

use crate::operators::{OperatorKind, OperatorNode};
use crate::{ExecError, Result};
use otter_plan::{AggregateNode, PlanNode};
use otter_primitives::{DataChunk, LogicalType, Value};
use otter_store::DataTable;
use std::sync::Arc;

/// Lower one logical plan against its resolved table(s). `table` is `None`
/// only for constants-only selects (no FROM), which execute against a
/// virtual single-row input. `join_table` backs the aggregate's join spec
/// when one is present.
pub fn lower(
    node: &PlanNode,
    table: Option<Arc<DataTable>>,
    join_table: Option<Arc<DataTable>>,
) -> Result<OperatorNode> {
    match node {
        PlanNode::Aggregate(aggregate) => lower_aggregate(aggregate, table, join_table),
        PlanNode::Insert { payload, .. } => {
            let table = table.ok_or(ExecError::MalformedPlan("insert requires a table"))?;
            Ok(OperatorNode::new(OperatorKind::Insert { table, payload: payload.clone() }))
        }
        PlanNode::Update { r#match, updates, limit, .. } => {
            let table = table.ok_or(ExecError::MalformedPlan("update requires a table"))?;
            let mut source = scan_node(&table);
            if let Some(expr) = r#match {
                source = OperatorNode::new(OperatorKind::Match { expr: expr.clone() })
                    .with_left(source);
            }
            if limit.applies() {
                source =
                    OperatorNode::new(OperatorKind::Limit { limit: *limit }).with_left(source);
            }
            Ok(OperatorNode::new(OperatorKind::Update { table, updates: updates.clone() })
                .with_left(source))
        }
        PlanNode::Delete { r#match, limit, .. } => {
            let table = table.ok_or(ExecError::MalformedPlan("delete requires a table"))?;
            let mut source = scan_node(&table);
            if let Some(expr) = r#match {
                source = OperatorNode::new(OperatorKind::Match { expr: expr.clone() })
                    .with_left(source);
            }
            if limit.applies() {
                source =
                    OperatorNode::new(OperatorKind::Limit { limit: *limit }).with_left(source);
            }
            Ok(OperatorNode::new(OperatorKind::Delete).with_left(source))
        }
        _ => Err(ExecError::MalformedPlan("ddl nodes do not lower to physical plans")),
    }
}

fn scan_node(table: &Arc<DataTable>) -> OperatorNode {
    OperatorNode::new(OperatorKind::FullScan { table: Arc::clone(table) })
}

/// A transfer scan pre-loaded with one all-null row: the input of
/// constants-only queries.
fn virtual_row_source() -> OperatorNode {
    let mut chunk = DataChunk::new(&[LogicalType::Null]);
    let _ = chunk.push_row(&[Value::Null]);
    let mut node = OperatorNode::new(OperatorKind::TransferScan);
    node.inject_output(chunk);
    node
}

fn lower_aggregate(
    node: &AggregateNode,
    table: Option<Arc<DataTable>>,
    join_table: Option<Arc<DataTable>>,
) -> Result<OperatorNode> {
    let mut tree = match &table {
        Some(table) => scan_node(table),
        None => virtual_row_source(),
    };

    if let Some(join) = &node.join {
        let right = join_table
            .ok_or(ExecError::MalformedPlan("join spec without a resolved table"))?;
        tree = OperatorNode::new(OperatorKind::Join { on: join.on.clone() })
            .with_left(tree)
            .with_right(scan_node(&right));
    }

    if let Some(expr) = &node.r#match {
        tree = OperatorNode::new(OperatorKind::Match { expr: expr.clone() }).with_left(tree);
    }

    match (&node.group, node.columns.is_empty()) {
        (Some(group), _) => {
            // push plain computed select items into the group's phase-1 list
            let mut group = group.clone();
            for column in &node.columns {
                if !group.computed.iter().any(|c| c.alias == column.alias) {
                    group.computed.push(column.clone());
                }
            }
            tree = OperatorNode::new(OperatorKind::Group { node: group }).with_left(tree);
        }
        (None, false) => {
            tree = OperatorNode::new(OperatorKind::Projection { columns: node.columns.clone() })
                .with_left(tree);
        }
        (None, true) => {}
    }

    if !node.sort.is_empty() {
        tree = OperatorNode::new(OperatorKind::Sort { keys: node.sort.clone() }).with_left(tree);
    }
    if node.limit.applies() {
        tree = OperatorNode::new(OperatorKind::Limit { limit: node.limit }).with_left(tree);
    }
    Ok(tree)
}
