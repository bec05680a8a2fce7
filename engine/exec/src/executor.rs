//! The async executor: drives one physical plan end to end.
//!
//! The canonical loop is prepare → `on_execute` → await the waiting scan's
//! future → re-execute, until the root reports executed. Storage side
//! effects of DML run after local execution; the WAL record is appended
//! (and fsynced) before the cursor is returned, while the deferred disk
//! flush future is parked on a bounded pending list.

use crate::cursor::{Cursor, ErrorCode};
use crate::operators::{OperatorKind, OperatorNode, PipelineContext};
use crate::planner;
use crate::{ExecError, Result};
use otter_plan::{ParameterBinding, PlanNode};
use otter_primitives::{DataChunk, TransactionData, Value};
use otter_store::{DataTable, StoreError};
use otter_wal::WalWriter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A storage mutation made under a transaction; the session replays these
/// as commit/revert calls when it resolves.
pub enum WriteEffect {
    Append { table: Arc<DataTable>, row_start: i64, count: u64 },
    Delete { table: Arc<DataTable> },
}

/// Everything the executor needs to run one plan: the resolved table, its
/// primary key (for duplicate filtering on insert), the transaction, and
/// the journal collecting transactional write effects.
pub struct ExecutionContext {
    pub table: Option<Arc<DataTable>>,
    /// Second table of a join, when the plan carries one.
    pub join_table: Option<Arc<DataTable>>,
    /// Qualified name, also the WAL shard selector.
    pub table_name: String,
    pub primary_key: Vec<String>,
    pub txn: TransactionData,
    pub cancelled: Arc<AtomicBool>,
    pub journal: Option<Arc<Mutex<Vec<WriteEffect>>>>,
}

impl ExecutionContext {
    pub fn without_table(txn: TransactionData) -> Self {
        Self {
            table: None,
            join_table: None,
            table_name: String::new(),
            primary_key: Vec::new(),
            txn,
            cancelled: Arc::new(AtomicBool::new(false)),
            journal: None,
        }
    }

    pub fn for_table(table: Arc<DataTable>, name: impl Into<String>, txn: TransactionData) -> Self {
        Self {
            table: Some(table),
            join_table: None,
            table_name: name.into(),
            primary_key: Vec::new(),
            txn,
            cancelled: Arc::new(AtomicBool::new(false)),
            journal: None,
        }
    }
}

const MAX_PENDING_FLUSHES: usize = 16;

pub struct Executor {
    wal: Option<Arc<WalWriter>>,
    pending_flushes: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Executor {
    pub fn new(wal: Option<Arc<WalWriter>>) -> Self {
        Self { wal, pending_flushes: Mutex::new(Vec::new()) }
    }

    /// Execute one plan and return its cursor. Errors become error cursors;
    /// nothing unwinds past this point.
    pub async fn execute_plan(
        &self,
        node: &PlanNode,
        params: &ParameterBinding,
        ctx: &ExecutionContext,
    ) -> Cursor {
        match self.execute_inner(node, params, ctx).await {
            Ok(cursor) => cursor,
            Err(err) => Cursor::error(error_code(&err), err.to_string()),
        }
    }

    async fn execute_inner(
        &self,
        node: &PlanNode,
        params: &ParameterBinding,
        ctx: &ExecutionContext,
    ) -> Result<Cursor> {
        self.poll_pending();

        let mut root = planner::lower(node, ctx.table.clone(), ctx.join_table.clone())?;
        let pipeline = PipelineContext {
            params: params.clone(),
            txn: ctx.txn,
            cancelled: Arc::clone(&ctx.cancelled),
        };
        self.drive(&mut root, &pipeline).await?;

        let cursor = match node {
            PlanNode::Insert { .. } => self.apply_insert(&mut root, ctx)?,
            PlanNode::Update { .. } => self.apply_update(&mut root)?,
            PlanNode::Delete { .. } => self.apply_delete(&mut root, ctx)?,
            _ => Cursor::Rows(root.take_output().unwrap_or_default()),
        };

        if cursor.is_success() && node.is_dml() {
            self.commit_to_wal(node, params, ctx).await?;
        }
        Ok(cursor)
    }

    /// The canonical operator drive loop with its suspension points.
    async fn drive(&self, root: &mut OperatorNode, pipeline: &PipelineContext) -> Result<()> {
        root.prepare();
        loop {
            if pipeline.is_cancelled() {
                return Err(ExecError::Aborted);
            }
            root.on_execute(pipeline)?;
            if root.is_executed() {
                return Ok(());
            }
            match root.find_waiting_operator() {
                Some(waiting) => waiting.resolve_async(pipeline).await?,
                None => return Err(ExecError::MalformedPlan("plan made no progress")),
            }
        }
    }

    fn apply_insert(&self, root: &mut OperatorNode, ctx: &ExecutionContext) -> Result<Cursor> {
        let table = match &root.kind {
            OperatorKind::Insert { table, .. } => Arc::clone(table),
            _ => return Err(ExecError::MalformedPlan("insert plan without insert root")),
        };
        let chunk = root.take_output().unwrap_or_default();

        // Primary-key duplicate filtering: rows whose key already exists
        // (or repeats inside the payload) are dropped, and the reported
        // count shrinks accordingly.
        let chunk = if ctx.primary_key.is_empty() {
            chunk
        } else {
            self.filter_duplicate_keys(&table, &ctx.primary_key, chunk, ctx.txn)?
        };

        let inserted = chunk.size() as u64;
        if inserted > 0 {
            let mut state = table.begin_append(ctx.txn)?;
            table.append(&chunk, &mut state)?;
            if ctx.txn.is_transactional() {
                if let Some(journal) = &ctx.journal {
                    journal.lock().push(WriteEffect::Append {
                        table: Arc::clone(&table),
                        row_start: state.row_start,
                        count: state.appended,
                    });
                }
            }
        }
        Ok(Cursor::Affected(inserted))
    }

    fn filter_duplicate_keys(
        &self,
        table: &Arc<DataTable>,
        primary_key: &[String],
        chunk: DataChunk,
        txn: TransactionData,
    ) -> Result<DataChunk> {
        let key_ids: Vec<usize> =
            primary_key.iter().filter_map(|name| table.column_index(name)).collect();
        if key_ids.len() != primary_key.len() {
            return Ok(chunk);
        }

        let mut existing: HashSet<Vec<Value>> = HashSet::new();
        let mut state = table.initialize_scan(key_ids.clone(), txn);
        while let Some(batch) = table.scan_next(&mut state)? {
            for row in 0..batch.size() {
                existing.insert((0..key_ids.len()).map(|c| batch.value(c, row)).collect());
            }
        }

        let mut keep = Vec::with_capacity(chunk.size());
        for row in 0..chunk.size() {
            // insert chunks are in table column order, so the ids line up
            let key: Vec<Value> = key_ids.iter().map(|&c| chunk.value(c, row)).collect();
            if existing.insert(key) {
                keep.push(row);
            }
        }
        if keep.len() == chunk.size() {
            return Ok(chunk);
        }
        tracing::debug!(
            target: "exec",
            dropped = chunk.size() - keep.len(),
            "insert truncated by duplicate primary keys"
        );
        Ok(chunk.slice(&keep))
    }

    fn apply_update(&self, root: &mut OperatorNode) -> Result<Cursor> {
        let table = match &root.kind {
            OperatorKind::Update { table, .. } => Arc::clone(table),
            _ => return Err(ExecError::MalformedPlan("update plan without update root")),
        };
        let mut chunk = root.take_output().unwrap_or_default();
        let row_ids = match chunk.take_row_ids() {
            Some(ids) => ids,
            None => return Ok(Cursor::Affected(0)),
        };
        let affected = chunk.size() as u64;
        table.update(&row_ids, &chunk)?;
        Ok(Cursor::Affected(affected))
    }

    fn apply_delete(&self, root: &mut OperatorNode, ctx: &ExecutionContext) -> Result<Cursor> {
        let table = ctx
            .table
            .as_ref()
            .ok_or(ExecError::MalformedPlan("delete requires a table"))?;
        let mut chunk = root.take_output().unwrap_or_default();
        let row_ids = match chunk.take_row_ids() {
            Some(ids) => ids,
            None => return Ok(Cursor::Affected(0)),
        };
        let deleted = table.delete_rows(&row_ids, chunk.size(), ctx.txn.transaction_id)?;
        if ctx.txn.is_transactional() {
            if let Some(journal) = &ctx.journal {
                journal.lock().push(WriteEffect::Delete { table: Arc::clone(table) });
            }
        }
        Ok(Cursor::Affected(deleted))
    }

    /// Append the DATA record (fsynced by the writer) and park the deferred
    /// disk flush on the bounded pending list.
    async fn commit_to_wal(
        &self,
        node: &PlanNode,
        params: &ParameterBinding,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let Some(wal) = &self.wal else { return Ok(()) };
        let wal_id = wal.append(&ctx.table_name, ctx.txn.transaction_id, node, params)?;
        tracing::trace!(target: "exec", wal_id, table = %ctx.table_name, "dml recorded in wal");

        let mut pending = self.pending_flushes.lock();
        if pending.len() >= MAX_PENDING_FLUSHES {
            // backpressure: wait for the oldest flush before queueing more
            let oldest = pending.remove(0);
            drop(pending);
            let _ = oldest.await;
            pending = self.pending_flushes.lock();
        }
        let wal = Arc::clone(wal);
        pending.push(tokio::task::spawn_blocking(move || {
            if let Err(err) = wal.flush() {
                tracing::warn!(target: "exec", %err, "deferred wal flush failed");
            }
        }));
        Ok(())
    }

    fn poll_pending(&self) {
        self.pending_flushes.lock().retain(|handle| !handle.is_finished());
    }

    /// Drain every outstanding flush; engine close calls this.
    pub async fn drain_pending(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.pending_flushes.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn error_code(err: &ExecError) -> ErrorCode {
    match err {
        ExecError::UnknownColumn(_) => ErrorCode::UnknownColumn,
        ExecError::Coercion(_) | ExecError::NonNumericArithmetic => ErrorCode::TypeCoercion,
        ExecError::UnboundParameter(_) => ErrorCode::UnboundParameter,
        ExecError::BadRegex(_) => ErrorCode::InvalidPlan,
        ExecError::NullConstraint { .. } => ErrorCode::ConstraintViolation,
        ExecError::MalformedPlan(_) => ErrorCode::InvalidPlan,
        ExecError::Aborted => ErrorCode::Aborted,
        ExecError::Wal(_) => ErrorCode::DurabilityFailure,
        ExecError::Store(err) => match err {
            StoreError::TableAltered => ErrorCode::TransactionConflict,
            StoreError::ChecksumMismatch { .. } | StoreError::InvalidHeader => {
                ErrorCode::Corruption
            }
            _ => ErrorCode::DurabilityFailure,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::{
        AggregateNode, ChunkPayload, CollectionName, CompareExpr, CompareOp, KeyPath, Limit,
        Operand, ParameterId,
    };
    use otter_primitives::LogicalType;
    use otter_store::{BlockManager, BufferPool, ColumnDefinition, InMemoryBlockManager};

    fn test_table() -> Arc<DataTable> {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let pool = Arc::new(BufferPool::new(1 << 24, bm.block_alloc_size()));
        Arc::new(DataTable::new(
            bm,
            pool,
            vec![ColumnDefinition::new("value", LogicalType::Int64)],
            "test",
        ))
    }

    fn insert_node(name: &CollectionName, values: impl IntoIterator<Item = i64>) -> PlanNode {
        PlanNode::Insert {
            collection: name.clone(),
            payload: ChunkPayload {
                columns: vec!["value".into()],
                rows: values.into_iter().map(|v| vec![Value::Int64(v)]).collect(),
            },
        }
    }

    fn scan_node(name: &CollectionName) -> PlanNode {
        PlanNode::Aggregate(AggregateNode::scan_all(name.clone()))
    }

    #[tokio::test]
    async fn insert_then_select_round_trip() {
        let table = test_table();
        let name = CollectionName::new("db", "test");
        let executor = Executor::new(None);
        let params = ParameterBinding::new();

        let ctx = ExecutionContext::for_table(Arc::clone(&table), "db.test", TransactionData::none());
        let cursor = executor.execute_plan(&insert_node(&name, 0..10), &params, &ctx).await;
        assert!(cursor.is_success());
        assert_eq!(cursor.size(), 10);

        let cursor = executor.execute_plan(&scan_node(&name), &params, &ctx).await;
        assert!(cursor.is_success());
        assert_eq!(cursor.size(), 10);
    }

    #[tokio::test]
    async fn delete_with_match_reports_count() {
        let table = test_table();
        let name = CollectionName::new("db", "test");
        let executor = Executor::new(None);
        let params = ParameterBinding::new();
        let ctx = ExecutionContext::for_table(Arc::clone(&table), "db.test", TransactionData::none());

        executor.execute_plan(&insert_node(&name, 0..10), &params, &ctx).await;

        let delete = PlanNode::Delete {
            collection: name.clone(),
            r#match: Some(CompareExpr::Compare {
                left: Operand::Key(KeyPath::column("value")),
                op: CompareOp::Lt,
                right: Operand::Literal(Value::Int64(5)),
            }),
            limit: Limit::unlimit(),
        };
        let cursor = executor.execute_plan(&delete, &params, &ctx).await;
        assert!(cursor.is_success());
        assert_eq!(cursor.size(), 5);

        let cursor = executor.execute_plan(&scan_node(&name), &params, &ctx).await;
        assert_eq!(cursor.size(), 5);
    }

    #[tokio::test]
    async fn update_with_parameter() {
        let table = test_table();
        let name = CollectionName::new("db", "test");
        let executor = Executor::new(None);
        let ctx = ExecutionContext::for_table(Arc::clone(&table), "db.test", TransactionData::none());

        executor
            .execute_plan(&insert_node(&name, [1, 2, 3]), &ParameterBinding::new(), &ctx)
            .await;

        let mut params = ParameterBinding::new();
        params.bind(ParameterId(1), Value::Int64(2));
        params.bind(ParameterId(2), Value::Int64(42));
        let update = PlanNode::Update {
            collection: name.clone(),
            r#match: Some(CompareExpr::Compare {
                left: Operand::Key(KeyPath::column("value")),
                op: CompareOp::Eq,
                right: Operand::Parameter(ParameterId(1)),
            }),
            updates: vec![otter_plan::UpdateExpr::Set {
                column: KeyPath::column("value"),
                value: Box::new(otter_plan::UpdateExpr::GetConstValue(ParameterId(2))),
            }],
            limit: Limit::unlimit(),
        };
        let cursor = executor.execute_plan(&update, &params, &ctx).await;
        assert!(cursor.is_success());
        assert_eq!(cursor.size(), 1);

        let cursor = executor.execute_plan(&scan_node(&name), &ParameterBinding::new(), &ctx).await;
        let chunk = cursor.chunk().unwrap();
        let mut values: Vec<i64> =
            (0..chunk.size()).map(|r| chunk.value(0, r).as_i64().unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 3, 42]);
    }

    #[tokio::test]
    async fn primary_key_duplicates_truncate_the_insert() {
        let table = test_table();
        let name = CollectionName::new("db", "test");
        let executor = Executor::new(None);
        let params = ParameterBinding::new();
        let mut ctx =
            ExecutionContext::for_table(Arc::clone(&table), "db.test", TransactionData::none());
        ctx.primary_key = vec!["value".into()];

        let cursor = executor.execute_plan(&insert_node(&name, [1, 2, 2, 3]), &params, &ctx).await;
        assert_eq!(cursor.size(), 3);

        let cursor = executor.execute_plan(&insert_node(&name, [3, 4]), &params, &ctx).await;
        assert_eq!(cursor.size(), 1);
        assert_eq!(table.total_rows(), 4);
    }

    #[tokio::test]
    async fn index_scan_materializes_looked_up_rows() {
        let table = test_table();
        let name = CollectionName::new("db", "test");
        let executor = Executor::new(None);
        let ctx = ExecutionContext::for_table(Arc::clone(&table), "db.test", TransactionData::none());
        executor
            .execute_plan(&insert_node(&name, 0..100), &ParameterBinding::new(), &ctx)
            .await;

        // row ids as an index lookup would produce them
        let mut root = OperatorNode::new(OperatorKind::IndexScan {
            table: Arc::clone(&table),
            row_ids: vec![5, 42, 99],
        });
        let pipeline = crate::operators::PipelineContext::new(
            ParameterBinding::new(),
            TransactionData::none(),
        );
        root.prepare();
        root.on_execute(&pipeline).unwrap();
        let waiting = root.find_waiting_operator().expect("index scan suspends");
        waiting.resolve_async(&pipeline).await.unwrap();
        root.on_execute(&pipeline).unwrap();

        let output = root.output().unwrap();
        assert_eq!(output.size(), 3);
        assert_eq!(output.value(0, 1), Value::Int64(42));
        assert_eq!(output.row_ids().unwrap().value(2), Value::Int64(99));
    }

    #[tokio::test]
    async fn cancelled_context_returns_aborted_cursor() {
        let table = test_table();
        let name = CollectionName::new("db", "test");
        let executor = Executor::new(None);
        let ctx = ExecutionContext::for_table(Arc::clone(&table), "db.test", TransactionData::none());
        ctx.cancelled.store(true, std::sync::atomic::Ordering::Release);

        let cursor = executor.execute_plan(&scan_node(&name), &ParameterBinding::new(), &ctx).await;
        assert_eq!(cursor.error_code(), Some(ErrorCode::Aborted));
    }
}
