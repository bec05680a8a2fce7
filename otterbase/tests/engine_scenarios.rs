//! End-to-end engine scenarios: transactional visibility, deletes,
//! grouping, arithmetic edge cases, and durability across reopen.

use otter_plan::{
    AggregateFunc, AggregateNode, ArithmeticOp, ChunkPayload, CollectionName, ColumnSpec,
    CompareExpr, CompareOp, GroupNode, GroupValue, KeyPath, Limit, Operand, ParameterBinding,
    PlanNode, ScalarExpr, SelectColumn, SortKey, StorageMode,
};
use otter_primitives::{LogicalType, Value};
use otterbase::{Engine, EngineConfig, SessionId};

fn params() -> ParameterBinding {
    ParameterBinding::new()
}

fn test_collection() -> CollectionName {
    CollectionName::new("db", "test")
}

async fn engine_with_test_table() -> Engine {
    otter_primitives::testonly::init_test_logger();
    let engine = Engine::open(EngineConfig::in_memory()).await.unwrap();
    let session = engine.create_session();
    let cursor = engine
        .execute(session, &PlanNode::CreateDatabase { database: "db".into() }, &params())
        .await;
    assert!(cursor.is_success());
    let cursor = engine
        .execute(
            session,
            &PlanNode::CreateCollection {
                collection: test_collection(),
                schema: vec![ColumnSpec::new("value", LogicalType::Int64)],
                primary_key: vec![],
                storage_mode: StorageMode::InMemory,
            },
            &params(),
        )
        .await;
    assert!(cursor.is_success());
    engine
}

fn insert_values(values: impl IntoIterator<Item = i64>) -> PlanNode {
    PlanNode::Insert {
        collection: test_collection(),
        payload: ChunkPayload {
            columns: vec!["value".into()],
            rows: values.into_iter().map(|v| vec![Value::Int64(v)]).collect(),
        },
    }
}

fn select_all() -> PlanNode {
    PlanNode::Aggregate(AggregateNode::scan_all(test_collection()))
}

async fn scan_count(engine: &Engine, session: SessionId) -> u64 {
    let cursor = engine.execute(session, &select_all(), &params()).await;
    assert!(cursor.is_success(), "scan failed: {cursor:?}");
    cursor.size()
}

#[tokio::test]
async fn append_commit_visible() {
    let engine = engine_with_test_table().await;
    let session = engine.create_session();

    engine.begin_transaction(session);
    let cursor = engine.execute(session, &insert_values(0..10), &params()).await;
    assert!(cursor.is_success());
    assert_eq!(cursor.size(), 10);
    engine.commit(session).unwrap();

    let fresh = engine.create_session();
    assert_eq!(scan_count(&engine, fresh).await, 10);
}

#[tokio::test]
async fn append_abort_invisible() {
    let engine = engine_with_test_table().await;
    let session = engine.create_session();

    engine.begin_transaction(session);
    let cursor = engine.execute(session, &insert_values(0..10), &params()).await;
    assert!(cursor.is_success());
    engine.abort(session);

    let fresh = engine.create_session();
    assert_eq!(scan_count(&engine, fresh).await, 0);
}

#[tokio::test]
async fn own_writes_visible_to_self_only() {
    let engine = engine_with_test_table().await;
    let t1 = engine.create_session();
    let t2 = engine.create_session();

    engine.begin_transaction(t1);
    engine.begin_transaction(t2);

    let cursor = engine.execute(t1, &insert_values(0..5), &params()).await;
    assert!(cursor.is_success());

    assert_eq!(scan_count(&engine, t1).await, 5);
    assert_eq!(scan_count(&engine, t2).await, 0);
}

#[tokio::test]
async fn partial_delete_leaves_survivors() {
    let engine = engine_with_test_table().await;
    let session = engine.create_session();

    // auto-visible insert
    let cursor = engine.execute(session, &insert_values(0..10), &params()).await;
    assert!(cursor.is_success());

    let txn_session = engine.create_session();
    engine.begin_transaction(txn_session);
    let delete = PlanNode::Delete {
        collection: test_collection(),
        r#match: Some(CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("value")),
            op: CompareOp::Lt,
            right: Operand::Literal(Value::Int64(5)),
        }),
        limit: Limit::unlimit(),
    };
    let cursor = engine.execute(txn_session, &delete, &params()).await;
    assert!(cursor.is_success());
    assert_eq!(cursor.size(), 5);
    engine.commit(txn_session).unwrap();

    let fresh = engine.create_session();
    let cursor = engine.execute(fresh, &select_all(), &params()).await;
    let chunk = cursor.chunk().unwrap();
    let mut values: Vec<i64> =
        (0..chunk.size()).map(|row| chunk.value(0, row).as_i64().unwrap()).collect();
    values.sort_unstable();
    assert_eq!(values, vec![5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn group_by_bool_with_aggregates() {
    otter_primitives::testonly::init_test_logger();
    let engine = Engine::open(EngineConfig::in_memory()).await.unwrap();
    let session = engine.create_session();

    engine
        .execute(session, &PlanNode::CreateDatabase { database: "db".into() }, &params())
        .await;
    let cursor = engine
        .execute(
            session,
            &PlanNode::CreateCollection {
                collection: test_collection(),
                schema: vec![
                    ColumnSpec::new("count", LogicalType::Int64),
                    ColumnSpec::new("count_bool", LogicalType::Boolean),
                ],
                primary_key: vec![],
                storage_mode: StorageMode::InMemory,
            },
            &params(),
        )
        .await;
    assert!(cursor.is_success());

    let rows: Vec<Vec<Value>> = (1..=100)
        .map(|n: i64| vec![Value::Int64(n), Value::Boolean(n % 2 == 1)])
        .collect();
    let cursor = engine
        .execute(
            session,
            &PlanNode::Insert {
                collection: test_collection(),
                payload: ChunkPayload {
                    columns: vec!["count".into(), "count_bool".into()],
                    rows,
                },
            },
            &params(),
        )
        .await;
    assert_eq!(cursor.size(), 100);

    let query = PlanNode::Aggregate(AggregateNode {
        collection: test_collection(),
        join: None,
        r#match: None,
        group: Some(GroupNode {
            keys: vec!["count_bool".into()],
            values: vec![
                GroupValue { alias: "cnt".into(), func: AggregateFunc::Count, key: None },
                GroupValue {
                    alias: "total".into(),
                    func: AggregateFunc::Sum,
                    key: Some("count".into()),
                },
                GroupValue {
                    alias: "average".into(),
                    func: AggregateFunc::Avg,
                    key: Some("count".into()),
                },
            ],
            computed: vec![],
            post_aggregates: vec![],
            having: None,
        }),
        sort: vec![SortKey { key: "count_bool".into(), ascending: true }],
        limit: Limit::unlimit(),
        columns: vec![],
    });
    let cursor = engine.execute(session, &query, &params()).await;
    assert!(cursor.is_success(), "group query failed: {cursor:?}");
    let chunk = cursor.chunk().unwrap();
    assert_eq!(chunk.size(), 2);

    // false: evens 2..=100 → count 50, sum 2550, avg 51
    assert_eq!(chunk.value(0, 0), Value::Boolean(false));
    assert_eq!(chunk.value(1, 0), Value::UInt64(50));
    assert_eq!(chunk.value(2, 0), Value::Int64(2550));
    assert_eq!(chunk.value(3, 0), Value::Double(51.0));
    // true: odds 1..=99 → count 50, sum 2500, avg 50
    assert_eq!(chunk.value(0, 1), Value::Boolean(true));
    assert_eq!(chunk.value(1, 1), Value::UInt64(50));
    assert_eq!(chunk.value(2, 1), Value::Int64(2500));
    assert_eq!(chunk.value(3, 1), Value::Double(50.0));
}

#[tokio::test]
async fn division_by_zero_yields_null_row() {
    otter_primitives::testonly::init_test_logger();
    let engine = Engine::open(EngineConfig::in_memory()).await.unwrap();
    let session = engine.create_session();

    engine
        .execute(session, &PlanNode::CreateDatabase { database: "db".into() }, &params())
        .await;
    engine
        .execute(
            session,
            &PlanNode::CreateCollection {
                collection: test_collection(),
                schema: vec![
                    ColumnSpec::new("a", LogicalType::Int32),
                    ColumnSpec::new("b", LogicalType::Int32),
                ],
                primary_key: vec![],
                storage_mode: StorageMode::InMemory,
            },
            &params(),
        )
        .await;
    engine
        .execute(
            session,
            &PlanNode::Insert {
                collection: test_collection(),
                payload: ChunkPayload {
                    columns: vec!["a".into(), "b".into()],
                    rows: vec![vec![Value::Int32(10), Value::Int32(0)]],
                },
            },
            &params(),
        )
        .await;

    let query = PlanNode::Aggregate(AggregateNode {
        columns: vec![SelectColumn {
            alias: "quotient".into(),
            expr: ScalarExpr::Arithmetic {
                op: ArithmeticOp::Divide,
                operands: vec![
                    ScalarExpr::Key(KeyPath::column("a")),
                    ScalarExpr::Key(KeyPath::column("b")),
                ],
            },
        }],
        ..AggregateNode::scan_all(test_collection())
    });
    let cursor = engine.execute(session, &query, &params()).await;
    assert!(cursor.is_success(), "division query failed: {cursor:?}");
    let chunk = cursor.chunk().unwrap();
    assert_eq!(chunk.size(), 1);
    assert!(chunk.value(0, 0).is_null());
}

#[tokio::test]
async fn wal_replay_restores_committed_rows() {
    otter_primitives::testonly::init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::on_disk(dir.path());

    {
        let engine = Engine::open(config.clone()).await.unwrap();
        let session = engine.create_session();
        engine
            .execute(session, &PlanNode::CreateDatabase { database: "db".into() }, &params())
            .await;
        let cursor = engine
            .execute(
                session,
                &PlanNode::CreateCollection {
                    collection: test_collection(),
                    schema: vec![ColumnSpec::new("value", LogicalType::Int64)],
                    primary_key: vec![],
                    storage_mode: StorageMode::Disk,
                },
                &params(),
            )
            .await;
        assert!(cursor.is_success());

        let cursor = engine.execute(session, &insert_values(0..7), &params()).await;
        assert!(cursor.is_success());
        // dropped without close(): no checkpoint, recovery must come from
        // the WAL
    }

    let engine = Engine::open(config).await.unwrap();
    let session = engine.create_session();
    assert_eq!(scan_count(&engine, session).await, 7);
}

#[tokio::test]
async fn uncommitted_transaction_does_not_survive_restart() {
    otter_primitives::testonly::init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::on_disk(dir.path());

    {
        let engine = Engine::open(config.clone()).await.unwrap();
        let session = engine.create_session();
        engine
            .execute(session, &PlanNode::CreateDatabase { database: "db".into() }, &params())
            .await;
        engine
            .execute(
                session,
                &PlanNode::CreateCollection {
                    collection: test_collection(),
                    schema: vec![ColumnSpec::new("value", LogicalType::Int64)],
                    primary_key: vec![],
                    storage_mode: StorageMode::Disk,
                },
                &params(),
            )
            .await;

        // committed rows
        engine.execute(session, &insert_values(0..3), &params()).await;

        // transactional rows without a COMMIT marker
        let txn_session = engine.create_session();
        engine.begin_transaction(txn_session);
        let cursor = engine.execute(txn_session, &insert_values(100..110), &params()).await;
        assert!(cursor.is_success());
        // no commit, engine dropped
    }

    let engine = Engine::open(config).await.unwrap();
    let session = engine.create_session();
    assert_eq!(scan_count(&engine, session).await, 3);
}

#[tokio::test]
async fn checkpoint_then_reopen_reads_blocks_not_wal() {
    otter_primitives::testonly::init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::on_disk(dir.path());

    {
        let engine = Engine::open(config.clone()).await.unwrap();
        let session = engine.create_session();
        engine
            .execute(session, &PlanNode::CreateDatabase { database: "db".into() }, &params())
            .await;
        engine
            .execute(
                session,
                &PlanNode::CreateCollection {
                    collection: test_collection(),
                    schema: vec![
                        ColumnSpec::new("value", LogicalType::Int64),
                        ColumnSpec::new("label", LogicalType::String),
                    ],
                    primary_key: vec![],
                    storage_mode: StorageMode::Disk,
                },
                &params(),
            )
            .await;
        let rows: Vec<Vec<Value>> = (0..2500)
            .map(|n: i64| vec![Value::Int64(n), Value::String(format!("row-{n}"))])
            .collect();
        engine
            .execute(
                session,
                &PlanNode::Insert {
                    collection: test_collection(),
                    payload: ChunkPayload {
                        columns: vec!["value".into(), "label".into()],
                        rows,
                    },
                },
                &params(),
            )
            .await;
        engine.close().await.unwrap();
    }

    let engine = Engine::open(config).await.unwrap();
    let session = engine.create_session();
    let cursor = engine.execute(session, &select_all(), &params()).await;
    assert!(cursor.is_success());
    assert_eq!(cursor.size(), 2500);
    let chunk = cursor.chunk().unwrap();
    assert_eq!(chunk.value(1, 0), Value::String("row-0".into()));
}

#[tokio::test]
async fn sort_then_limit_returns_smallest() {
    let engine = engine_with_test_table().await;
    let session = engine.create_session();
    engine.execute(session, &insert_values([5, 1, 9, 3, 7]), &params()).await;

    let query = PlanNode::Aggregate(AggregateNode {
        sort: vec![SortKey { key: "value".into(), ascending: true }],
        limit: Limit::new(2),
        ..AggregateNode::scan_all(test_collection())
    });
    let cursor = engine.execute(session, &query, &params()).await;
    let chunk = cursor.chunk().unwrap();
    assert_eq!(chunk.size(), 2);
    assert_eq!(chunk.value(0, 0), Value::Int64(1));
    assert_eq!(chunk.value(0, 1), Value::Int64(3));
}

#[tokio::test]
async fn validation_failure_leaves_transaction_healthy() {
    let engine = engine_with_test_table().await;
    let session = engine.create_session();
    engine.begin_transaction(session);

    let bad = PlanNode::Aggregate(AggregateNode::scan_all(CollectionName::new("db", "missing")));
    let cursor = engine.execute(session, &bad, &params()).await;
    assert!(cursor.is_error());

    // the transaction still works
    let cursor = engine.execute(session, &insert_values(0..2), &params()).await;
    assert!(cursor.is_success());
    engine.commit(session).unwrap();

    let fresh = engine.create_session();
    assert_eq!(scan_count(&engine, fresh).await, 2);
}
