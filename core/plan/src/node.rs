use crate::expr::{CompareExpr, ScalarExpr, UpdateExpr};
use otter_primitives::{LogicalType, Value};
use std::collections::BTreeSet;

/// Fully qualified table name.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct CollectionName {
    pub database: String,
    pub collection: String,
}

impl CollectionName {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self { database: database.into(), collection: collection.into() }
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageMode {
    InMemory,
    Disk,
}

/// One column of a CREATE TABLE schema.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: LogicalType,
    pub not_null: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: LogicalType) -> Self {
        Self { name: name.into(), ty, not_null: false }
    }
}

/// Row payload of an INSERT, serializable value-wise. Conversion to a
/// `DataChunk` happens at the executor boundary.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ChunkPayload {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// LIMIT clause value. `unlimit()` means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Limit(pub Option<u64>);

impl Limit {
    pub fn unlimit() -> Self {
        Limit(None)
    }

    pub fn limit_one() -> Self {
        Limit(Some(1))
    }

    pub fn new(n: u64) -> Self {
        Limit(Some(n))
    }

    pub fn applies(&self) -> bool {
        self.0.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SortKey {
    pub key: String,
    pub ascending: bool,
}

/// One aggregated output of a GROUP BY: `SUM(amount) AS total`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupValue {
    pub alias: String,
    pub func: AggregateFunc,
    /// Input column; `None` for `COUNT(*)`.
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AggregateFunc {
    Count,
    Min,
    Max,
    Sum,
    Avg,
    /// Registered compute function, resolved by uid at validation time.
    Func(String),
}

/// Computed (pre-group) or post-aggregate arithmetic column.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SelectColumn {
    pub alias: String,
    pub expr: ScalarExpr,
}

/// GROUP BY node: keys, aggregates, computed columns evaluated before
/// grouping, post-aggregate arithmetic, and the HAVING predicate.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct GroupNode {
    pub keys: Vec<String>,
    pub values: Vec<GroupValue>,
    pub computed: Vec<SelectColumn>,
    pub post_aggregates: Vec<SelectColumn>,
    pub having: Option<CompareExpr>,
}

impl Default for AggregateFunc {
    fn default() -> Self {
        AggregateFunc::Count
    }
}

/// An inner join against a second table.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JoinSpec {
    pub collection: CollectionName,
    pub on: CompareExpr,
}

/// The SELECT tree: scan + optional join/match/group/sort/limit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AggregateNode {
    pub collection: CollectionName,
    pub join: Option<JoinSpec>,
    pub r#match: Option<CompareExpr>,
    pub group: Option<GroupNode>,
    pub sort: Vec<SortKey>,
    pub limit: Limit,
    /// Plain projection when no group node is present. Empty means all
    /// columns.
    pub columns: Vec<SelectColumn>,
}

impl AggregateNode {
    pub fn scan_all(collection: CollectionName) -> Self {
        Self {
            collection,
            join: None,
            r#match: None,
            group: None,
            sort: Vec::new(),
            limit: Limit::unlimit(),
            columns: Vec::new(),
        }
    }
}

/// The closed set of logical plan nodes the engine accepts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PlanNode {
    CreateDatabase {
        database: String,
    },
    DropDatabase {
        database: String,
    },
    CreateCollection {
        collection: CollectionName,
        schema: Vec<ColumnSpec>,
        primary_key: Vec<String>,
        storage_mode: StorageMode,
    },
    DropCollection {
        collection: CollectionName,
    },
    CreateIndex {
        collection: CollectionName,
        name: String,
        keys: Vec<String>,
    },
    DropIndex {
        collection: CollectionName,
        name: String,
    },
    CreateType {
        database: String,
        name: String,
        values: Vec<String>,
    },
    DropType {
        database: String,
        name: String,
    },
    Insert {
        collection: CollectionName,
        payload: ChunkPayload,
    },
    Update {
        collection: CollectionName,
        r#match: Option<CompareExpr>,
        updates: Vec<UpdateExpr>,
        limit: Limit,
    },
    Delete {
        collection: CollectionName,
        r#match: Option<CompareExpr>,
        limit: Limit,
    },
    Aggregate(AggregateNode),
}

impl PlanNode {
    /// The table this node addresses, when it addresses one.
    pub fn collection(&self) -> Option<&CollectionName> {
        match self {
            PlanNode::CreateCollection { collection, .. }
            | PlanNode::DropCollection { collection }
            | PlanNode::CreateIndex { collection, .. }
            | PlanNode::DropIndex { collection, .. }
            | PlanNode::Insert { collection, .. }
            | PlanNode::Update { collection, .. }
            | PlanNode::Delete { collection, .. } => Some(collection),
            PlanNode::Aggregate(node) => Some(&node.collection),
            _ => None,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            PlanNode::CreateDatabase { .. }
                | PlanNode::DropDatabase { .. }
                | PlanNode::CreateCollection { .. }
                | PlanNode::DropCollection { .. }
                | PlanNode::CreateIndex { .. }
                | PlanNode::DropIndex { .. }
                | PlanNode::CreateType { .. }
                | PlanNode::DropType { .. }
        )
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            PlanNode::Insert { .. } | PlanNode::Update { .. } | PlanNode::Delete { .. }
        )
    }

    /// Every positional parameter the node references. A plan is
    /// finalizable only when all of these are bound.
    pub fn referenced_parameters(&self) -> BTreeSet<u16> {
        let mut out = BTreeSet::new();
        match self {
            PlanNode::Update { r#match, updates, .. } => {
                if let Some(m) = r#match {
                    m.collect_parameters(&mut out);
                }
                for update in updates {
                    update.collect_parameters(&mut out);
                }
            }
            PlanNode::Delete { r#match, .. } => {
                if let Some(m) = r#match {
                    m.collect_parameters(&mut out);
                }
            }
            PlanNode::Aggregate(node) => {
                if let Some(m) = &node.r#match {
                    m.collect_parameters(&mut out);
                }
                if let Some(join) = &node.join {
                    join.on.collect_parameters(&mut out);
                }
                if let Some(group) = &node.group {
                    for column in group.computed.iter().chain(&group.post_aggregates) {
                        column.expr.collect_parameters(&mut out);
                    }
                    if let Some(having) = &group.having {
                        having.collect_parameters(&mut out);
                    }
                }
                for column in &node.columns {
                    column.expr.collect_parameters(&mut out);
                }
            }
            _ => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CompareOp, KeyPath, Operand};
    use crate::params::{ParameterBinding, ParameterId};
    use crate::{decode_node, encode_node};

    fn delete_by_count() -> PlanNode {
        PlanNode::Delete {
            collection: CollectionName::new("db", "test"),
            r#match: Some(CompareExpr::Compare {
                left: Operand::Key(KeyPath::column("count")),
                op: CompareOp::Eq,
                right: Operand::Parameter(ParameterId(1)),
            }),
            limit: Limit::unlimit(),
        }
    }

    #[test]
    fn node_round_trips_through_msgpack() {
        let node = delete_by_count();
        let bytes = encode_node(&node).unwrap();
        let decoded = decode_node(&bytes).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn insert_payload_round_trips() {
        let node = PlanNode::Insert {
            collection: CollectionName::new("db", "test"),
            payload: ChunkPayload {
                columns: vec!["value".into()],
                rows: vec![vec![Value::Int64(1)], vec![Value::Null]],
            },
        };
        let bytes = encode_node(&node).unwrap();
        assert_eq!(decode_node(&bytes).unwrap(), node);
    }

    #[test]
    fn referenced_parameters_walks_the_tree() {
        let node = delete_by_count();
        let referenced = node.referenced_parameters();
        assert_eq!(referenced, [1u16].into());

        let mut params = ParameterBinding::new();
        assert!(!params.all_bound(&referenced));
        params.bind(ParameterId(1), Value::Int64(3));
        assert!(params.all_bound(&referenced));
    }

    #[test]
    fn ddl_classification() {
        assert!(PlanNode::CreateDatabase { database: "db".into() }.is_ddl());
        assert!(delete_by_count().is_dml());
        assert!(!delete_by_count().is_ddl());
    }
}
