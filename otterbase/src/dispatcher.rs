//! Plan validation: every plan is checked against the catalog before it
//! reaches the executor. Validation failures become error cursors; the
//! transaction stays healthy and nothing is written to the WAL.

use otter_catalog::{Catalog, TableEntry};
use otter_exec::{Cursor, ErrorCode};
use otter_plan::{
    AggregateFunc, CompareExpr, Operand, PlanNode, ScalarExpr, UpdateExpr,
};

/// Outcome of validating one plan: the resolved catalog entries the engine
/// needs to execute it.
#[derive(Debug, Default)]
pub struct Resolved {
    pub table: Option<TableEntry>,
    pub join_table: Option<TableEntry>,
}

pub fn validate(catalog: &Catalog, node: &PlanNode) -> Result<Resolved, Cursor> {
    match node {
        PlanNode::CreateDatabase { database } => {
            if catalog.database_exists(database) {
                return Err(Cursor::error(
                    ErrorCode::DatabaseExists,
                    format!("database {database} already exists"),
                ));
            }
            Ok(Resolved::default())
        }
        PlanNode::DropDatabase { database } => {
            require_database(catalog, database)?;
            Ok(Resolved::default())
        }
        PlanNode::CreateCollection { collection, schema, primary_key, .. } => {
            require_database(catalog, &collection.database)?;
            if catalog.find_table(&collection.database, &collection.collection).is_some() {
                return Err(Cursor::error(
                    ErrorCode::CollectionExists,
                    format!("collection {collection} already exists"),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for column in schema {
                if !seen.insert(column.name.as_str()) {
                    return Err(Cursor::error(
                        ErrorCode::SchemaMismatch,
                        format!("duplicate column {} in schema", column.name),
                    ));
                }
            }
            for pk in primary_key {
                if !schema.iter().any(|column| &column.name == pk) {
                    return Err(Cursor::error(
                        ErrorCode::UnknownColumn,
                        format!("primary key column {pk} is not in the schema"),
                    ));
                }
            }
            Ok(Resolved::default())
        }
        PlanNode::DropCollection { collection }
        | PlanNode::CreateIndex { collection, .. }
        | PlanNode::DropIndex { collection, .. } => {
            let table = require_table(catalog, collection)?;
            Ok(Resolved { table: Some(table), join_table: None })
        }
        PlanNode::CreateType { database, .. } | PlanNode::DropType { database, .. } => {
            require_database(catalog, database)?;
            Ok(Resolved::default())
        }
        PlanNode::Insert { collection, payload } => {
            let table = require_table(catalog, collection)?;
            // a schema-less table adopts its schema from the first insert
            if table.columns.is_empty() {
                return Ok(Resolved { table: Some(table), join_table: None });
            }
            for name in &payload.columns {
                if !table.columns.iter().any(|column| &column.name == name) {
                    return Err(Cursor::error(
                        ErrorCode::SchemaMismatch,
                        format!("column {name} does not exist in {collection}"),
                    ));
                }
            }
            for row in &payload.rows {
                if row.len() != payload.columns.len() {
                    return Err(Cursor::error(
                        ErrorCode::SchemaMismatch,
                        format!(
                            "insert row has {} values for {} columns",
                            row.len(),
                            payload.columns.len()
                        ),
                    ));
                }
                for (value, name) in row.iter().zip(&payload.columns) {
                    let column = table
                        .columns
                        .iter()
                        .find(|column| &column.name == name)
                        .expect("checked above");
                    if !value.is_null() && value.cast(&column.ty).is_err() {
                        return Err(Cursor::error(
                            ErrorCode::TypeCoercion,
                            format!("value {value} is not coercible to {} {}", column.name, column.ty),
                        ));
                    }
                }
            }
            Ok(Resolved { table: Some(table), join_table: None })
        }
        PlanNode::Update { collection, r#match, updates, .. } => {
            let table = require_table(catalog, collection)?;
            if let Some(expr) = r#match {
                check_compare_keys(expr, &table, None)?;
            }
            for update in updates {
                check_update_keys(update, &table)?;
            }
            Ok(Resolved { table: Some(table), join_table: None })
        }
        PlanNode::Delete { collection, r#match, .. } => {
            let table = require_table(catalog, collection)?;
            if let Some(expr) = r#match {
                check_compare_keys(expr, &table, None)?;
            }
            Ok(Resolved { table: Some(table), join_table: None })
        }
        PlanNode::Aggregate(aggregate) => {
            // constants-only selects name no collection
            if aggregate.collection.collection.is_empty() {
                return Ok(Resolved::default());
            }
            let table = require_table(catalog, &aggregate.collection)?;
            let join_table = match &aggregate.join {
                Some(join) => {
                    let joined = require_table(catalog, &join.collection)?;
                    if joined.storage_mode != table.storage_mode {
                        return Err(Cursor::error(
                            ErrorCode::IncompatibleStorageTypes,
                            "cannot mix storage formats in one plan",
                        ));
                    }
                    Some(joined)
                }
                None => None,
            };

            if let Some(expr) = &aggregate.r#match {
                check_compare_keys(expr, &table, join_table.as_ref())?;
            }
            if let Some(group) = &aggregate.group {
                for value in &group.values {
                    resolve_function(&value.func)?;
                    if let Some(key) = &value.key {
                        // aggregate inputs may also be computed columns
                        let computed = group.computed.iter().any(|c| &c.alias == key);
                        if !computed {
                            check_key(key, &table, join_table.as_ref())?;
                        }
                    }
                }
                for key in &group.keys {
                    if key == "*" {
                        continue;
                    }
                    let computed = group.computed.iter().any(|c| &c.alias == key);
                    if !computed {
                        check_key(key, &table, join_table.as_ref())?;
                    }
                }
            }
            Ok(Resolved { table: Some(table), join_table })
        }
    }
}

fn require_database(catalog: &Catalog, database: &str) -> Result<(), Cursor> {
    if !catalog.database_exists(database) {
        return Err(Cursor::error(
            ErrorCode::UnknownDatabase,
            format!("database {database} does not exist"),
        ));
    }
    Ok(())
}

fn require_table(
    catalog: &Catalog,
    collection: &otter_plan::CollectionName,
) -> Result<TableEntry, Cursor> {
    require_database(catalog, &collection.database)?;
    catalog.find_table(&collection.database, &collection.collection).ok_or_else(|| {
        Cursor::error(
            ErrorCode::UnknownCollection,
            format!("collection {collection} does not exist"),
        )
    })
}

/// Resolve a top-level key against the plan's tables, detecting ambiguity
/// across a join.
fn check_key(key: &str, table: &TableEntry, join: Option<&TableEntry>) -> Result<(), Cursor> {
    let root = key.split('.').next().unwrap_or(key);
    let in_left = table.columns.iter().any(|column| column.name == root);
    let in_right =
        join.map(|t| t.columns.iter().any(|column| column.name == root)).unwrap_or(false);
    match (in_left, in_right) {
        (true, true) => Err(Cursor::error(
            ErrorCode::AmbiguousColumn,
            format!("column {root} exists in both joined tables"),
        )),
        (false, false) => Err(Cursor::error(
            ErrorCode::UnknownColumn,
            format!("column {root} does not exist"),
        )),
        _ => Ok(()),
    }
}

fn check_operand(
    operand: &Operand,
    table: &TableEntry,
    join: Option<&TableEntry>,
) -> Result<(), Cursor> {
    match operand {
        Operand::Key(key) => check_key(key.root(), table, join),
        Operand::Scalar(expr) => check_scalar_keys(expr, table, join),
        Operand::Parameter(_) | Operand::Literal(_) => Ok(()),
    }
}

fn check_compare_keys(
    expr: &CompareExpr,
    table: &TableEntry,
    join: Option<&TableEntry>,
) -> Result<(), Cursor> {
    match expr {
        CompareExpr::Compare { left, right, .. } => {
            check_operand(left, table, join)?;
            check_operand(right, table, join)
        }
        CompareExpr::And(children) | CompareExpr::Or(children) => {
            for child in children {
                check_compare_keys(child, table, join)?;
            }
            Ok(())
        }
        CompareExpr::Not(child) => check_compare_keys(child, table, join),
    }
}

fn check_scalar_keys(
    expr: &ScalarExpr,
    table: &TableEntry,
    join: Option<&TableEntry>,
) -> Result<(), Cursor> {
    match expr {
        ScalarExpr::Key(key) => check_key(key.root(), table, join),
        ScalarExpr::Arithmetic { operands, .. } => {
            for operand in operands {
                check_scalar_keys(operand, table, join)?;
            }
            Ok(())
        }
        ScalarExpr::CaseWhen { branches, otherwise } => {
            for (condition, then) in branches {
                check_compare_keys(condition, table, join)?;
                check_scalar_keys(then, table, join)?;
            }
            if let Some(otherwise) = otherwise {
                check_scalar_keys(otherwise, table, join)?;
            }
            Ok(())
        }
        ScalarExpr::Coalesce(children) => {
            for child in children {
                check_scalar_keys(child, table, join)?;
            }
            Ok(())
        }
        ScalarExpr::Parameter(_) | ScalarExpr::Literal(_) => Ok(()),
    }
}

fn check_update_keys(expr: &UpdateExpr, table: &TableEntry) -> Result<(), Cursor> {
    match expr {
        UpdateExpr::Set { column, value } => {
            check_key(column.root(), table, None)?;
            check_update_keys(value, table)
        }
        UpdateExpr::GetValue(key) => check_key(key.root(), table, None),
        UpdateExpr::Calculate { operands, .. } => {
            for operand in operands {
                check_update_keys(operand, table)?;
            }
            Ok(())
        }
        UpdateExpr::GetConstValue(_) | UpdateExpr::Literal(_) => Ok(()),
    }
}

/// Known aggregate functions; named ones resolve here or fail validation.
fn resolve_function(func: &AggregateFunc) -> Result<(), Cursor> {
    match func {
        AggregateFunc::Func(name) => match name.as_str() {
            "count" | "min" | "max" | "sum" | "avg" => Ok(()),
            other => Err(Cursor::error(
                ErrorCode::UnknownFunction,
                format!("unknown function {other}"),
            )),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_catalog::{ColumnEntry, TableStorageMode};
    use otter_plan::{AggregateNode, ChunkPayload, CollectionName, JoinSpec, KeyPath};
    use otter_primitives::{LogicalType, Value};

    fn catalog_with_table() -> Catalog {
        let catalog = Catalog::ephemeral();
        catalog.create_database("db").unwrap();
        catalog
            .create_table(
                "db",
                TableEntry {
                    name: "t".into(),
                    storage_mode: TableStorageMode::InMemory,
                    columns: vec![
                        ColumnEntry {
                            name: "id".into(),
                            ty: LogicalType::Int64,
                            not_null: false,
                            has_default: false,
                        },
                        ColumnEntry {
                            name: "name".into(),
                            ty: LogicalType::String,
                            not_null: false,
                            has_default: false,
                        },
                    ],
                    primary_key_columns: vec![],
                },
            )
            .unwrap();
        catalog
    }

    #[test]
    fn unknown_table_is_rejected() {
        let catalog = catalog_with_table();
        let node =
            PlanNode::Aggregate(AggregateNode::scan_all(CollectionName::new("db", "missing")));
        let err = validate(&catalog, &node).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::UnknownCollection));
    }

    #[test]
    fn insert_with_unknown_column_is_schema_mismatch() {
        let catalog = catalog_with_table();
        let node = PlanNode::Insert {
            collection: CollectionName::new("db", "t"),
            payload: ChunkPayload {
                columns: vec!["nope".into()],
                rows: vec![vec![Value::Int64(1)]],
            },
        };
        let err = validate(&catalog, &node).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::SchemaMismatch));
    }

    #[test]
    fn insert_with_bad_value_type_is_coercion_failure() {
        let catalog = catalog_with_table();
        let node = PlanNode::Insert {
            collection: CollectionName::new("db", "t"),
            payload: ChunkPayload {
                columns: vec!["id".into()],
                rows: vec![vec![Value::String("not a number".into())]],
            },
        };
        let err = validate(&catalog, &node).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::TypeCoercion));
    }

    #[test]
    fn ambiguous_join_column_is_detected() {
        let catalog = catalog_with_table();
        catalog
            .create_table(
                "db",
                TableEntry {
                    name: "u".into(),
                    storage_mode: TableStorageMode::InMemory,
                    columns: vec![ColumnEntry {
                        name: "id".into(),
                        ty: LogicalType::Int64,
                        not_null: false,
                        has_default: false,
                    }],
                    primary_key_columns: vec![],
                },
            )
            .unwrap();

        let mut aggregate = AggregateNode::scan_all(CollectionName::new("db", "t"));
        aggregate.join = Some(JoinSpec {
            collection: CollectionName::new("db", "u"),
            on: CompareExpr::all_true(),
        });
        aggregate.r#match = Some(CompareExpr::Compare {
            left: Operand::Key(KeyPath::column("id")),
            op: otter_plan::CompareOp::Eq,
            right: Operand::Literal(Value::Int64(1)),
        });
        let err = validate(&catalog, &PlanNode::Aggregate(aggregate)).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::AmbiguousColumn));
    }

    #[test]
    fn unknown_function_is_rejected() {
        let catalog = catalog_with_table();
        let mut aggregate = AggregateNode::scan_all(CollectionName::new("db", "t"));
        aggregate.group = Some(otter_plan::GroupNode {
            keys: vec![],
            values: vec![otter_plan::GroupValue {
                alias: "x".into(),
                func: AggregateFunc::Func("median".into()),
                key: Some("id".into()),
            }],
            ..Default::default()
        });
        let err = validate(&catalog, &PlanNode::Aggregate(aggregate)).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::UnknownFunction));
    }
}
