//! Logical plan nodes, expression trees and parameter binding.
//!
//! This is the boundary the external SQL frontend produces plans across: a
//! closed, serializable node hierarchy. The same serialized form is what the
//! write-ahead log records for DML, so every type here round-trips through
//! msgpack.

pub mod expr;
pub mod node;
pub mod params;

pub use expr::{
    ArithmeticOp, CompareExpr, CompareOp, KeyPath, Operand, ScalarExpr, UpdateExpr,
};
pub use node::{
    AggregateFunc, AggregateNode, ChunkPayload, CollectionName, ColumnSpec, GroupNode, GroupValue,
    JoinSpec, Limit, PlanNode, SelectColumn, SortKey, StorageMode,
};
pub use params::{ParameterBinding, ParameterId};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan serialization failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("plan deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("parameter ${0} is not bound")]
    UnboundParameter(u16),
}

/// Encode a plan node to the msgpack blob stored in WAL records.
pub fn encode_node(node: &PlanNode) -> Result<Vec<u8>, PlanError> {
    Ok(rmp_serde::to_vec(node)?)
}

pub fn decode_node(bytes: &[u8]) -> Result<PlanNode, PlanError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

pub fn encode_params(params: &ParameterBinding) -> Result<Vec<u8>, PlanError> {
    Ok(rmp_serde::to_vec(params)?)
}

pub fn decode_params(bytes: &[u8]) -> Result<ParameterBinding, PlanError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
