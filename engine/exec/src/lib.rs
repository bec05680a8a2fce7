//! Vectorized execution: arithmetic kernels, expression evaluation, the
//! physical operator tree, logical-plan lowering and the async executor
//! that drives a plan end to end.

pub mod arithmetic;
pub mod cursor;
pub mod eval;
pub mod executor;
pub mod operators;
pub mod planner;

pub use arithmetic::{compute_binary, compute_scalar_vector, compute_unary_neg, compute_vector_scalar};
pub use cursor::{Cursor, ErrorCode};
pub use executor::{ExecutionContext, Executor, WriteEffect};
pub use operators::{OperatorKind, OperatorNode, PipelineContext};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("unknown column {0}")]
    UnknownColumn(String),

    #[error("type coercion failed: {0}")]
    Coercion(#[from] otter_primitives::TypeError),

    #[error("arithmetic is not defined for these operand types")]
    NonNumericArithmetic,

    #[error("parameter ${0} is not bound")]
    UnboundParameter(u16),

    #[error("invalid regular expression: {0}")]
    BadRegex(#[from] regex::Error),

    #[error(transparent)]
    Store(#[from] otter_store::StoreError),

    #[error(transparent)]
    Wal(#[from] otter_wal::WalError),

    #[error("column {column} is declared NOT NULL")]
    NullConstraint { column: String },

    #[error("operator tree is malformed: {0}")]
    MalformedPlan(&'static str),

    #[error("transaction aborted")]
    Aborted,
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;
