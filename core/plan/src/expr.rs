use crate::params::ParameterId;
use otter_primitives::Value;

/// Path to a column, possibly into nested struct fields:
/// `["address", "city"]` for `address.city`. A single `"*"` part is the
/// wildcard used by `COUNT(*)`-style keys.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, PartialOrd, Ord,
)]
pub struct KeyPath {
    pub parts: Vec<String>,
}

impl KeyPath {
    pub fn new(parts: Vec<String>) -> Self {
        Self { parts }
    }

    pub fn column(name: impl Into<String>) -> Self {
        Self { parts: vec![name.into()] }
    }

    pub fn wildcard() -> Self {
        Self::column("*")
    }

    pub fn is_wildcard(&self) -> bool {
        self.parts.len() == 1 && self.parts[0] == "*"
    }

    /// The top-level column name.
    pub fn root(&self) -> &str {
        &self.parts[0]
    }

    pub fn is_nested(&self) -> bool {
        self.parts.len() > 1
    }
}

impl std::fmt::Display for KeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.parts.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    IsNotNull,
    Regex,
    /// Matches every row; the degenerate predicate of an unfiltered scan.
    AllTrue,
}

/// One side of a comparison: a column reference, a positional parameter, or
/// a scalar sub-expression evaluated per row.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Operand {
    Key(KeyPath),
    Parameter(ParameterId),
    Literal(Value),
    Scalar(Box<ScalarExpr>),
}

/// Predicate tree of a `match` node. Leaves compare two operands; inner
/// nodes combine children.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CompareExpr {
    Compare { left: Operand, op: CompareOp, right: Operand },
    And(Vec<CompareExpr>),
    Or(Vec<CompareExpr>),
    Not(Box<CompareExpr>),
}

impl CompareExpr {
    pub fn eq(left: Operand, right: Operand) -> Self {
        CompareExpr::Compare { left, op: CompareOp::Eq, right }
    }

    pub fn all_true() -> Self {
        CompareExpr::Compare {
            left: Operand::Literal(Value::Boolean(true)),
            op: CompareOp::AllTrue,
            right: Operand::Literal(Value::Boolean(true)),
        }
    }

    pub(crate) fn collect_parameters(&self, out: &mut std::collections::BTreeSet<u16>) {
        match self {
            CompareExpr::Compare { left, right, .. } => {
                left.collect_parameters(out);
                right.collect_parameters(out);
            }
            CompareExpr::And(children) | CompareExpr::Or(children) => {
                for child in children {
                    child.collect_parameters(out);
                }
            }
            CompareExpr::Not(child) => child.collect_parameters(out),
        }
    }
}

impl Operand {
    pub(crate) fn collect_parameters(&self, out: &mut std::collections::BTreeSet<u16>) {
        match self {
            Operand::Parameter(id) => {
                out.insert(id.0);
            }
            Operand::Scalar(expr) => expr.collect_parameters(out),
            Operand::Key(_) | Operand::Literal(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,
}

/// A scalar expression evaluated against a chunk: arithmetic over columns,
/// parameters and literals, CASE-WHEN chains, COALESCE.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ScalarExpr {
    Key(KeyPath),
    Parameter(ParameterId),
    Literal(Value),
    Arithmetic { op: ArithmeticOp, operands: Vec<ScalarExpr> },
    CaseWhen { branches: Vec<(CompareExpr, ScalarExpr)>, otherwise: Option<Box<ScalarExpr>> },
    Coalesce(Vec<ScalarExpr>),
}

impl ScalarExpr {
    pub(crate) fn collect_parameters(&self, out: &mut std::collections::BTreeSet<u16>) {
        match self {
            ScalarExpr::Parameter(id) => {
                out.insert(id.0);
            }
            ScalarExpr::Arithmetic { operands, .. } => {
                for operand in operands {
                    operand.collect_parameters(out);
                }
            }
            ScalarExpr::CaseWhen { branches, otherwise } => {
                for (condition, then) in branches {
                    condition.collect_parameters(out);
                    then.collect_parameters(out);
                }
                if let Some(otherwise) = otherwise {
                    otherwise.collect_parameters(out);
                }
            }
            ScalarExpr::Coalesce(children) => {
                for child in children {
                    child.collect_parameters(out);
                }
            }
            ScalarExpr::Key(_) | ScalarExpr::Literal(_) => {}
        }
    }
}

/// Tree of an `UPDATE ... SET` assignment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum UpdateExpr {
    /// Assign the evaluated child to `column`.
    Set { column: KeyPath, value: Box<UpdateExpr> },
    /// A bound parameter.
    GetConstValue(ParameterId),
    /// The row's current value of a column.
    GetValue(KeyPath),
    /// Arithmetic over child expressions.
    Calculate { op: ArithmeticOp, operands: Vec<UpdateExpr> },
    Literal(Value),
}

impl UpdateExpr {
    pub(crate) fn collect_parameters(&self, out: &mut std::collections::BTreeSet<u16>) {
        match self {
            UpdateExpr::Set { value, .. } => value.collect_parameters(out),
            UpdateExpr::GetConstValue(id) => {
                out.insert(id.0);
            }
            UpdateExpr::Calculate { operands, .. } => {
                for operand in operands {
                    operand.collect_parameters(out);
                }
            }
            UpdateExpr::GetValue(_) | UpdateExpr::Literal(_) => {}
        }
    }
}
