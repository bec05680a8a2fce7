use otter_primitives::{DataChunk, Value};

/// Error classes a cursor can carry, mirroring the validation / runtime /
/// concurrency / durability / corruption taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownDatabase,
    UnknownCollection,
    CollectionExists,
    DatabaseExists,
    UnknownColumn,
    AmbiguousColumn,
    SchemaMismatch,
    TypeCoercion,
    UnknownFunction,
    IncompatibleStorageTypes,
    InvalidPlan,
    UnboundParameter,
    ConstraintViolation,
    TransactionConflict,
    DurabilityFailure,
    Corruption,
    IndexCreateFail,
    Aborted,
    Timeout,
    Internal,
}

/// Result of one executed plan: rows, an affected-row count for DML, plain
/// success for DDL, or an error. Errors are values; nothing unwinds across
/// the executor's awaits.
#[derive(Debug)]
pub enum Cursor {
    Rows(DataChunk),
    Affected(u64),
    Success,
    Error { code: ErrorCode, message: String },
}

impl Cursor {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Cursor::Error { code, message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Cursor::Error { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Cursor::Error { .. })
    }

    /// Row count of a rows cursor, affected count of a DML cursor.
    pub fn size(&self) -> u64 {
        match self {
            Cursor::Rows(chunk) => chunk.size() as u64,
            Cursor::Affected(count) => *count,
            Cursor::Success | Cursor::Error { .. } => 0,
        }
    }

    pub fn chunk(&self) -> Option<&DataChunk> {
        match self {
            Cursor::Rows(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn value(&self, column: usize, row: usize) -> Option<Value> {
        self.chunk().map(|chunk| chunk.value(column, row))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Cursor::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}
