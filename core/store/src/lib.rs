//! Columnar storage layer of the otterbase engine.
//!
//! The stack, leaves first: a fixed-size block manager over a single
//! database file (with an in-memory twin for tests and `IN_MEMORY` tables),
//! chained metadata streams carved out of blocks, per-column segments with
//! min/max/null statistics, 2048-row row groups carrying per-row MVCC
//! version vectors, the row-group tree of a collection, and the named,
//! schema-carrying data table on top. The transaction manager that hands out
//! transaction and commit ids lives here as well, next to the version
//! vectors it feeds.

pub mod block_manager;
pub mod buffer_pool;
pub mod collection;
pub mod column_data;
pub mod data_pointer;
pub mod data_table;
pub mod metadata;
pub mod partial_block;
pub mod row_group;
pub mod statistics;
pub mod txn;

pub use block_manager::{
    BlockManager, DatabaseHeader, InMemoryBlockManager, SingleFileBlockManager, BLOCK_START,
    CHECKSUM_SIZE, DEFAULT_BLOCK_ALLOC_SIZE, SECTOR_SIZE,
};
pub use buffer_pool::BufferPool;
pub use collection::{Collection, CollectionScanState, ScanType};
pub use column_data::ColumnData;
pub use data_pointer::{BlockPointer, DataPointer, RowGroupPointer};
pub use data_table::{ColumnDefinition, DataTable, ParallelScanState, TableAppendState};
pub use metadata::{MetaBlockPointer, MetadataManager, MetadataReader, MetadataWriter};
pub use partial_block::PartialBlockManager;
pub use row_group::{RowGroup, RowVersionManager};
pub use statistics::BaseStatistics;
pub use txn::{SessionId, TransactionManager};

/// Errors of the storage layer. I/O and corruption errors are fatal to the
/// operation that hit them; the callers decide whether the engine survives.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid database file: bad magic or unsupported version")]
    InvalidHeader,

    #[error("block {block_id} checksum mismatch")]
    ChecksumMismatch { block_id: u64 },

    #[error("block {block_id} is out of range (file has {total} blocks)")]
    BlockOutOfRange { block_id: u64, total: u64 },

    #[error("metadata stream exhausted while reading")]
    MetadataExhausted,

    #[error("row id {row_id} does not fall in any row group")]
    RowNotFound { row_id: i64 },

    #[error("transaction conflict: cannot modify a table that has been altered")]
    TableAltered,

    #[error("column {0} cannot be checkpointed: nested types are memory-only")]
    UnsupportedColumnType(String),

    #[error("segment of {size} bytes exceeds the block payload of {max} bytes")]
    SegmentTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Type(#[from] otter_primitives::TypeError),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
