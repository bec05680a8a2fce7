//! Otterbase: an embeddable columnar SQL engine with durable single-file
//! storage, row-group MVCC, a sharded write-ahead log and vectorized
//! execution.
//!
//! The external SQL frontend produces [`otter_plan::PlanNode`] trees; this
//! crate validates them against the catalog, lowers them to physical
//! operators and drives execution, returning tabular cursors.
//!
//! ```no_run
//! # async fn demo() -> Result<(), otterbase::EngineError> {
//! use otterbase::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig::on_disk("/var/lib/myapp")).await?;
//! let session = engine.create_session();
//! // ... engine.execute(session, &plan, &params).await ...
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod loader;

pub use config::{EngineConfig, StoreSettings, WalSettings};
pub use engine::{Engine, IndexDef};
pub use otter_exec::{Cursor, ErrorCode};
pub use otter_primitives::TransactionData;
pub use otter_store::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Catalog(#[from] otter_catalog::CatalogError),

    #[error(transparent)]
    Store(#[from] otter_store::StoreError),

    #[error(transparent)]
    Wal(#[from] otter_wal::WalError),

    #[error("{0} has no active transaction")]
    NoActiveTransaction(SessionId),
}
