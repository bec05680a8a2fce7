//! Write-ahead log: framed, CRC-checked, sharded append-only files.
//!
//! Every record is a frame `[size: u32 BE][payload][crc32c: u32 BE]` whose
//! payload is a msgpack array. DATA records carry `(last_crc32, id, txn_id,
//! node, params)`; COMMIT markers carry `(last_crc32, id, txn_id)`.
//! `last_crc32` chains each record to its predecessor's checksum within a
//! shard. Record ids are allocated atomically across all shards, which is
//! what recovery sorts by after merging the shard files.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{recover, WalRecovery, WalReplayRecord};
pub use record::{WalFrame, WalRecord};
pub use writer::{WalConfig, WalWriter};

/// Monotonic id of one WAL record, global across shards.
pub type WalId = u64;

/// CRC chain seed of the first record in a shard.
pub const WAL_CRC_SEED: u32 = 0;

/// Shard file name: `.wal_0`, `.wal_1`, ...
pub fn shard_file_name(shard: usize) -> String {
    format!(".wal_{shard}")
}

/// Name of the legacy unsharded WAL file, read when no shard files exist.
pub const LEGACY_WAL_FILE: &str = ".wal";

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Plan(#[from] otter_plan::PlanError),

    #[error("wal record payload is malformed")]
    MalformedPayload,

    #[error("duplicate wal record id {0} across shards")]
    DuplicateRecordId(WalId),
}

pub type Result<T, E = WalError> = std::result::Result<T, E>;
