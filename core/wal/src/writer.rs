use crate::record::{WalFrame, WalRecord};
use crate::{shard_file_name, Result, WalId, WAL_CRC_SEED};
use otter_plan::{ParameterBinding, PlanNode};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Write-ahead log configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub directory: PathBuf,
    /// Number of shard files. More shards, more concurrent writers.
    pub shards: usize,
    /// fsync after every appended record. Turning this off trades
    /// durability of the last records for throughput.
    pub sync_on_write: bool,
}

impl WalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into(), shards: default_shards(), sync_on_write: true }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }
}

fn default_shards() -> usize {
    num_cpus::get().clamp(1, 8)
}

struct ShardState {
    file: File,
    last_crc32: u32,
}

/// Sharded WAL writer. A record goes to the shard selected by hashing the
/// target table name; ids are allocated from one global counter so that
/// recovery can merge the shards back into a single order.
pub struct WalWriter {
    config: WalConfig,
    shards: Vec<Mutex<ShardState>>,
    next_id: AtomicU64,
}

impl WalWriter {
    /// Open (or create) the shard files. `next_id` continues after the
    /// highest id found by a prior recovery scan.
    pub fn open(config: WalConfig, next_id: WalId) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        let mut shards = Vec::with_capacity(config.shards);
        for shard in 0..config.shards {
            let path = config.directory.join(shard_file_name(shard));
            let last_crc32 = last_chain_crc(&path)?;
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            shards.push(Mutex::new(ShardState { file, last_crc32 }));
        }
        tracing::debug!(
            target: "wal",
            shards = config.shards,
            next_id,
            "opened write-ahead log"
        );
        Ok(Self { config, shards, next_id: AtomicU64::new(next_id.max(1)) })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The most recently allocated record id; what a checkpoint records.
    pub fn last_id(&self) -> WalId {
        self.next_id.load(Ordering::Acquire).saturating_sub(1)
    }

    fn shard_for(&self, table: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        table.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn allocate_id(&self) -> WalId {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    fn append_record(&self, shard: usize, mut build: impl FnMut(u32, WalId) -> WalRecord) -> Result<WalId> {
        let id = self.allocate_id();
        let mut state = self.shards[shard].lock();
        let record = build(state.last_crc32, id);
        let payload = record.encode_payload()?;
        let crc = crc32c::crc32c(&payload);
        let frame = WalFrame::encode(&payload);
        state.file.write_all(&frame)?;
        if self.config.sync_on_write {
            state.file.sync_data()?;
        }
        state.last_crc32 = crc;
        Ok(id)
    }

    /// Append a DATA record for a plan against `table`. Returns the id the
    /// caller passes to the disk flush request.
    pub fn append(
        &self,
        table: &str,
        transaction_id: u64,
        node: &PlanNode,
        params: &ParameterBinding,
    ) -> Result<WalId> {
        let shard = self.shard_for(table);
        self.append_record(shard, |last_crc32, id| WalRecord::Data {
            last_crc32,
            id,
            transaction_id,
            node: node.clone(),
            params: params.clone(),
        })
    }

    /// Append the COMMIT marker that makes a transaction's DATA records
    /// eligible for replay.
    pub fn append_commit(&self, transaction_id: u64) -> Result<WalId> {
        let shard = (transaction_id % self.shards.len() as u64) as usize;
        self.append_record(shard, |last_crc32, id| WalRecord::Commit {
            last_crc32,
            id,
            transaction_id,
        })
    }

    /// fsync every shard file.
    pub fn flush(&self) -> Result<()> {
        for shard in &self.shards {
            shard.lock().file.sync_data()?;
        }
        Ok(())
    }
}

/// CRC of the last intact record in a shard file, the seed for the next
/// append's chain field.
fn last_chain_crc(path: &std::path::Path) -> Result<u32> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(WAL_CRC_SEED),
        Err(err) => return Err(err.into()),
    };
    let mut crc = WAL_CRC_SEED;
    let mut offset = 0;
    while let Some((payload, valid, next)) = WalFrame::decode(&bytes, offset) {
        if valid {
            crc = crc32c::crc32c(payload);
        }
        offset = next;
    }
    Ok(crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::{CollectionName, Limit};

    fn delete_node() -> PlanNode {
        PlanNode::Delete {
            collection: CollectionName::new("db", "t"),
            r#match: None,
            limit: Limit::unlimit(),
        }
    }

    #[test]
    fn ids_are_global_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            WalWriter::open(WalConfig::new(dir.path()).with_shards(4), 1).unwrap();
        let params = ParameterBinding::new();
        let mut ids = Vec::new();
        for table in ["a", "b", "c", "d", "e", "f"] {
            ids.push(writer.append(table, 0, &delete_node(), &params).unwrap());
        }
        let expected: Vec<WalId> = (1..=6).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn same_table_goes_to_same_shard() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            WalWriter::open(WalConfig::new(dir.path()).with_shards(4), 1).unwrap();
        let params = ParameterBinding::new();
        for _ in 0..5 {
            writer.append("accounts", 0, &delete_node(), &params).unwrap();
        }
        let populated = (0..4)
            .filter(|&i| {
                std::fs::metadata(dir.path().join(shard_file_name(i)))
                    .map(|m| m.len() > 0)
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(populated, 1);
    }

    #[test]
    fn reopen_continues_the_crc_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(dir.path()).with_shards(1);
        let params = ParameterBinding::new();

        let first_crc = {
            let writer = WalWriter::open(config.clone(), 1).unwrap();
            writer.append("t", 0, &delete_node(), &params).unwrap();
            let bytes = std::fs::read(dir.path().join(shard_file_name(0))).unwrap();
            let (payload, valid, _) = WalFrame::decode(&bytes, 0).unwrap();
            assert!(valid);
            crc32c::crc32c(payload)
        };

        let writer = WalWriter::open(config, 2).unwrap();
        writer.append("t", 0, &delete_node(), &params).unwrap();

        let bytes = std::fs::read(dir.path().join(shard_file_name(0))).unwrap();
        let (_, _, next) = WalFrame::decode(&bytes, 0).unwrap();
        let (payload, valid, _) = WalFrame::decode(&bytes, next).unwrap();
        assert!(valid);
        match WalRecord::decode_payload(payload).unwrap() {
            WalRecord::Data { last_crc32, id, .. } => {
                assert_eq!(last_crc32, first_crc);
                assert_eq!(id, 2);
            }
            other => panic!("expected data record, got {other:?}"),
        }
    }
}
