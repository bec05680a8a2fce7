use crate::record::{WalFrame, WalRecord};
use crate::{shard_file_name, Result, WalError, WalId, LEGACY_WAL_FILE};
use otter_plan::{ParameterBinding, PlanNode};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One replayable DATA record.
#[derive(Debug, Clone)]
pub struct WalReplayRecord {
    pub id: WalId,
    pub transaction_id: u64,
    pub node: PlanNode,
    pub params: ParameterBinding,
}

/// Outcome of scanning the WAL directory.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// Committed (or legacy) DATA records newer than the checkpoint, in id
    /// order. Replay applies them front to back.
    pub records: Vec<WalReplayRecord>,
    /// Highest record id seen anywhere, committed or not. The writer
    /// resumes after this.
    pub max_id: WalId,
    /// Frames dropped for CRC mismatch.
    pub corrupt_frames: usize,
    /// DATA records skipped because their transaction never committed.
    pub uncommitted_skipped: usize,
}

/// Scan every WAL shard under `directory` and assemble the replay set:
/// records with `id > last_checkpointed_id` whose transaction committed
/// (`txn_id == 0` counts as committed, the legacy non-transactional form).
///
/// Frames that fail their CRC are logged and skipped. Two DATA records with
/// the same id in different shards mean the log is corrupt: the writer
/// allocates ids from one counter, so this cannot happen in a healthy log.
pub fn recover(directory: &Path, shards: usize, last_checkpointed_id: WalId) -> Result<WalRecovery> {
    let mut recovery = WalRecovery::default();
    let mut data_records: HashMap<WalId, WalReplayRecord> = HashMap::new();
    let mut committed: HashSet<u64> = HashSet::new();

    let mut shard_paths: Vec<std::path::PathBuf> = (0..shards)
        .map(|shard| directory.join(shard_file_name(shard)))
        .filter(|path| path.exists())
        .collect();
    if shard_paths.is_empty() {
        let legacy = directory.join(LEGACY_WAL_FILE);
        if legacy.exists() {
            tracing::debug!(target: "wal", "no shard files, reading legacy wal file");
            shard_paths.push(legacy);
        }
    }

    for path in &shard_paths {
        let bytes = std::fs::read(path)?;
        let mut offset = 0;
        while let Some((payload, valid, next)) = WalFrame::decode(&bytes, offset) {
            if !valid {
                tracing::warn!(
                    target: "wal",
                    path = %path.display(),
                    offset,
                    "skipping wal frame with checksum mismatch"
                );
                recovery.corrupt_frames += 1;
                offset = next;
                continue;
            }
            match WalRecord::decode_payload(payload) {
                Ok(WalRecord::Commit { id, transaction_id, .. }) => {
                    recovery.max_id = recovery.max_id.max(id);
                    if transaction_id != 0 {
                        committed.insert(transaction_id);
                    }
                }
                Ok(WalRecord::Data { id, transaction_id, node, params, .. }) => {
                    recovery.max_id = recovery.max_id.max(id);
                    if id > last_checkpointed_id {
                        let record = WalReplayRecord { id, transaction_id, node, params };
                        if data_records.insert(id, record).is_some() {
                            return Err(WalError::DuplicateRecordId(id));
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "wal",
                        path = %path.display(),
                        offset,
                        %err,
                        "skipping undecodable wal frame"
                    );
                    recovery.corrupt_frames += 1;
                }
            }
            offset = next;
        }
    }

    let mut records: Vec<WalReplayRecord> = data_records
        .into_values()
        .filter(|record| {
            let keep =
                record.transaction_id == 0 || committed.contains(&record.transaction_id);
            if !keep {
                recovery.uncommitted_skipped += 1;
            }
            keep
        })
        .collect();
    records.sort_by_key(|record| record.id);

    tracing::debug!(
        target: "wal",
        replay = records.len(),
        max_id = recovery.max_id,
        corrupt = recovery.corrupt_frames,
        skipped_uncommitted = recovery.uncommitted_skipped,
        "wal recovery scan complete"
    );
    recovery.records = records;
    Ok(recovery)
}
