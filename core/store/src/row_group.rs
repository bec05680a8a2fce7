use crate::block_manager::{BlockManager, CHECKSUM_SIZE};
use crate::buffer_pool::BufferPool;
use crate::column_data::ColumnData;
use crate::data_pointer::{DataPointer, RowGroupPointer};
use crate::partial_block::PartialBlockManager;
use crate::{Result, StoreError};
use byteorder::{ByteOrder, LittleEndian};
use otter_primitives::{
    DataChunk, LogicalType, TransactionData, Value, Vector, MAX_ROW_ID, NEVER_INSERTED,
    NOT_DELETED,
};

/// Per-row MVCC state of one row group.
///
/// `inserted_at[i]` is 0 for rows that are visible to everyone (legacy and
/// replayed writes), a commit id for committed rows, a transaction id
/// (`>= MAX_ROW_ID`) for tentative rows, or [`NEVER_INSERTED`] for reverted
/// appends. `deleted_at[i]` is [`NOT_DELETED`], a tentative transaction id,
/// or the commit id of the deleting transaction.
#[derive(Debug, Clone, Default)]
pub struct RowVersionManager {
    inserted_at: Vec<u64>,
    deleted_at: Vec<u64>,
}

impl RowVersionManager {
    pub fn len(&self) -> usize {
        self.inserted_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted_at.is_empty()
    }

    pub fn append_rows(&mut self, transaction_id: u64, count: usize) {
        self.inserted_at.extend(std::iter::repeat(transaction_id).take(count));
        self.deleted_at.extend(std::iter::repeat(NOT_DELETED).take(count));
    }

    /// Swap tentative insert markers in `[offset, offset + count)` for the
    /// commit id, making the rows visible to later transactions.
    pub fn commit_append(&mut self, commit_id: u64, offset: usize, count: usize) {
        for slot in &mut self.inserted_at[offset..offset + count] {
            if *slot >= MAX_ROW_ID && *slot != NEVER_INSERTED {
                *slot = commit_id;
            }
        }
    }

    /// Mark an aborted append. The rows stay physically present until
    /// compaction but are invisible to every transaction.
    pub fn revert_append(&mut self, offset: usize, count: usize) {
        for slot in &mut self.inserted_at[offset..offset + count] {
            *slot = NEVER_INSERTED;
        }
    }

    fn insert_visible(&self, row: usize, txn: TransactionData) -> bool {
        let inserted = self.inserted_at[row];
        inserted == 0 || inserted <= txn.start_time || inserted == txn.transaction_id
    }

    fn delete_visible(&self, row: usize, txn: TransactionData) -> bool {
        let deleted = self.deleted_at[row];
        deleted == NOT_DELETED || (deleted > txn.start_time && deleted != txn.transaction_id)
    }

    /// A row is visible when its insert committed before the transaction's
    /// start (or was its own), and no delete did the same.
    pub fn is_visible(&self, row: usize, txn: TransactionData) -> bool {
        self.insert_visible(row, txn) && self.delete_visible(row, txn)
    }

    /// Tentatively delete a row. Returns false when the row already carries
    /// a delete marker: the delete bitmap is monotone, first writer wins.
    /// A zero transaction id deletes immediately for every transaction.
    pub fn delete_row(&mut self, transaction_id: u64, row: usize) -> bool {
        if self.deleted_at[row] != NOT_DELETED {
            return false;
        }
        self.deleted_at[row] = transaction_id;
        true
    }

    /// Rewrite every tentative delete of `transaction_id` to `commit_id`.
    /// Returns the number of rows committed.
    pub fn commit_deletes(&mut self, transaction_id: u64, commit_id: u64) -> u64 {
        let mut committed = 0;
        for slot in &mut self.deleted_at {
            if *slot == transaction_id {
                *slot = commit_id;
                committed += 1;
            }
        }
        committed
    }

    /// Drop the tentative deletes of an aborted transaction.
    pub fn revert_deletes(&mut self, transaction_id: u64) {
        for slot in &mut self.deleted_at {
            if *slot == transaction_id {
                *slot = NOT_DELETED;
            }
        }
    }

    /// Rewrite version entries older than every active transaction to small
    /// constants, capping versioning overhead.
    pub fn cleanup(&mut self, lowest_active_start_time: u64) {
        for slot in &mut self.inserted_at {
            if *slot != 0 && *slot < MAX_ROW_ID && *slot <= lowest_active_start_time {
                *slot = 0;
            }
        }
        for slot in &mut self.deleted_at {
            if *slot != NOT_DELETED && *slot < MAX_ROW_ID && *slot <= lowest_active_start_time {
                // zero is "deleted for everyone", matching immediate deletes
                *slot = 0;
            }
        }
    }

    /// Rows whose delete has committed; they are gone for every future
    /// transaction and eligible for physical removal at compaction.
    pub fn committed_delete_count(&self) -> u64 {
        self.deleted_at.iter().filter(|&&d| d < MAX_ROW_ID).count() as u64
    }

    /// Rows left behind by reverted appends, also reclaimed at compaction.
    pub fn never_inserted_count(&self) -> u64 {
        self.inserted_at.iter().filter(|&&i| i == NEVER_INSERTED).count() as u64
    }

    pub fn committed_delete_offsets(&self) -> Vec<u32> {
        self.deleted_at
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d < MAX_ROW_ID)
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn restore_committed_delete(&mut self, row: usize) {
        self.deleted_at[row] = 0;
    }
}

/// A fixed-capacity horizontal slice of one table: one column chain per
/// column, plus the version vectors that implement row-group-local MVCC.
/// Identified by its absolute start row.
#[derive(Debug, Clone)]
pub struct RowGroup {
    start: i64,
    count: u64,
    columns: Vec<ColumnData>,
    version: RowVersionManager,
}

impl RowGroup {
    pub fn new(start: i64, types: &[LogicalType]) -> Self {
        Self {
            start,
            count: 0,
            columns: types.iter().map(|ty| ColumnData::new(ty.clone())).collect(),
            version: RowVersionManager::default(),
        }
    }

    /// Reconstruct a row group from its on-disk pointer. Column data loads
    /// lazily; the delete list is applied immediately.
    pub fn from_pointer(
        types: &[LogicalType],
        pointer: &RowGroupPointer,
        block_manager: &dyn BlockManager,
        buffer_pool: &BufferPool,
    ) -> Result<Self> {
        let columns = types
            .iter()
            .zip(&pointer.data_pointers)
            .map(|(ty, pointers)| ColumnData::from_pointers(ty.clone(), pointers.clone()))
            .collect();

        let mut version = RowVersionManager::default();
        version.append_rows(0, pointer.tuple_count as usize);
        for delete_pointer in &pointer.delete_pointers {
            for offset in decode_delete_list(delete_pointer, block_manager, buffer_pool)? {
                version.restore_committed_delete(offset as usize);
            }
        }

        Ok(Self {
            start: pointer.row_start as i64,
            count: pointer.tuple_count,
            columns,
            version,
        })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn columns(&self) -> &[ColumnData] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &ColumnData {
        &self.columns[idx]
    }

    pub fn version(&self) -> &RowVersionManager {
        &self.version
    }

    pub fn version_mut(&mut self) -> &mut RowVersionManager {
        &mut self.version
    }

    /// Free capacity before the 2048-row boundary.
    pub fn remaining_capacity(&self, row_group_size: u64) -> u64 {
        row_group_size.saturating_sub(self.count)
    }

    pub fn ensure_loaded(
        &mut self,
        block_manager: &dyn BlockManager,
        buffer_pool: &BufferPool,
    ) -> Result<()> {
        for column in &mut self.columns {
            column.ensure_loaded(block_manager, buffer_pool)?;
        }
        Ok(())
    }

    /// Append `count` rows of `chunk` starting at `chunk_offset`, tagged
    /// with `transaction_id` (0 for immediately-visible writes).
    pub fn append(
        &mut self,
        chunk: &DataChunk,
        chunk_offset: usize,
        count: usize,
        transaction_id: u64,
    ) -> Result<()> {
        debug_assert_eq!(chunk.column_count(), self.columns.len());
        for (idx, column) in self.columns.iter_mut().enumerate() {
            column.append(chunk.column(idx), chunk_offset, count)?;
        }
        self.version.append_rows(transaction_id, count);
        self.count += count as u64;
        Ok(())
    }

    /// Select the rows of this group visible to `txn`, as in-group offsets.
    pub fn visible_rows(&self, txn: TransactionData) -> Vec<usize> {
        (0..self.count as usize).filter(|&row| self.version.is_visible(row, txn)).collect()
    }

    /// Rows for checkpoint-style scans: committed inserts only, optionally
    /// including rows whose delete has committed.
    pub fn committed_rows(&self, include_deleted: bool) -> Vec<usize> {
        (0..self.count as usize)
            .filter(|&row| {
                let inserted = self.version.inserted_at[row];
                if inserted >= MAX_ROW_ID {
                    return false;
                }
                include_deleted || self.version.deleted_at[row] >= MAX_ROW_ID
            })
            .collect()
    }

    /// Materialize the requested columns for the given in-group offsets.
    pub fn scan_rows(
        &self,
        column_ids: &[usize],
        rows: &[usize],
    ) -> Result<Vec<Vector>> {
        let mut out = Vec::with_capacity(column_ids.len());
        for &column_id in column_ids {
            let column = &self.columns[column_id];
            let mut vector = Vector::empty(column.ty().clone());
            for &row in rows {
                vector.push_value(&column.fetch_value(row))?;
            }
            out.push(vector);
        }
        Ok(out)
    }

    /// In-place update of the latest version of one row.
    pub fn update_row(
        &mut self,
        row: usize,
        column_ids: &[usize],
        values: &[Value],
    ) -> Result<()> {
        debug_assert_eq!(column_ids.len(), values.len());
        for (&column_id, value) in column_ids.iter().zip(values) {
            self.columns[column_id].set_value(row, value)?;
        }
        Ok(())
    }

    /// Append a column with `default` payload to every existing row.
    pub fn add_column(&mut self, ty: LogicalType, default: &Value) -> Result<()> {
        let mut column = ColumnData::new(ty.clone());
        let mut filler = Vector::with_len(ty, self.count as usize);
        for row in 0..self.count as usize {
            filler.set_value(row, default)?;
        }
        column.append(&filler, 0, self.count as usize)?;
        self.columns.push(column);
        Ok(())
    }

    pub fn remove_column(&mut self, column_id: usize) {
        self.columns.remove(column_id);
    }

    /// Serialize every column and the committed delete list into fresh
    /// blocks, returning the pointer that reconstructs this group.
    pub fn checkpoint(&mut self, partial: &mut PartialBlockManager) -> Result<RowGroupPointer> {
        let mut data_pointers = Vec::with_capacity(self.columns.len());
        for column in &mut self.columns {
            data_pointers.push(column.checkpoint(partial, self.start as u64)?);
        }

        let deletes = self.version.committed_delete_offsets();
        let mut delete_pointers = Vec::new();
        if !deletes.is_empty() {
            let mut bytes = Vec::with_capacity(4 + deletes.len() * 4);
            bytes.extend_from_slice(&(deletes.len() as u32).to_le_bytes());
            for offset in &deletes {
                bytes.extend_from_slice(&offset.to_le_bytes());
            }
            let block_pointer = partial.append(&bytes)?;
            delete_pointers.push(DataPointer {
                row_start: self.start as u64,
                tuple_count: deletes.len() as u64,
                block_pointer,
                compression: 0,
                segment_size: bytes.len() as u64,
            });
        }

        Ok(RowGroupPointer {
            row_start: self.start as u64,
            tuple_count: self.count,
            data_pointers,
            delete_pointers,
        })
    }
}

fn decode_delete_list(
    pointer: &DataPointer,
    block_manager: &dyn BlockManager,
    buffer_pool: &BufferPool,
) -> Result<Vec<u32>> {
    let block = buffer_pool.read(block_manager, pointer.block_pointer.block_id)?;
    let start = CHECKSUM_SIZE + pointer.block_pointer.offset as usize;
    let bytes = &block[start..start + pointer.segment_size as usize];
    if bytes.len() < 4 {
        return Err(StoreError::MetadataExhausted);
    }
    let count = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(LittleEndian::read_u32(&bytes[4 + i * 4..8 + i * 4]));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_primitives::DataChunk;

    fn chunk_of(values: &[i64]) -> DataChunk {
        let mut chunk = DataChunk::new(&[LogicalType::Int64]);
        for &v in values {
            chunk.push_row(&[Value::Int64(v)]).unwrap();
        }
        chunk
    }

    const TXN: u64 = MAX_ROW_ID + 10;

    #[test]
    fn tentative_rows_visible_only_to_owner() {
        let mut rg = RowGroup::new(0, &[LogicalType::Int64]);
        rg.append(&chunk_of(&[1, 2, 3]), 0, 3, TXN).unwrap();

        let owner = TransactionData::new(TXN, 5);
        let other = TransactionData::new(MAX_ROW_ID + 11, 5);
        assert_eq!(rg.visible_rows(owner).len(), 3);
        assert_eq!(rg.visible_rows(other).len(), 0);
    }

    #[test]
    fn commit_append_publishes_rows() {
        let mut rg = RowGroup::new(0, &[LogicalType::Int64]);
        rg.append(&chunk_of(&[1, 2, 3]), 0, 3, TXN).unwrap();
        rg.version_mut().commit_append(7, 0, 3);

        let later = TransactionData::new(MAX_ROW_ID + 99, 7);
        let earlier = TransactionData::new(MAX_ROW_ID + 98, 6);
        assert_eq!(rg.visible_rows(later).len(), 3);
        assert_eq!(rg.visible_rows(earlier).len(), 0);
    }

    #[test]
    fn revert_append_hides_rows_forever() {
        let mut rg = RowGroup::new(0, &[LogicalType::Int64]);
        rg.append(&chunk_of(&[1, 2]), 0, 2, TXN).unwrap();
        rg.version_mut().revert_append(0, 2);
        assert_eq!(rg.visible_rows(TransactionData::new(TXN, 100)).len(), 0);
        assert_eq!(rg.visible_rows(TransactionData::none()).len(), 0);
    }

    #[test]
    fn delete_commit_and_monotonicity() {
        let mut rg = RowGroup::new(0, &[LogicalType::Int64]);
        rg.append(&chunk_of(&[1, 2, 3, 4]), 0, 4, 0).unwrap();

        assert!(rg.version_mut().delete_row(TXN, 1));
        // second delete of the same row is refused
        assert!(!rg.version_mut().delete_row(MAX_ROW_ID + 50, 1));

        // tentative delete: other transactions still see the row
        let other = TransactionData::new(MAX_ROW_ID + 50, 3);
        assert_eq!(rg.visible_rows(other).len(), 4);
        // the deleting transaction does not
        assert_eq!(rg.visible_rows(TransactionData::new(TXN, 3)).len(), 3);

        let committed = rg.version_mut().commit_deletes(TXN, 5);
        assert_eq!(committed, 1);
        assert_eq!(rg.visible_rows(TransactionData::new(MAX_ROW_ID + 60, 5)).len(), 3);
        // a transaction that started before the delete commit still sees it
        assert_eq!(rg.visible_rows(TransactionData::new(MAX_ROW_ID + 61, 4)).len(), 4);
        assert_eq!(rg.version().committed_delete_count(), 1);
    }

    #[test]
    fn revert_deletes_restores_rows() {
        let mut rg = RowGroup::new(0, &[LogicalType::Int64]);
        rg.append(&chunk_of(&[1, 2]), 0, 2, 0).unwrap();
        rg.version_mut().delete_row(TXN, 0);
        rg.version_mut().revert_deletes(TXN);
        assert_eq!(rg.visible_rows(TransactionData::new(TXN, 1)).len(), 2);
    }

    #[test]
    fn cleanup_rewrites_old_entries() {
        let mut rg = RowGroup::new(0, &[LogicalType::Int64]);
        rg.append(&chunk_of(&[1, 2]), 0, 2, TXN).unwrap();
        rg.version_mut().commit_append(3, 0, 2);
        rg.version_mut().cleanup(10);
        // rows remain visible to everyone after cleanup
        assert_eq!(rg.visible_rows(TransactionData::new(MAX_ROW_ID + 70, 0)).len(), 2);
    }
}
