use crate::block_manager::BlockManager;
use crate::buffer_pool::BufferPool;
use crate::data_pointer::RowGroupPointer;
use crate::partial_block::PartialBlockManager;
use crate::row_group::RowGroup;
use crate::{Result, StoreError};
use otter_primitives::{DataChunk, LogicalType, TransactionData, Value, Vector, ROW_GROUP_SIZE};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a scan should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    /// MVCC-filtered rows visible to the scanning transaction.
    Visible,
    /// Committed rows, including ones whose delete has committed.
    /// Used when re-scanning a historical range (recovery, index build).
    Committed,
    /// Committed rows minus permanently deleted ones. What compaction and
    /// checkpoints copy.
    CommittedOmitDeleted,
}

/// Cursor over a collection's row groups. One row group's worth of rows is
/// produced per `scan_next` call.
#[derive(Debug, Clone)]
pub struct CollectionScanState {
    pub column_ids: Vec<usize>,
    pub txn: TransactionData,
    pub scan_type: ScanType,
    next_index: usize,
    start_row: i64,
    end_row: i64,
}

impl CollectionScanState {
    pub fn new(column_ids: Vec<usize>, txn: TransactionData) -> Self {
        Self {
            column_ids,
            txn,
            scan_type: ScanType::Visible,
            next_index: 0,
            start_row: 0,
            end_row: i64::MAX,
        }
    }

    pub fn with_range(mut self, start_row: i64, end_row: i64) -> Self {
        self.start_row = start_row;
        self.end_row = end_row;
        self
    }

    pub fn with_scan_type(mut self, scan_type: ScanType) -> Self {
        self.scan_type = scan_type;
        self
    }
}

/// One table's row groups: a dense tree keyed by start row, the column
/// types, and the running row count.
///
/// Mutations are serialized by the owning data table's append lock; readers
/// go through the inner lock only long enough to copy a batch out.
pub struct Collection {
    types: Vec<LogicalType>,
    block_manager: Arc<dyn BlockManager>,
    buffer_pool: Arc<BufferPool>,
    row_group_size: u64,
    row_groups: RwLock<BTreeMap<i64, RowGroup>>,
    total_rows: AtomicU64,
}

impl Collection {
    pub fn new(
        block_manager: Arc<dyn BlockManager>,
        buffer_pool: Arc<BufferPool>,
        types: Vec<LogicalType>,
    ) -> Self {
        Self {
            types,
            block_manager,
            buffer_pool,
            row_group_size: ROW_GROUP_SIZE,
            row_groups: RwLock::new(BTreeMap::new()),
            total_rows: AtomicU64::new(0),
        }
    }

    pub fn types(&self) -> &[LogicalType] {
        &self.types
    }

    pub fn adopt_types(&mut self, types: Vec<LogicalType>) {
        debug_assert!(self.row_groups.read().is_empty());
        self.types = types;
    }

    pub fn block_manager(&self) -> &Arc<dyn BlockManager> {
        &self.block_manager
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn row_group_size(&self) -> u64 {
        self.row_group_size
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }

    pub fn row_group_count(&self) -> usize {
        self.row_groups.read().len()
    }

    /// Install a row group reconstructed from its checkpoint pointer.
    pub fn install_row_group(&self, pointer: &RowGroupPointer) -> Result<()> {
        let rg = RowGroup::from_pointer(
            &self.types,
            pointer,
            self.block_manager.as_ref(),
            &self.buffer_pool,
        )?;
        self.row_groups.write().insert(rg.start(), rg);
        Ok(())
    }

    pub fn set_total_rows(&self, total: u64) {
        self.total_rows.store(total, Ordering::Release);
    }

    /// Append a chunk, filling the trailing row group and opening new ones
    /// at every 2048-row boundary. Returns the absolute start row of the
    /// appended range.
    ///
    /// Callers hold the data table's append lock.
    pub fn append(&self, chunk: &DataChunk, transaction_id: u64) -> Result<i64> {
        let mut groups = self.row_groups.write();
        let row_start = match groups.last_key_value() {
            Some((start, rg)) => *start + rg.count() as i64,
            None => 0,
        };
        debug_assert_eq!(row_start as u64, self.total_rows());

        let mut offset = 0usize;
        let mut remaining = chunk.size();
        while remaining > 0 {
            let needs_new = match groups.last_key_value() {
                Some((_, rg)) => rg.remaining_capacity(self.row_group_size) == 0,
                None => true,
            };
            if needs_new {
                let start = match groups.last_key_value() {
                    Some((start, rg)) => *start + rg.count() as i64,
                    None => 0,
                };
                groups.insert(start, RowGroup::new(start, &self.types));
            }
            let (_, rg) = groups.last_key_value().expect("row group just ensured");
            let capacity = rg.remaining_capacity(self.row_group_size) as usize;
            let to_append = capacity.min(remaining);
            let key = rg.start();
            let rg = groups.get_mut(&key).expect("row group exists");
            rg.append(chunk, offset, to_append, transaction_id)?;
            offset += to_append;
            remaining -= to_append;
        }

        self.total_rows.fetch_add(chunk.size() as u64, Ordering::AcqRel);
        Ok(row_start)
    }

    /// Apply `f` to the version manager of every row group overlapping
    /// `[row_start, row_start + count)`, with in-group offsets.
    fn for_each_version_range(
        &self,
        row_start: i64,
        count: u64,
        mut f: impl FnMut(&mut RowGroup, usize, usize),
    ) {
        let mut groups = self.row_groups.write();
        let end = row_start + count as i64;
        for (_, rg) in groups.range_mut(..end) {
            let rg_start = rg.start();
            let rg_end = rg_start + rg.count() as i64;
            if rg_end <= row_start {
                continue;
            }
            let from = row_start.max(rg_start) - rg_start;
            let to = end.min(rg_end) - rg_start;
            if from < to {
                f(rg, from as usize, (to - from) as usize);
            }
        }
    }

    /// Publish a committed append: rows `[row_start, row_start + count)`
    /// become visible to transactions starting after `commit_id`.
    pub fn commit_append(&self, commit_id: u64, row_start: i64, count: u64) {
        self.for_each_version_range(row_start, count, |rg, offset, len| {
            rg.version_mut().commit_append(commit_id, offset, len);
        });
    }

    pub fn revert_append(&self, row_start: i64, count: u64) {
        self.for_each_version_range(row_start, count, |rg, offset, len| {
            rg.version_mut().revert_append(offset, len);
        });
    }

    /// Commit every tentative delete of `transaction_id` across the tree.
    pub fn commit_all_deletes(&self, transaction_id: u64, commit_id: u64) -> u64 {
        let mut groups = self.row_groups.write();
        let mut total = 0;
        for (_, rg) in groups.iter_mut() {
            total += rg.version_mut().commit_deletes(transaction_id, commit_id);
        }
        total
    }

    pub fn revert_all_deletes(&self, transaction_id: u64) {
        let mut groups = self.row_groups.write();
        for (_, rg) in groups.iter_mut() {
            rg.version_mut().revert_deletes(transaction_id);
        }
    }

    /// Tentatively delete rows by absolute id. Returns how many rows newly
    /// got a delete marker.
    ///
    /// Scans only ever emit absolute ids, so anything that names no row
    /// (including ids at or above `MAX_ROW_ID`) is an error.
    pub fn delete_rows(&self, ids: &[i64], transaction_id: u64) -> Result<u64> {
        let mut groups = self.row_groups.write();
        let mut deleted = 0;
        for &id in ids {
            let (_, rg) = groups
                .range_mut(..=id)
                .next_back()
                .ok_or(StoreError::RowNotFound { row_id: id })?;
            let offset = id - rg.start();
            if offset < 0 || offset as u64 >= rg.count() {
                return Err(StoreError::RowNotFound { row_id: id });
            }
            if rg.version_mut().delete_row(transaction_id, offset as usize) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// In-place update of the latest version of the given rows.
    pub fn update(
        &self,
        ids: &[i64],
        column_ids: &[usize],
        updates: &DataChunk,
    ) -> Result<()> {
        debug_assert_eq!(ids.len(), updates.size());
        let mut groups = self.row_groups.write();
        for (row, &id) in ids.iter().enumerate() {
            let (_, rg) = groups
                .range_mut(..=id)
                .next_back()
                .ok_or(StoreError::RowNotFound { row_id: id })?;
            rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
            let offset = id - rg.start();
            if offset < 0 || offset as u64 >= rg.count() {
                return Err(StoreError::RowNotFound { row_id: id });
            }
            let values: Vec<Value> =
                (0..column_ids.len()).map(|col| updates.value(col, row)).collect();
            rg.update_row(offset as usize, column_ids, &values)?;
        }
        Ok(())
    }

    /// Targeted single-column update along a nested path. `column_path[0]`
    /// selects the column; the remainder walks struct fields by index.
    pub fn update_column(
        &self,
        row_ids: &Vector,
        column_path: &[usize],
        updates: &DataChunk,
    ) -> Result<()> {
        debug_assert_eq!(updates.column_count(), 1);
        let column_id = column_path[0];
        let mut groups = self.row_groups.write();
        for row in 0..updates.size() {
            let id = match row_ids.value(row).as_i64() {
                Some(id) => id,
                None => continue,
            };
            let (_, rg) = groups
                .range_mut(..=id)
                .next_back()
                .ok_or(StoreError::RowNotFound { row_id: id })?;
            rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
            let offset = (id - rg.start()) as usize;
            let new_value = if column_path.len() == 1 {
                updates.value(0, row)
            } else {
                let mut current = rg.column(column_id).fetch_value(offset);
                set_nested(&mut current, &column_path[1..], updates.value(0, row))?;
                current
            };
            rg.update_row(offset, &[column_id], &[new_value])?;
        }
        Ok(())
    }

    /// Produce the next batch of a scan, or `None` when the tree is
    /// exhausted. Row groups with no matching rows are skipped silently.
    pub fn scan_next(&self, state: &mut CollectionScanState) -> Result<Option<DataChunk>> {
        loop {
            let mut groups = self.row_groups.write();
            let Some((&key, _)) = groups.iter().nth(state.next_index) else {
                return Ok(None);
            };
            let rg = groups.get_mut(&key).expect("keyed row group");
            state.next_index += 1;

            if rg.start() >= state.end_row
                || rg.start() + rg.count() as i64 <= state.start_row
            {
                continue;
            }
            rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;

            let rows: Vec<usize> = match state.scan_type {
                ScanType::Visible => rg.visible_rows(state.txn),
                ScanType::Committed => rg.committed_rows(true),
                ScanType::CommittedOmitDeleted => rg.committed_rows(false),
            }
            .into_iter()
            .filter(|&row| {
                let absolute = rg.start() + row as i64;
                absolute >= state.start_row && absolute < state.end_row
            })
            .collect();

            if rows.is_empty() {
                continue;
            }

            let columns = rg.scan_rows(&state.column_ids, &rows)?;
            let mut chunk = DataChunk::from_columns(columns, rows.len());
            let mut row_ids = Vector::with_len(LogicalType::Int64, rows.len());
            for (i, &row) in rows.iter().enumerate() {
                row_ids.set_value(i, &Value::Int64(rg.start() + row as i64))?;
            }
            chunk.set_row_ids(row_ids);
            return Ok(Some(chunk));
        }
    }

    /// Scan one specific row group by tree index; the parallel scan seeds
    /// workers with indices.
    pub fn scan_row_group_at(
        &self,
        index: usize,
        column_ids: &[usize],
        txn: TransactionData,
    ) -> Result<Option<DataChunk>> {
        let mut groups = self.row_groups.write();
        let Some((&key, _)) = groups.iter().nth(index) else {
            return Ok(None);
        };
        let rg = groups.get_mut(&key).expect("keyed row group");
        rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
        let rows = rg.visible_rows(txn);
        if rows.is_empty() {
            return Ok(Some(DataChunk::new(
                &column_ids.iter().map(|&c| self.types[c].clone()).collect::<Vec<_>>(),
            )));
        }
        let columns = rg.scan_rows(column_ids, &rows)?;
        let mut chunk = DataChunk::from_columns(columns, rows.len());
        let mut row_ids = Vector::with_len(LogicalType::Int64, rows.len());
        for (i, &row) in rows.iter().enumerate() {
            row_ids.set_value(i, &Value::Int64(rg.start() + row as i64))?;
        }
        chunk.set_row_ids(row_ids);
        Ok(Some(chunk))
    }

    /// Gather specific rows by absolute id into a result chunk.
    pub fn fetch(&self, column_ids: &[usize], row_ids: &[i64]) -> Result<DataChunk> {
        let types: Vec<LogicalType> =
            column_ids.iter().map(|&c| self.types[c].clone()).collect();
        let mut chunk = DataChunk::new(&types);
        let mut groups = self.row_groups.write();
        for &id in row_ids {
            let (_, rg) = groups
                .range_mut(..=id)
                .next_back()
                .ok_or(StoreError::RowNotFound { row_id: id })?;
            rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
            let offset = id - rg.start();
            if offset < 0 || offset as u64 >= rg.count() {
                return Err(StoreError::RowNotFound { row_id: id });
            }
            let row: Vec<Value> = column_ids
                .iter()
                .map(|&c| rg.column(c).fetch_value(offset as usize))
                .collect();
            chunk.push_row(&row)?;
        }
        Ok(chunk)
    }

    /// A new collection with an extra trailing column, default-filled on
    /// every existing row.
    pub fn add_column(&self, ty: LogicalType, default: &Value) -> Result<Collection> {
        let mut types = self.types.clone();
        types.push(ty.clone());
        let new = Collection::new(Arc::clone(&self.block_manager), Arc::clone(&self.buffer_pool), types);
        {
            let mut src = self.row_groups.write();
            let mut dst = new.row_groups.write();
            for (key, rg) in src.iter_mut() {
                rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
                let mut copied = rg.clone();
                copied.add_column(ty.clone(), default)?;
                dst.insert(*key, copied);
            }
        }
        new.set_total_rows(self.total_rows());
        Ok(new)
    }

    /// A new collection without the given column.
    pub fn remove_column(&self, column_id: usize) -> Result<Collection> {
        let mut types = self.types.clone();
        types.remove(column_id);
        let new = Collection::new(Arc::clone(&self.block_manager), Arc::clone(&self.buffer_pool), types);
        {
            let mut src = self.row_groups.write();
            let mut dst = new.row_groups.write();
            for (key, rg) in src.iter_mut() {
                rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
                let mut copied = rg.clone();
                copied.remove_column(column_id);
                dst.insert(*key, copied);
            }
        }
        new.set_total_rows(self.total_rows());
        Ok(new)
    }

    /// Move another collection's committed rows into this one. The source is
    /// left empty-equivalent; callers drop it.
    pub fn merge_storage(&self, other: &Collection) -> Result<()> {
        let mut state = CollectionScanState::new(
            (0..other.types.len()).collect(),
            TransactionData::none(),
        )
        .with_scan_type(ScanType::CommittedOmitDeleted);
        while let Some(chunk) = other.scan_next(&mut state)? {
            self.append(&chunk, 0)?;
        }
        Ok(())
    }

    /// Serialize every row group through the partial block manager.
    pub fn checkpoint(&self, partial: &mut PartialBlockManager) -> Result<Vec<RowGroupPointer>> {
        let mut groups = self.row_groups.write();
        let mut pointers = Vec::with_capacity(groups.len());
        for (_, rg) in groups.iter_mut() {
            rg.ensure_loaded(self.block_manager.as_ref(), &self.buffer_pool)?;
            pointers.push(rg.checkpoint(partial)?);
        }
        Ok(pointers)
    }

    /// Total rows minus permanently deleted and reverted rows: what
    /// compaction will keep.
    pub fn calculate_size(&self) -> u64 {
        let groups = self.row_groups.read();
        let gone: u64 = groups
            .values()
            .map(|rg| {
                rg.version().committed_delete_count() + rg.version().never_inserted_count()
            })
            .sum();
        self.total_rows().saturating_sub(gone)
    }

    pub fn cleanup_versions(&self, lowest_active_start_time: u64) {
        let mut groups = self.row_groups.write();
        for (_, rg) in groups.iter_mut() {
            rg.version_mut().cleanup(lowest_active_start_time);
        }
    }

    /// Check the dense-tree invariant; test support.
    pub fn verify_dense(&self) -> bool {
        let groups = self.row_groups.read();
        let mut expected = 0i64;
        for (key, rg) in groups.iter() {
            if *key != expected || rg.start() != expected {
                return false;
            }
            expected += rg.count() as i64;
        }
        expected as u64 == self.total_rows()
    }
}

fn set_nested(current: &mut Value, path: &[usize], new_value: Value) -> Result<()> {
    if path.is_empty() {
        *current = new_value;
        return Ok(());
    }
    let out_of_bounds = |len: usize| {
        StoreError::Type(otter_primitives::TypeError::RowOutOfBounds { row: path[0], len })
    };
    match current {
        Value::Struct(fields) => {
            let len = fields.len();
            let (_, child) = fields.get_mut(path[0]).ok_or_else(|| out_of_bounds(len))?;
            set_nested(child, &path[1..], new_value)
        }
        Value::List(items) => {
            let len = items.len();
            let child = items.get_mut(path[0]).ok_or_else(|| out_of_bounds(len))?;
            set_nested(child, &path[1..], new_value)
        }
        _ => Err(StoreError::Type(otter_primitives::TypeError::Mismatch {
            expected: LogicalType::Struct { fields: vec![] },
            actual: current.logical_type(),
        })),
    }
}
