use crate::block_manager::BlockManager;
use crate::buffer_pool::BufferPool;
use crate::collection::{Collection, CollectionScanState, ScanType};
use crate::data_pointer::RowGroupPointer;
use crate::metadata::{MetadataReader, MetadataWriter};
use crate::partial_block::PartialBlockManager;
use crate::{Result, StoreError};
use otter_primitives::{
    DataChunk, LogicalType, TransactionData, Value, Vector, MAX_ROW_ID,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub ty: LogicalType,
    pub not_null: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, ty: LogicalType) -> Self {
        Self { name: name.into(), ty, not_null: false }
    }

    pub fn with_not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

/// An in-flight append: holds the table's append lock, remembers where the
/// rows landed so commit/revert can address them.
#[derive(Debug)]
pub struct TableAppendState<'a> {
    _guard: MutexGuard<'a, ()>,
    pub txn: TransactionData,
    pub row_start: i64,
    pub appended: u64,
}

/// Shared cursor of a parallel scan: each worker atomically claims the next
/// row group index.
pub struct ParallelScanState {
    pub column_ids: Vec<usize>,
    pub txn: TransactionData,
    next_row_group: AtomicUsize,
    total_row_groups: usize,
}

impl ParallelScanState {
    pub fn total_row_groups(&self) -> usize {
        self.total_row_groups
    }
}

/// A named, schema-carrying collection: the storage-facing face of one
/// table. Mutating operations serialize on the append lock; a table that
/// schema evolution has replaced rejects further writes.
pub struct DataTable {
    name: RwLock<String>,
    column_definitions: RwLock<Vec<ColumnDefinition>>,
    append_lock: Mutex<()>,
    collection: RwLock<Arc<Collection>>,
    is_root: AtomicBool,
}

impl DataTable {
    pub fn new(
        block_manager: Arc<dyn BlockManager>,
        buffer_pool: Arc<BufferPool>,
        columns: Vec<ColumnDefinition>,
        name: impl Into<String>,
    ) -> Self {
        let types: Vec<LogicalType> = columns.iter().map(|c| c.ty.clone()).collect();
        Self {
            name: RwLock::new(name.into()),
            column_definitions: RwLock::new(columns),
            append_lock: Mutex::new(()),
            collection: RwLock::new(Arc::new(Collection::new(block_manager, buffer_pool, types))),
            is_root: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn columns(&self) -> Vec<ColumnDefinition> {
        self.column_definitions.read().clone()
    }

    pub fn column_count(&self) -> usize {
        self.column_definitions.read().len()
    }

    pub fn types(&self) -> Vec<LogicalType> {
        self.column_definitions.read().iter().map(|c| c.ty.clone()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_definitions.read().iter().position(|c| c.name == name)
    }

    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::Acquire)
    }

    pub fn collection(&self) -> Arc<Collection> {
        Arc::clone(&self.collection.read())
    }

    /// Install inferred columns on a schema-less table.
    pub fn adopt_schema(&self, columns: Vec<ColumnDefinition>) {
        debug_assert!(self.column_definitions.read().is_empty());
        let types: Vec<LogicalType> = columns.iter().map(|c| c.ty.clone()).collect();
        *self.column_definitions.write() = columns;
        let collection = self.collection.read();
        debug_assert!(collection.is_empty());
        // re-create with the adopted types; the collection is empty
        let new = Collection::new(
            Arc::clone(collection.block_manager()),
            Arc::clone(collection.buffer_pool()),
            types,
        );
        drop(collection);
        *self.collection.write() = Arc::new(new);
    }

    /// Force NOT NULL on an existing column.
    pub fn overlay_not_null(&self, column_name: &str) {
        let mut columns = self.column_definitions.write();
        if let Some(column) = columns.iter_mut().find(|c| c.name == column_name) {
            column.not_null = true;
        }
    }

    /// Take the append lock and record the append origin. Fails when the
    /// table has been replaced by schema evolution.
    pub fn begin_append(&self, txn: TransactionData) -> Result<TableAppendState<'_>> {
        let guard = self.append_lock.lock();
        if !self.is_root() {
            return Err(StoreError::TableAltered);
        }
        let row_start = self.collection.read().total_rows() as i64;
        Ok(TableAppendState { _guard: guard, txn, row_start, appended: 0 })
    }

    pub fn append(&self, chunk: &DataChunk, state: &mut TableAppendState<'_>) -> Result<()> {
        self.collection.read().append(chunk, state.txn.transaction_id)?;
        state.appended += chunk.size() as u64;
        Ok(())
    }

    pub fn commit_append(&self, commit_id: u64, row_start: i64, count: u64) {
        self.collection.read().commit_append(commit_id, row_start, count);
    }

    pub fn revert_append(&self, row_start: i64, count: u64) {
        self.collection.read().revert_append(row_start, count);
    }

    pub fn commit_all_deletes(&self, transaction_id: u64, commit_id: u64) -> u64 {
        self.collection.read().commit_all_deletes(transaction_id, commit_id)
    }

    pub fn revert_all_deletes(&self, transaction_id: u64) {
        self.collection.read().revert_all_deletes(transaction_id)
    }

    pub fn initialize_scan(&self, column_ids: Vec<usize>, txn: TransactionData) -> CollectionScanState {
        CollectionScanState::new(column_ids, txn)
    }

    pub fn scan_next(&self, state: &mut CollectionScanState) -> Result<Option<DataChunk>> {
        self.collection.read().scan_next(state)
    }

    pub fn fetch(&self, column_ids: &[usize], row_ids: &[i64]) -> Result<DataChunk> {
        self.collection.read().fetch(column_ids, row_ids)
    }

    /// Tentatively delete rows named by a BIGINT row-id vector; each id
    /// routes to its row group's version chain.
    pub fn delete_rows(
        &self,
        row_ids: &Vector,
        count: usize,
        transaction_id: u64,
    ) -> Result<u64> {
        if count == 0 {
            return Ok(0);
        }
        let mut ids = Vec::with_capacity(count);
        for row in 0..count {
            match row_ids.value(row).as_i64() {
                Some(id) => ids.push(id),
                None => continue,
            }
        }
        self.collection.read().delete_rows(&ids, transaction_id)
    }

    /// Apply an update chunk to the rows named by `row_ids`, all columns.
    /// Rows whose id is at or above `MAX_ROW_ID` have no materialized
    /// storage and are excluded from the update.
    pub fn update(&self, row_ids: &Vector, data: &DataChunk) -> Result<()> {
        if data.size() == 0 {
            return Ok(());
        }
        if !self.is_root() {
            return Err(StoreError::TableAltered);
        }
        let mut ids = Vec::with_capacity(data.size());
        let mut selected = Vec::with_capacity(data.size());
        for row in 0..data.size() {
            let Some(id) = row_ids.value(row).as_i64() else { continue };
            if (id as u64) >= MAX_ROW_ID {
                continue;
            }
            ids.push(id);
            selected.push(row);
        }
        if ids.is_empty() {
            return Ok(());
        }
        let column_ids: Vec<usize> = (0..self.column_count()).collect();
        let collection = self.collection.read();
        if selected.len() == data.size() {
            collection.update(&ids, &column_ids, data)
        } else {
            collection.update(&ids, &column_ids, &data.slice(&selected))
        }
    }

    /// `UPDATE ... SET nested.field = ...`: single-column update along a
    /// struct path.
    pub fn update_column(
        &self,
        row_ids: &Vector,
        column_path: &[usize],
        updates: &DataChunk,
    ) -> Result<()> {
        if updates.size() == 0 {
            return Ok(());
        }
        if !self.is_root() {
            return Err(StoreError::TableAltered);
        }
        self.collection.read().update_column(row_ids, column_path, updates)
    }

    /// A new table with one more column; this table stops accepting writes.
    pub fn add_column(
        &self,
        definition: ColumnDefinition,
        default: &Value,
    ) -> Result<DataTable> {
        let _guard = self.append_lock.lock();
        let collection = self.collection.read();
        let new_collection = collection.add_column(definition.ty.clone(), default)?;
        let mut columns = self.columns();
        columns.push(definition);
        self.is_root.store(false, Ordering::Release);
        Ok(DataTable {
            name: RwLock::new(self.name()),
            column_definitions: RwLock::new(columns),
            append_lock: Mutex::new(()),
            collection: RwLock::new(Arc::new(new_collection)),
            is_root: AtomicBool::new(true),
        })
    }

    /// A new table without the given column; this table stops accepting
    /// writes.
    pub fn remove_column(&self, column_id: usize) -> Result<DataTable> {
        let _guard = self.append_lock.lock();
        let collection = self.collection.read();
        let new_collection = collection.remove_column(column_id)?;
        let mut columns = self.columns();
        columns.remove(column_id);
        self.is_root.store(false, Ordering::Release);
        Ok(DataTable {
            name: RwLock::new(self.name()),
            column_definitions: RwLock::new(columns),
            append_lock: Mutex::new(()),
            collection: RwLock::new(Arc::new(new_collection)),
            is_root: AtomicBool::new(true),
        })
    }

    /// Re-scan a committed row range, chunk by chunk. Recovery and index
    /// builds use this after appends have landed.
    pub fn scan_table_segment(
        &self,
        row_start: i64,
        count: u64,
        mut f: impl FnMut(&DataChunk),
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let column_ids: Vec<usize> = (0..self.column_count()).collect();
        let mut state = CollectionScanState::new(column_ids, TransactionData::none())
            .with_range(row_start, row_start + count as i64)
            .with_scan_type(ScanType::Committed);
        let collection = self.collection.read();
        while let Some(chunk) = collection.scan_next(&mut state)? {
            f(&chunk);
        }
        Ok(())
    }

    pub fn create_parallel_scan_state(
        &self,
        column_ids: Vec<usize>,
        txn: TransactionData,
    ) -> ParallelScanState {
        ParallelScanState {
            column_ids,
            txn,
            next_row_group: AtomicUsize::new(0),
            total_row_groups: self.collection.read().row_group_count(),
        }
    }

    /// Claim and scan the next row group. Row groups whose visible row set
    /// is empty are skipped silently.
    pub fn next_parallel_chunk(&self, state: &ParallelScanState) -> Result<Option<DataChunk>> {
        let collection = self.collection.read();
        loop {
            let index = state.next_row_group.fetch_add(1, Ordering::AcqRel);
            if index >= state.total_row_groups {
                return Ok(None);
            }
            match collection.scan_row_group_at(index, &state.column_ids, state.txn)? {
                Some(chunk) if chunk.size() > 0 => return Ok(Some(chunk)),
                _ => continue,
            }
        }
    }

    /// Rewrite the collection without permanently deleted rows.
    pub fn compact(&self) -> Result<()> {
        let _guard = self.append_lock.lock();
        let old = Arc::clone(&self.collection.read());
        if old.total_rows() == 0 {
            return Ok(());
        }
        let expected = old.calculate_size();

        let new = Collection::new(
            Arc::clone(old.block_manager()),
            Arc::clone(old.buffer_pool()),
            old.types().to_vec(),
        );
        let column_ids: Vec<usize> = (0..old.types().len()).collect();
        let mut state = CollectionScanState::new(column_ids, TransactionData::none())
            .with_scan_type(ScanType::CommittedOmitDeleted);
        while let Some(chunk) = old.scan_next(&mut state)? {
            new.append(&chunk, 0)?;
        }
        debug_assert_eq!(new.total_rows(), expected);
        tracing::debug!(
            target: "store",
            table = %self.name(),
            before = old.total_rows(),
            after = new.total_rows(),
            "compacted collection"
        );

        *self.collection.write() = Arc::new(new);
        Ok(())
    }

    pub fn merge_storage(&self, other: &Collection) -> Result<()> {
        self.collection.read().merge_storage(other)
    }

    pub fn calculate_size(&self) -> u64 {
        self.collection.read().calculate_size()
    }

    pub fn total_rows(&self) -> u64 {
        self.collection.read().total_rows()
    }

    pub fn cleanup_versions(&self, lowest_active_start_time: u64) {
        self.collection.read().cleanup_versions(lowest_active_start_time)
    }

    /// Write this table's metadata and row groups into the metadata stream:
    /// name, column definitions, then the row-group pointers produced by the
    /// collection checkpoint.
    pub fn checkpoint(&self, writer: &mut MetadataWriter<'_>) -> Result<()> {
        let collection = self.collection.read();
        let mut partial =
            PartialBlockManager::new(Arc::clone(collection.block_manager()));
        let pointers = collection.checkpoint(&mut partial)?;
        partial.flush()?;

        writer.write_string(&self.name());
        let columns = self.columns();
        writer.write_u32(columns.len() as u32);
        for column in &columns {
            writer.write_string(&column.name);
            writer.write_u8(column.ty.type_tag());
            writer.write_u8(column.not_null as u8);
        }
        writer.write_u32(pointers.len() as u32);
        for pointer in &pointers {
            pointer.serialize(writer);
        }
        Ok(())
    }

    /// Inverse of [`DataTable::checkpoint`].
    pub fn load_from_disk(
        block_manager: Arc<dyn BlockManager>,
        buffer_pool: Arc<BufferPool>,
        reader: &mut MetadataReader<'_>,
    ) -> Result<DataTable> {
        let name = reader.read_string()?;
        let column_count = reader.read_u32()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let column_name = reader.read_string()?;
            let tag = reader.read_u8()?;
            let not_null = reader.read_u8()? != 0;
            let ty = LogicalType::from_type_tag(tag)
                .ok_or(StoreError::UnsupportedColumnType(column_name.clone()))?;
            columns.push(ColumnDefinition { name: column_name, ty, not_null });
        }

        let table = DataTable::new(block_manager, buffer_pool, columns, name);
        let pointer_count = reader.read_u32()? as usize;
        let mut total_rows = 0;
        {
            let collection = table.collection.read();
            for _ in 0..pointer_count {
                let pointer = RowGroupPointer::deserialize(reader)?;
                total_rows += pointer.tuple_count;
                collection.install_row_group(&pointer)?;
            }
            collection.set_total_rows(total_rows);
        }
        Ok(table)
    }
}
