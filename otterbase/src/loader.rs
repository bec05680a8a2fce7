//! Startup recovery: read the checkpointed tables out of the database
//! file's metadata stream, restore the free list, and hand back the WAL
//! replay set.

use crate::EngineError;
use otter_store::{
    BlockManager, BufferPool, DataTable, MetaBlockPointer, MetadataManager, MetadataReader,
    SingleFileBlockManager,
};
use otter_wal::WalId;
use std::sync::Arc;

/// What the loader reconstructed from the database file.
pub struct LoadedState {
    /// Tables checkpointed to disk, with their owning database names.
    pub tables: Vec<(String, DataTable)>,
    /// The WAL id recorded by the last successful checkpoint; replay skips
    /// records at or below it.
    pub last_wal_id: WalId,
}

impl LoadedState {
    pub fn empty() -> Self {
        Self { tables: Vec::new(), last_wal_id: 0 }
    }
}

/// Read the root metadata stream: the checkpoint WAL id, then every
/// checkpointed table.
pub fn load_tables(
    block_manager: &Arc<dyn BlockManager>,
    buffer_pool: &Arc<BufferPool>,
) -> Result<LoadedState, EngineError> {
    let meta_block = block_manager.meta_block();
    if meta_block == otter_primitives::INVALID_INDEX {
        return Ok(LoadedState::empty());
    }

    let mut manager = MetadataManager::new(Arc::clone(block_manager));
    let mut reader = MetadataReader::new(&mut manager, MetaBlockPointer::new(meta_block, 0));

    let last_wal_id = reader.read_u64()?;
    let table_count = reader.read_u32()? as usize;
    let mut tables = Vec::with_capacity(table_count);
    for _ in 0..table_count {
        let database = reader.read_string()?;
        let table = DataTable::load_from_disk(
            Arc::clone(block_manager),
            Arc::clone(buffer_pool),
            &mut reader,
        )?;
        tracing::debug!(
            target: "loader",
            database,
            table = table.name(),
            rows = table.total_rows(),
            "loaded table from checkpoint"
        );
        tables.push((database, table));
    }

    tracing::info!(
        target: "loader",
        tables = tables.len(),
        last_wal_id,
        "database file loaded"
    );
    Ok(LoadedState { tables, last_wal_id })
}

/// Restore the block free list serialized by the last checkpoint.
pub fn restore_free_list(
    file_manager: &Arc<SingleFileBlockManager>,
    block_manager: &Arc<dyn BlockManager>,
    free_list_root: u64,
) -> Result<(), EngineError> {
    if free_list_root == otter_primitives::INVALID_INDEX {
        return Ok(());
    }
    let mut manager = MetadataManager::new(Arc::clone(block_manager));
    let mut reader = MetadataReader::new(&mut manager, MetaBlockPointer::new(free_list_root, 0));
    let count = reader.read_u64()?;
    let mut free = Vec::with_capacity(count as usize);
    for _ in 0..count {
        free.push(reader.read_u64()?);
    }
    file_manager.restore_free_list(free);
    Ok(())
}
