use crate::block_manager::BlockManager;
use crate::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Read-through cache of materialized blocks, bounded by a byte budget.
///
/// Only clean (already checkpointed) buffers live here; writes go straight
/// through the block manager and invalidate the cached copy. Eviction is
/// plain LRU on whole blocks.
pub struct BufferPool {
    cache: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
    capacity_blocks: usize,
}

impl BufferPool {
    pub fn new(capacity_bytes: usize, block_alloc_size: usize) -> Self {
        let capacity_blocks = (capacity_bytes / block_alloc_size).max(1);
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity_blocks).unwrap_or(NonZeroUsize::MIN),
            )),
            capacity_blocks,
        }
    }

    pub fn capacity_blocks(&self) -> usize {
        self.capacity_blocks
    }

    /// Fetch a block, reading it through `block_manager` on a miss.
    pub fn read(&self, block_manager: &dyn BlockManager, block_id: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(buffer) = self.cache.lock().get(&block_id) {
            return Ok(Arc::clone(buffer));
        }
        let buffer = Arc::new(block_manager.read_block(block_id)?);
        self.cache.lock().put(block_id, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Drop any cached copy; the next read goes to disk.
    pub fn invalidate(&self, block_id: u64) {
        self.cache.lock().pop(&block_id);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
