use crate::block_manager::{BlockManager, CHECKSUM_SIZE};
use crate::data_pointer::BlockPointer;
use crate::{Result, StoreError};
use std::sync::Arc;

/// Packs multiple small column segments into shared blocks during a
/// checkpoint, so a 2 KiB delete list does not burn a 256 KiB block.
///
/// Segments larger than a block's payload spill across consecutive writes of
/// dedicated blocks.
pub struct PartialBlockManager {
    block_manager: Arc<dyn BlockManager>,
    current: Option<(u64, Vec<u8>, usize)>,
    written_blocks: Vec<u64>,
}

impl PartialBlockManager {
    pub fn new(block_manager: Arc<dyn BlockManager>) -> Self {
        Self { block_manager, current: None, written_blocks: Vec::new() }
    }

    /// Ids of all blocks written through this manager, in write order.
    pub fn written_blocks(&self) -> &[u64] {
        &self.written_blocks
    }

    /// Usable bytes per block; the upper bound for one segment.
    pub fn block_payload_size(&self) -> usize {
        self.block_manager.block_size()
    }

    /// Append `data` into block storage, coalescing with earlier small
    /// segments when it fits, and return where it landed.
    ///
    /// `data` must fit a single block's payload; callers split their rows
    /// into segments accordingly.
    pub fn append(&mut self, data: &[u8]) -> Result<BlockPointer> {
        let payload_size = self.block_manager.block_size();
        if data.len() > payload_size {
            return Err(StoreError::SegmentTooLarge {
                size: data.len(),
                max: payload_size,
            });
        }

        match &mut self.current {
            Some((block_id, buffer, used)) if *used + data.len() <= payload_size => {
                let offset = *used;
                buffer[CHECKSUM_SIZE + offset..CHECKSUM_SIZE + offset + data.len()]
                    .copy_from_slice(data);
                *used += data.len();
                Ok(BlockPointer { block_id: *block_id, offset: offset as u32 })
            }
            _ => {
                self.flush_current()?;
                let block_id = self.block_manager.allocate_block();
                let mut buffer = vec![0u8; self.block_manager.block_alloc_size()];
                buffer[CHECKSUM_SIZE..CHECKSUM_SIZE + data.len()].copy_from_slice(data);
                self.current = Some((block_id, buffer, data.len()));
                Ok(BlockPointer { block_id, offset: 0 })
            }
        }
    }

    fn flush_current(&mut self) -> Result<()> {
        if let Some((block_id, mut buffer, _)) = self.current.take() {
            self.block_manager.write_block(block_id, &mut buffer)?;
            self.written_blocks.push(block_id);
        }
        Ok(())
    }

    /// Write the trailing partially-filled block, if any.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::InMemoryBlockManager;

    #[test]
    fn small_segments_share_a_block() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut partial = PartialBlockManager::new(Arc::clone(&bm));

        let a = partial.append(&[1u8; 100]).unwrap();
        let b = partial.append(&[2u8; 200]).unwrap();
        partial.flush().unwrap();

        assert_eq!(a.block_id, b.block_id);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);

        let block = bm.read_block(a.block_id).unwrap();
        assert_eq!(block[CHECKSUM_SIZE + 99], 1);
        assert_eq!(block[CHECKSUM_SIZE + 100], 2);
    }

    #[test]
    fn full_block_rolls_over() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::new(4096));
        let mut partial = PartialBlockManager::new(bm);

        let payload = 4096 - CHECKSUM_SIZE;
        let a = partial.append(&vec![1u8; payload - 10]).unwrap();
        let b = partial.append(&[2u8; 100]).unwrap();
        partial.flush().unwrap();
        assert_ne!(a.block_id, b.block_id);
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::new(4096));
        let mut partial = PartialBlockManager::new(bm);
        let data = vec![9u8; 10_000];
        assert!(partial.append(&data).is_err());
    }
}
