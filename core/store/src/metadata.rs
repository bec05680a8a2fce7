use crate::block_manager::{BlockManager, CHECKSUM_SIZE, INVALID_BLOCK};
use crate::{Result, StoreError};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

/// A 256 KiB block is carved into this many sub-blocks for metadata.
pub const META_SUB_BLOCKS_PER_BLOCK: u64 = 64;

/// Bytes of chain header at the start of every sub-block:
/// `next_block_pointer: u64` + `next_offset: u32`.
const SUB_BLOCK_HEADER_SIZE: usize = 12;

/// Address of one metadata sub-block: `block_pointer = block_id * 64 +
/// sub_block_index`, plus a byte offset inside the sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaBlockPointer {
    pub block_pointer: u64,
    pub offset: u32,
}

impl MetaBlockPointer {
    pub fn new(block_pointer: u64, offset: u32) -> Self {
        Self { block_pointer, offset }
    }

    pub fn invalid() -> Self {
        Self { block_pointer: INVALID_BLOCK, offset: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.block_pointer != INVALID_BLOCK
    }

    pub fn block_id(&self) -> u64 {
        self.block_pointer / META_SUB_BLOCKS_PER_BLOCK
    }

    pub fn sub_block_index(&self) -> u64 {
        self.block_pointer % META_SUB_BLOCKS_PER_BLOCK
    }
}

struct MetaBlock {
    block_id: u64,
    data: Vec<u8>,
    next_free_sub_block: u64,
    dirty: bool,
}

/// Carves blocks into sub-blocks and hands out chained byte streams over
/// them. Construction is cheap; blocks are allocated on first use and loaded
/// from the block manager on first read.
pub struct MetadataManager {
    block_manager: Arc<dyn BlockManager>,
    sub_block_size: usize,
    blocks: Vec<MetaBlock>,
}

impl MetadataManager {
    pub fn new(block_manager: Arc<dyn BlockManager>) -> Self {
        let sub_block_size =
            block_manager.block_size() / META_SUB_BLOCKS_PER_BLOCK as usize;
        Self { block_manager, sub_block_size, blocks: Vec::new() }
    }

    pub fn sub_block_size(&self) -> usize {
        self.sub_block_size
    }

    pub fn block_manager(&self) -> &Arc<dyn BlockManager> {
        &self.block_manager
    }

    /// Allocate a fresh sub-block, reusing a partially-filled metadata block
    /// when one exists.
    pub fn allocate_handle(&mut self) -> MetaBlockPointer {
        for block in &mut self.blocks {
            if block.next_free_sub_block < META_SUB_BLOCKS_PER_BLOCK {
                let sub_idx = block.next_free_sub_block;
                block.next_free_sub_block += 1;
                block.dirty = true;
                return MetaBlockPointer::new(
                    block.block_id * META_SUB_BLOCKS_PER_BLOCK + sub_idx,
                    0,
                );
            }
        }

        let block_id = self.block_manager.allocate_block();
        self.blocks.push(MetaBlock {
            block_id,
            data: vec![0u8; self.block_manager.block_alloc_size()],
            next_free_sub_block: 1,
            dirty: true,
        });
        MetaBlockPointer::new(block_id * META_SUB_BLOCKS_PER_BLOCK, 0)
    }

    fn block_index(&mut self, block_id: u64) -> Result<usize> {
        if let Some(idx) = self.blocks.iter().position(|b| b.block_id == block_id) {
            return Ok(idx);
        }
        let data = self.block_manager.read_block(block_id)?;
        self.blocks.push(MetaBlock {
            block_id,
            data,
            // loaded blocks are treated as fully occupied
            next_free_sub_block: META_SUB_BLOCKS_PER_BLOCK,
            dirty: false,
        });
        Ok(self.blocks.len() - 1)
    }

    fn sub_block_range(&self, pointer: MetaBlockPointer) -> std::ops::Range<usize> {
        let start = CHECKSUM_SIZE + pointer.sub_block_index() as usize * self.sub_block_size;
        start..start + self.sub_block_size
    }

    fn sub_block(&mut self, pointer: MetaBlockPointer) -> Result<&[u8]> {
        let idx = self.block_index(pointer.block_id())?;
        let range = self.sub_block_range(pointer);
        Ok(&self.blocks[idx].data[range])
    }

    fn sub_block_mut(&mut self, pointer: MetaBlockPointer) -> Result<&mut [u8]> {
        let idx = self.block_index(pointer.block_id())?;
        self.blocks[idx].dirty = true;
        let range = self.sub_block_range(pointer);
        Ok(&mut self.blocks[idx].data[range])
    }

    /// Write all dirty metadata blocks through the block manager.
    pub fn flush(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            if block.dirty {
                self.block_manager.write_block(block.block_id, &mut block.data)?;
                block.dirty = false;
            }
        }
        Ok(())
    }
}

/// Writes an arbitrary-length byte stream into chained sub-blocks. The
/// format is versionless: readers must consume exactly what was written.
pub struct MetadataWriter<'a> {
    manager: &'a mut MetadataManager,
    start: MetaBlockPointer,
    current: MetaBlockPointer,
    offset: usize,
}

impl<'a> MetadataWriter<'a> {
    pub fn new(manager: &'a mut MetadataManager) -> Self {
        let start = manager.allocate_handle();
        let mut writer = Self { manager, start, current: start, offset: SUB_BLOCK_HEADER_SIZE };
        writer.init_sub_block_header(start);
        writer
    }

    /// Pointer to the first sub-block of this stream; what callers persist.
    pub fn block_pointer(&self) -> MetaBlockPointer {
        self.start
    }

    fn init_sub_block_header(&mut self, pointer: MetaBlockPointer) {
        // freshly allocated sub-blocks are always addressable
        let data = self.manager.sub_block_mut(pointer).expect("allocated sub-block");
        LittleEndian::write_u64(&mut data[0..8], INVALID_BLOCK);
        LittleEndian::write_u32(&mut data[8..12], 0);
    }

    fn ensure_space(&mut self) {
        if self.offset < self.manager.sub_block_size() {
            return;
        }
        let next = self.manager.allocate_handle();
        self.init_sub_block_header(next);

        let data = self.manager.sub_block_mut(self.current).expect("current sub-block");
        LittleEndian::write_u64(&mut data[0..8], next.block_pointer);
        LittleEndian::write_u32(&mut data[8..12], next.offset);

        self.current = next;
        self.offset = SUB_BLOCK_HEADER_SIZE;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let mut written = 0;
        while written < bytes.len() {
            self.ensure_space();
            let sub_block_size = self.manager.sub_block_size();
            let available = sub_block_size - self.offset;
            let to_write = available.min(bytes.len() - written);
            let data = self.manager.sub_block_mut(self.current).expect("current sub-block");
            data[self.offset..self.offset + to_write]
                .copy_from_slice(&bytes[written..written + to_write]);
            self.offset += to_write;
            written += to_write;
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    pub fn flush(&mut self) -> Result<()> {
        self.manager.flush()
    }
}

/// Follows a sub-block chain, yielding typed reads.
pub struct MetadataReader<'a> {
    manager: &'a mut MetadataManager,
    current: MetaBlockPointer,
    offset: usize,
    finished: bool,
}

impl<'a> MetadataReader<'a> {
    pub fn new(manager: &'a mut MetadataManager, start: MetaBlockPointer) -> Self {
        let finished = !start.is_valid();
        Self { manager, current: start, offset: SUB_BLOCK_HEADER_SIZE, finished }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    fn follow_chain(&mut self) -> Result<()> {
        let data = self.manager.sub_block(self.current)?;
        let next_bp = LittleEndian::read_u64(&data[0..8]);
        let next_offset = LittleEndian::read_u32(&data[8..12]);
        if next_bp == INVALID_BLOCK {
            self.finished = true;
            return Ok(());
        }
        self.current = MetaBlockPointer::new(next_bp, next_offset);
        self.offset = SUB_BLOCK_HEADER_SIZE;
        Ok(())
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let mut read = 0;
        while read < out.len() {
            if self.finished {
                return Err(StoreError::MetadataExhausted);
            }
            let sub_block_size = self.manager.sub_block_size();
            let available = sub_block_size - self.offset;
            if available == 0 {
                self.follow_chain()?;
                continue;
            }
            let to_read = available.min(out.len() - read);
            let data = self.manager.sub_block(self.current)?;
            out[read..read + to_read]
                .copy_from_slice(&data[self.offset..self.offset + to_read]);
            self.offset += to_read;
            read += to_read;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|_| StoreError::MetadataExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::InMemoryBlockManager;

    #[test]
    fn small_stream_round_trip() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut manager = MetadataManager::new(bm);

        let pointer = {
            let mut writer = MetadataWriter::new(&mut manager);
            writer.write_u64(42);
            writer.write_string("hello");
            writer.write_u8(7);
            writer.flush().unwrap();
            writer.block_pointer()
        };

        let mut reader = MetadataReader::new(&mut manager, pointer);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_u8().unwrap(), 7);
    }

    #[test]
    fn stream_spills_across_sub_blocks() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut manager = MetadataManager::new(bm);
        let count = 4096u64; // 32 KiB of u64s, ~8 sub-blocks

        let pointer = {
            let mut writer = MetadataWriter::new(&mut manager);
            for i in 0..count {
                writer.write_u64(i * 3);
            }
            writer.flush().unwrap();
            writer.block_pointer()
        };

        let mut reader = MetadataReader::new(&mut manager, pointer);
        for i in 0..count {
            assert_eq!(reader.read_u64().unwrap(), i * 3);
        }
    }

    #[test]
    fn reading_past_end_is_an_error() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut manager = MetadataManager::new(bm);
        let pointer = {
            let mut writer = MetadataWriter::new(&mut manager);
            writer.write_u8(1);
            writer.block_pointer()
        };
        let mut reader = MetadataReader::new(&mut manager, pointer);
        assert_eq!(reader.read_u8().unwrap(), 1);
        let mut big = vec![0u8; 1 << 20];
        assert!(reader.read_bytes(&mut big).is_err());
    }

    #[test]
    fn survives_flush_and_reload() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let pointer = {
            let mut manager = MetadataManager::new(Arc::clone(&bm));
            let mut writer = MetadataWriter::new(&mut manager);
            writer.write_string("persisted");
            writer.write_u32(99);
            writer.flush().unwrap();
            writer.block_pointer()
        };

        // Fresh manager: blocks must come back through the block manager.
        let mut manager = MetadataManager::new(bm);
        let mut reader = MetadataReader::new(&mut manager, pointer);
        assert_eq!(reader.read_string().unwrap(), "persisted");
        assert_eq!(reader.read_u32().unwrap(), 99);
    }
}
