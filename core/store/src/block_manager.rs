use crate::{Result, StoreError};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Sector size of the header region. Headers are padded to exactly this.
pub const SECTOR_SIZE: u64 = 4096;

/// First data block starts after the main header and both database headers.
pub const BLOCK_START: u64 = 3 * SECTOR_SIZE;

/// Default size of one block, checksum included.
pub const DEFAULT_BLOCK_ALLOC_SIZE: usize = 256 * 1024;

/// The first 8 bytes of every block hold the CRC32C of the rest.
pub const CHECKSUM_SIZE: usize = 8;

/// "OTBX" little-endian.
const MAGIC_NUMBER: u32 = 0x5842544F;
const CURRENT_VERSION: u32 = 1;

pub(crate) const INVALID_BLOCK: u64 = u64::MAX;

/// One of the two alternating database header slots.
///
/// On commit the manager bumps `iteration` and writes the slot selected by
/// its parity, syncs, then mirrors to the other slot. A torn write of one
/// slot leaves the older complete header intact; the larger iteration wins
/// on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub iteration: u64,
    pub meta_block: u64,
    pub free_list: u64,
    pub block_count: u64,
    pub block_alloc_size: u64,
    pub checksum: u64,
}

impl DatabaseHeader {
    fn new(block_alloc_size: u64) -> Self {
        Self {
            iteration: 0,
            meta_block: INVALID_BLOCK,
            free_list: INVALID_BLOCK,
            block_count: 0,
            block_alloc_size,
            checksum: 0,
        }
    }

    fn write_to(&self, sector: &mut [u8]) {
        sector.fill(0);
        LittleEndian::write_u64(&mut sector[0..8], self.iteration);
        LittleEndian::write_u64(&mut sector[8..16], self.meta_block);
        LittleEndian::write_u64(&mut sector[16..24], self.free_list);
        LittleEndian::write_u64(&mut sector[24..32], self.block_count);
        LittleEndian::write_u64(&mut sector[32..40], self.block_alloc_size);
        LittleEndian::write_u64(&mut sector[40..48], self.checksum);
    }

    fn read_from(sector: &[u8]) -> Self {
        Self {
            iteration: LittleEndian::read_u64(&sector[0..8]),
            meta_block: LittleEndian::read_u64(&sector[8..16]),
            free_list: LittleEndian::read_u64(&sector[16..24]),
            block_count: LittleEndian::read_u64(&sector[24..32]),
            block_alloc_size: LittleEndian::read_u64(&sector[32..40]),
            checksum: LittleEndian::read_u64(&sector[40..48]),
        }
    }
}

/// Fixed-size block storage. Blocks are identified by a dense `u64` id and
/// addressed at `BLOCK_START + id * block_alloc_size` in the backing file.
///
/// Allocation state (free list, used set, modified set) sits behind one
/// coarse mutex; file I/O serializes on the handle's own lock.
pub trait BlockManager: Send + Sync {
    /// Size of one block on disk, checksum included.
    fn block_alloc_size(&self) -> usize;

    /// Usable payload bytes per block.
    fn block_size(&self) -> usize {
        self.block_alloc_size() - CHECKSUM_SIZE
    }

    /// Pop the lowest free block id, or extend the block range.
    fn allocate_block(&self) -> u64;

    /// The id `allocate_block` would return, without taking it.
    fn peek_free_block(&self) -> u64;

    fn mark_free(&self, block_id: u64);
    fn mark_used(&self, block_id: u64);
    fn mark_modified(&self, block_id: u64);

    /// Read a whole block and verify its checksum.
    fn read_block(&self, block_id: u64) -> Result<Vec<u8>>;

    /// Stamp the checksum into the first 8 bytes of `buffer` and write it.
    /// `buffer` must be exactly `block_alloc_size` long.
    fn write_block(&self, block_id: u64, buffer: &mut [u8]) -> Result<()>;

    fn total_blocks(&self) -> u64;
    fn free_blocks(&self) -> u64;

    fn meta_block(&self) -> u64;
    fn set_meta_block(&self, block_id: u64);

    fn in_memory(&self) -> bool;

    fn sync(&self) -> Result<()>;

    /// Drop the file tail past the last allocated block.
    fn truncate(&self) -> Result<()>;
}

pub(crate) fn checksum_block(buffer: &[u8]) -> u64 {
    crc32c::crc32c(&buffer[CHECKSUM_SIZE..]) as u64
}

fn stamp_checksum(buffer: &mut [u8]) {
    let crc = checksum_block(buffer);
    LittleEndian::write_u64(&mut buffer[..CHECKSUM_SIZE], crc);
}

fn verify_checksum(block_id: u64, buffer: &[u8]) -> Result<()> {
    let stored = LittleEndian::read_u64(&buffer[..CHECKSUM_SIZE]);
    if stored != checksum_block(buffer) {
        return Err(StoreError::ChecksumMismatch { block_id });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct AllocationState {
    free_list: BTreeSet<u64>,
    used_blocks: BTreeSet<u64>,
    modified_blocks: BTreeSet<u64>,
    max_block: u64,
}

/// Block manager over one database file, laid out as main header, database
/// header slots A and B, then data blocks.
pub struct SingleFileBlockManager {
    file: Mutex<File>,
    block_alloc_size: usize,
    state: Mutex<AllocationState>,
    iteration: Mutex<u64>,
    meta_block: Mutex<u64>,
}

impl SingleFileBlockManager {
    /// Create a fresh database file, writing the main header and both
    /// database header slots.
    pub fn create_new(path: &Path, block_alloc_size: usize) -> Result<Self> {
        let mut file =
            OpenOptions::new().read(true).write(true).create_new(true).open(path)?;

        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        LittleEndian::write_u32(&mut sector[0..4], MAGIC_NUMBER);
        LittleEndian::write_u32(&mut sector[4..8], CURRENT_VERSION);
        // flags at [8..16], zero
        file.write_all(&sector)?;

        let header = DatabaseHeader::new(block_alloc_size as u64);
        header.write_to(&mut sector);
        file.write_all(&sector)?;
        file.write_all(&sector)?;
        file.sync_all()?;

        tracing::debug!(target: "store", path = %path.display(), "created database file");
        Ok(Self {
            file: Mutex::new(file),
            block_alloc_size,
            state: Mutex::new(AllocationState::default()),
            iteration: Mutex::new(0),
            meta_block: Mutex::new(INVALID_BLOCK),
        })
    }

    /// Open an existing database file, picking the database header with the
    /// larger iteration and loading its free list root.
    pub fn open_existing(path: &Path, block_alloc_size: usize) -> Result<(Self, DatabaseHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        file.read_exact(&mut sector)?;
        let magic = LittleEndian::read_u32(&sector[0..4]);
        let version = LittleEndian::read_u32(&sector[4..8]);
        if magic != MAGIC_NUMBER || version > CURRENT_VERSION {
            return Err(StoreError::InvalidHeader);
        }

        file.read_exact(&mut sector)?;
        let header_a = DatabaseHeader::read_from(&sector);
        file.read_exact(&mut sector)?;
        let header_b = DatabaseHeader::read_from(&sector);
        let active = if header_a.iteration >= header_b.iteration { header_a } else { header_b };

        let alloc_size = if active.block_alloc_size != 0 {
            active.block_alloc_size as usize
        } else {
            block_alloc_size
        };

        tracing::debug!(
            target: "store",
            path = %path.display(),
            iteration = active.iteration,
            blocks = active.block_count,
            "opened database file"
        );
        let manager = Self {
            file: Mutex::new(file),
            block_alloc_size: alloc_size,
            state: Mutex::new(AllocationState {
                max_block: active.block_count,
                ..Default::default()
            }),
            iteration: Mutex::new(active.iteration),
            meta_block: Mutex::new(active.meta_block),
        };
        Ok((manager, active))
    }

    fn block_location(&self, block_id: u64) -> u64 {
        BLOCK_START + block_id * self.block_alloc_size as u64
    }

    /// Commit a new database header: bump the iteration, write the slot the
    /// parity selects, sync, then mirror to the other slot and sync again.
    pub fn write_header(&self, mut header: DatabaseHeader) -> Result<()> {
        let mut iteration = self.iteration.lock();
        *iteration += 1;
        header.iteration = *iteration;
        header.block_count = self.state.lock().max_block;
        header.block_alloc_size = self.block_alloc_size as u64;
        header.meta_block = *self.meta_block.lock();

        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        header.write_to(&mut sector);

        let slot = if *iteration % 2 == 1 { SECTOR_SIZE } else { 2 * SECTOR_SIZE };
        let other = if slot == SECTOR_SIZE { 2 * SECTOR_SIZE } else { SECTOR_SIZE };

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(slot))?;
        file.write_all(&sector)?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(other))?;
        file.write_all(&sector)?;
        file.sync_all()?;
        Ok(())
    }

    /// Restore the free list from ids collected out of the metadata stream.
    pub fn restore_free_list(&self, free: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock();
        state.free_list.extend(free);
    }

    pub fn free_list_ids(&self) -> Vec<u64> {
        self.state.lock().free_list.iter().copied().collect()
    }
}

impl BlockManager for SingleFileBlockManager {
    fn block_alloc_size(&self) -> usize {
        self.block_alloc_size
    }

    fn allocate_block(&self) -> u64 {
        let mut state = self.state.lock();
        let block_id = match state.free_list.pop_first() {
            Some(id) => id,
            None => {
                let id = state.max_block;
                state.max_block += 1;
                id
            }
        };
        state.used_blocks.insert(block_id);
        block_id
    }

    fn peek_free_block(&self) -> u64 {
        let state = self.state.lock();
        state.free_list.first().copied().unwrap_or(state.max_block)
    }

    fn mark_free(&self, block_id: u64) {
        let mut state = self.state.lock();
        state.used_blocks.remove(&block_id);
        state.modified_blocks.remove(&block_id);
        state.free_list.insert(block_id);
    }

    fn mark_used(&self, block_id: u64) {
        let mut state = self.state.lock();
        state.free_list.remove(&block_id);
        state.used_blocks.insert(block_id);
    }

    fn mark_modified(&self, block_id: u64) {
        self.state.lock().modified_blocks.insert(block_id);
    }

    fn read_block(&self, block_id: u64) -> Result<Vec<u8>> {
        let total = self.state.lock().max_block;
        if block_id >= total {
            return Err(StoreError::BlockOutOfRange { block_id, total });
        }
        let mut buffer = vec![0u8; self.block_alloc_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.block_location(block_id)))?;
            file.read_exact(&mut buffer)?;
        }
        verify_checksum(block_id, &buffer)?;
        Ok(buffer)
    }

    fn write_block(&self, block_id: u64, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), self.block_alloc_size);
        stamp_checksum(buffer);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.block_location(block_id)))?;
        file.write_all(buffer)?;
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.state.lock().max_block
    }

    fn free_blocks(&self) -> u64 {
        self.state.lock().free_list.len() as u64
    }

    fn meta_block(&self) -> u64 {
        *self.meta_block.lock()
    }

    fn set_meta_block(&self, block_id: u64) {
        *self.meta_block.lock() = block_id;
    }

    fn in_memory(&self) -> bool {
        false
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        let end = self.block_location(self.state.lock().max_block);
        self.file.lock().set_len(end)?;
        Ok(())
    }
}

/// Block manager backed by a map of buffers. Used by tests and `IN_MEMORY`
/// tables; checksums are maintained so that read/write round-trips behave
/// exactly like the on-disk manager.
pub struct InMemoryBlockManager {
    block_alloc_size: usize,
    blocks: Mutex<std::collections::HashMap<u64, Vec<u8>>>,
    state: Mutex<AllocationState>,
    meta_block: Mutex<u64>,
}

impl InMemoryBlockManager {
    pub fn new(block_alloc_size: usize) -> Self {
        Self {
            block_alloc_size,
            blocks: Mutex::new(Default::default()),
            state: Mutex::new(AllocationState::default()),
            meta_block: Mutex::new(INVALID_BLOCK),
        }
    }
}

impl Default for InMemoryBlockManager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_ALLOC_SIZE)
    }
}

impl BlockManager for InMemoryBlockManager {
    fn block_alloc_size(&self) -> usize {
        self.block_alloc_size
    }

    fn allocate_block(&self) -> u64 {
        let mut state = self.state.lock();
        let block_id = match state.free_list.pop_first() {
            Some(id) => id,
            None => {
                let id = state.max_block;
                state.max_block += 1;
                id
            }
        };
        state.used_blocks.insert(block_id);
        block_id
    }

    fn peek_free_block(&self) -> u64 {
        let state = self.state.lock();
        state.free_list.first().copied().unwrap_or(state.max_block)
    }

    fn mark_free(&self, block_id: u64) {
        let mut state = self.state.lock();
        state.used_blocks.remove(&block_id);
        state.modified_blocks.remove(&block_id);
        state.free_list.insert(block_id);
        self.blocks.lock().remove(&block_id);
    }

    fn mark_used(&self, block_id: u64) {
        let mut state = self.state.lock();
        state.free_list.remove(&block_id);
        state.used_blocks.insert(block_id);
    }

    fn mark_modified(&self, block_id: u64) {
        self.state.lock().modified_blocks.insert(block_id);
    }

    fn read_block(&self, block_id: u64) -> Result<Vec<u8>> {
        let blocks = self.blocks.lock();
        let buffer = blocks
            .get(&block_id)
            .ok_or(StoreError::BlockOutOfRange { block_id, total: self.total_blocks() })?;
        verify_checksum(block_id, buffer)?;
        Ok(buffer.clone())
    }

    fn write_block(&self, block_id: u64, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), self.block_alloc_size);
        stamp_checksum(buffer);
        self.blocks.lock().insert(block_id, buffer.to_vec());
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.state.lock().max_block
    }

    fn free_blocks(&self) -> u64 {
        self.state.lock().free_list.len() as u64
    }

    fn meta_block(&self) -> u64 {
        *self.meta_block.lock()
    }

    fn set_meta_block(&self, block_id: u64) {
        *self.meta_block.lock() = block_id;
    }

    fn in_memory(&self) -> bool {
        true
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn allocate_prefers_lowest_free_id() {
        let mgr = InMemoryBlockManager::default();
        assert_eq!(mgr.allocate_block(), 0);
        assert_eq!(mgr.allocate_block(), 1);
        assert_eq!(mgr.allocate_block(), 2);
        mgr.mark_free(1);
        assert_eq!(mgr.peek_free_block(), 1);
        assert_eq!(mgr.allocate_block(), 1);
        assert_eq!(mgr.allocate_block(), 3);
    }

    #[test]
    fn block_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mgr = SingleFileBlockManager::create_new(&path, DEFAULT_BLOCK_ALLOC_SIZE).unwrap();

        let id = mgr.allocate_block();
        let mut buffer = vec![0u8; mgr.block_alloc_size()];
        buffer[CHECKSUM_SIZE..CHECKSUM_SIZE + 4].copy_from_slice(b"data");
        mgr.write_block(id, &mut buffer).unwrap();
        mgr.sync().unwrap();

        let read = mgr.read_block(id).unwrap();
        assert_eq!(&read[CHECKSUM_SIZE..CHECKSUM_SIZE + 4], b"data");
    }

    #[test]
    fn corrupted_block_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mgr = SingleFileBlockManager::create_new(&path, DEFAULT_BLOCK_ALLOC_SIZE).unwrap();
        let id = mgr.allocate_block();
        let mut buffer = vec![7u8; mgr.block_alloc_size()];
        mgr.write_block(id, &mut buffer).unwrap();
        mgr.write_header(DatabaseHeader::new(DEFAULT_BLOCK_ALLOC_SIZE as u64)).unwrap();
        drop(mgr);

        // Flip one payload byte on disk.
        use std::io::{Seek, SeekFrom, Write};
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(BLOCK_START + CHECKSUM_SIZE as u64 + 100)).unwrap();
        file.write_all(&[0]).unwrap();
        drop(file);

        let (mgr, _) =
            SingleFileBlockManager::open_existing(&path, DEFAULT_BLOCK_ALLOC_SIZE).unwrap();
        assert_matches!(mgr.read_block(id), Err(StoreError::ChecksumMismatch { block_id: 0 }));
    }

    #[test]
    fn newer_header_wins_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mgr =
                SingleFileBlockManager::create_new(&path, DEFAULT_BLOCK_ALLOC_SIZE).unwrap();
            mgr.allocate_block();
            let header = DatabaseHeader::new(DEFAULT_BLOCK_ALLOC_SIZE as u64);
            mgr.write_header(header).unwrap();
            mgr.write_header(header).unwrap();
        }
        let (_, active) =
            SingleFileBlockManager::open_existing(&path, DEFAULT_BLOCK_ALLOC_SIZE).unwrap();
        assert_eq!(active.iteration, 2);
        assert_eq!(active.block_count, 1);
    }
}
