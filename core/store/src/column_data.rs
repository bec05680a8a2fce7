use crate::block_manager::{BlockManager, CHECKSUM_SIZE};
use crate::buffer_pool::BufferPool;
use crate::data_pointer::DataPointer;
use crate::partial_block::PartialBlockManager;
use crate::statistics::BaseStatistics;
use crate::{Result, StoreError};
use byteorder::{ByteOrder, LittleEndian};
use otter_primitives::{LogicalType, PhysicalType, Value, Vector};

/// One column of one row group: the in-memory rows, the per-column
/// statistics, and (after a checkpoint or on load) the on-disk segment list.
///
/// Appends always go to the in-memory vector; checkpoint serializes it into
/// immutable segments through the partial block manager. A column loaded
/// from disk materializes lazily on first access.
#[derive(Debug, Clone)]
pub struct ColumnData {
    ty: LogicalType,
    rows: Vector,
    stats: BaseStatistics,
    pointers: Vec<DataPointer>,
    loaded: bool,
}

impl ColumnData {
    pub fn new(ty: LogicalType) -> Self {
        Self {
            rows: Vector::empty(ty.clone()),
            stats: BaseStatistics::new(ty.clone()),
            ty,
            pointers: Vec::new(),
            loaded: true,
        }
    }

    pub fn from_pointers(ty: LogicalType, pointers: Vec<DataPointer>) -> Self {
        Self {
            rows: Vector::empty(ty.clone()),
            stats: BaseStatistics::new(ty.clone()),
            ty,
            pointers,
            loaded: false,
        }
    }

    pub fn ty(&self) -> &LogicalType {
        &self.ty
    }

    pub fn stats(&self) -> &BaseStatistics {
        &self.stats
    }

    pub fn row_count(&self) -> usize {
        if self.loaded {
            self.rows.len()
        } else {
            self.pointers.iter().map(|p| p.tuple_count as usize).sum()
        }
    }

    /// Append `count` rows from `vector`, starting at its row `offset`.
    pub fn append(&mut self, vector: &Vector, offset: usize, count: usize) -> Result<()> {
        debug_assert!(self.loaded, "append to unloaded column");
        for row in offset..offset + count {
            self.rows.push_value(&vector.value(row))?;
        }
        let appended = vector.slice(&(offset..offset + count).collect::<Vec<_>>());
        self.stats.update(&appended, count);
        Ok(())
    }

    /// Materialize on-disk segments into the in-memory vector.
    pub fn ensure_loaded(
        &mut self,
        block_manager: &dyn BlockManager,
        buffer_pool: &BufferPool,
    ) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let mut rows = Vector::empty(self.ty.clone());
        for pointer in &self.pointers {
            let block = buffer_pool.read(block_manager, pointer.block_pointer.block_id)?;
            let start = CHECKSUM_SIZE + pointer.block_pointer.offset as usize;
            let bytes = &block[start..start + pointer.segment_size as usize];
            decode_segment(&self.ty, bytes, &mut rows)?;
        }
        // rebuild statistics from the materialized rows
        let count = rows.len();
        self.stats = BaseStatistics::new(self.ty.clone());
        self.stats.update(&rows, count);
        self.rows = rows;
        self.loaded = true;
        Ok(())
    }

    /// Copy `count` rows starting at `row_offset` into a fresh vector.
    pub fn scan(&self, row_offset: usize, count: usize) -> Vector {
        debug_assert!(self.loaded);
        let sel: Vec<usize> = (row_offset..row_offset + count).collect();
        self.rows.slice(&sel)
    }

    pub fn fetch_value(&self, row_offset: usize) -> Value {
        debug_assert!(self.loaded);
        self.rows.value(row_offset)
    }

    /// In-place update of the latest version of a row.
    pub fn set_value(&mut self, row_offset: usize, value: &Value) -> Result<()> {
        debug_assert!(self.loaded);
        self.rows.set_value(row_offset, value)?;
        let single = self.rows.slice(&[row_offset]);
        self.stats.update(&single, 1);
        Ok(())
    }

    /// Serialize all rows into one or more segments, each fitting a single
    /// block payload, and return their pointers.
    pub fn checkpoint(
        &mut self,
        partial: &mut PartialBlockManager,
        row_start: u64,
    ) -> Result<Vec<DataPointer>> {
        debug_assert!(self.loaded);
        let payload_budget = partial_budget(partial);
        let total = self.rows.len();
        let mut pointers = Vec::new();
        let mut row = 0usize;
        while row < total {
            let mut end = row;
            let mut encoded_size = SEGMENT_HEADER_SIZE;
            while end < total {
                let row_size = encoded_row_size(&self.ty, &self.rows, end)?;
                // validity bitmap grows with the row count
                let with_row = encoded_size + row_size + 1;
                if with_row > payload_budget && end > row {
                    break;
                }
                encoded_size = with_row;
                end += 1;
                if encoded_size > payload_budget {
                    return Err(StoreError::SegmentTooLarge {
                        size: encoded_size,
                        max: payload_budget,
                    });
                }
            }
            let bytes = encode_segment(&self.ty, &self.rows, row, end - row)?;
            let block_pointer = partial.append(&bytes)?;
            pointers.push(DataPointer {
                row_start: row_start + row as u64,
                tuple_count: (end - row) as u64,
                block_pointer,
                compression: 0,
                segment_size: bytes.len() as u64,
            });
            row = end;
        }
        self.pointers = pointers.clone();
        Ok(pointers)
    }
}

const SEGMENT_HEADER_SIZE: usize = 4;

fn partial_budget(partial: &PartialBlockManager) -> usize {
    partial.block_payload_size()
}

fn encoded_row_size(ty: &LogicalType, rows: &Vector, row: usize) -> Result<usize> {
    Ok(match ty.physical_type() {
        PhysicalType::Bool | PhysicalType::Int8 | PhysicalType::UInt8 => 1,
        PhysicalType::Int16 | PhysicalType::UInt16 => 2,
        PhysicalType::Int32 | PhysicalType::UInt32 | PhysicalType::Float32 => 4,
        PhysicalType::Int64 | PhysicalType::UInt64 | PhysicalType::Float64 => 8,
        PhysicalType::Int128 | PhysicalType::UInt128 => 16,
        PhysicalType::Bytes => match rows.value(row) {
            Value::String(s) => 4 + s.len(),
            _ => 4,
        },
        PhysicalType::Nested => {
            return Err(StoreError::UnsupportedColumnType(format!("{ty}")));
        }
    })
}

/// Segment layout: `count: u32`, byte-packed validity bitmap, then the
/// row payloads in physical order. Strings are `u32` length-prefixed.
fn encode_segment(ty: &LogicalType, rows: &Vector, offset: usize, count: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&(count as u32).to_le_bytes());

    let mut validity = vec![0u8; count.div_ceil(8)];
    for i in 0..count {
        if !rows.is_null(offset + i) {
            validity[i / 8] |= 1 << (i % 8);
        }
    }
    out.extend_from_slice(&validity);

    macro_rules! encode_fixed {
        ($slice:expr, $width:expr, $write:expr) => {{
            let data = $slice;
            let mut buf = [0u8; 16];
            for i in 0..count {
                $write(&mut buf, data[offset + i]);
                out.extend_from_slice(&buf[..$width]);
            }
        }};
    }

    match ty.physical_type() {
        PhysicalType::Bool => {
            for i in 0..count {
                out.push(rows.bools()[offset + i] as u8);
            }
        }
        PhysicalType::Int8 => {
            for i in 0..count {
                out.push(rows.i8s()[offset + i] as u8);
            }
        }
        PhysicalType::UInt8 => out.extend_from_slice(&rows.u8s()[offset..offset + count]),
        PhysicalType::Int16 => {
            encode_fixed!(rows.i16s(), 2, |b: &mut [u8], v: i16| LittleEndian::write_i16(b, v))
        }
        PhysicalType::UInt16 => {
            encode_fixed!(rows.u16s(), 2, |b: &mut [u8], v: u16| LittleEndian::write_u16(b, v))
        }
        PhysicalType::Int32 => {
            encode_fixed!(rows.i32s(), 4, |b: &mut [u8], v: i32| LittleEndian::write_i32(b, v))
        }
        PhysicalType::UInt32 => {
            encode_fixed!(rows.u32s(), 4, |b: &mut [u8], v: u32| LittleEndian::write_u32(b, v))
        }
        PhysicalType::Float32 => {
            encode_fixed!(rows.f32s(), 4, |b: &mut [u8], v: f32| LittleEndian::write_f32(b, v))
        }
        PhysicalType::Int64 => {
            encode_fixed!(rows.i64s(), 8, |b: &mut [u8], v: i64| LittleEndian::write_i64(b, v))
        }
        PhysicalType::UInt64 => {
            encode_fixed!(rows.u64s(), 8, |b: &mut [u8], v: u64| LittleEndian::write_u64(b, v))
        }
        PhysicalType::Float64 => {
            encode_fixed!(rows.f64s(), 8, |b: &mut [u8], v: f64| LittleEndian::write_f64(b, v))
        }
        PhysicalType::Int128 => {
            encode_fixed!(rows.i128s(), 16, |b: &mut [u8], v: i128| LittleEndian::write_i128(b, v))
        }
        PhysicalType::UInt128 => {
            encode_fixed!(rows.u128s(), 16, |b: &mut [u8], v: u128| LittleEndian::write_u128(
                b, v
            ))
        }
        PhysicalType::Bytes => {
            for i in 0..count {
                let s = &rows.strs()[offset + i];
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
        PhysicalType::Nested => {
            return Err(StoreError::UnsupportedColumnType(format!("{ty}")));
        }
    }
    Ok(out)
}

fn decode_segment(ty: &LogicalType, bytes: &[u8], out: &mut Vector) -> Result<()> {
    if bytes.len() < SEGMENT_HEADER_SIZE {
        return Err(StoreError::MetadataExhausted);
    }
    let count = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let validity_len = count.div_ceil(8);
    let validity = &bytes[4..4 + validity_len];
    let mut cursor = 4 + validity_len;

    macro_rules! decode_fixed {
        ($width:expr, $read:expr, $value:expr) => {{
            for i in 0..count {
                let valid = validity[i / 8] & (1 << (i % 8)) != 0;
                let raw = $read(&bytes[cursor..cursor + $width]);
                cursor += $width;
                if valid {
                    out.push_value(&$value(raw))?;
                } else {
                    out.push_value(&Value::Null)?;
                }
            }
        }};
    }

    match ty.physical_type() {
        PhysicalType::Bool => {
            decode_fixed!(1, |b: &[u8]| b[0], |v: u8| Value::Boolean(v != 0))
        }
        PhysicalType::Int8 => decode_fixed!(1, |b: &[u8]| b[0] as i8, Value::Int8),
        PhysicalType::UInt8 => decode_fixed!(1, |b: &[u8]| b[0], Value::UInt8),
        PhysicalType::Int16 => decode_fixed!(2, LittleEndian::read_i16, Value::Int16),
        PhysicalType::UInt16 => decode_fixed!(2, LittleEndian::read_u16, Value::UInt16),
        PhysicalType::Int32 => decode_fixed!(4, LittleEndian::read_i32, Value::Int32),
        PhysicalType::UInt32 => match ty {
            LogicalType::Enum { .. } => decode_fixed!(4, LittleEndian::read_u32, Value::Enum),
            _ => decode_fixed!(4, LittleEndian::read_u32, Value::UInt32),
        },
        PhysicalType::Float32 => decode_fixed!(4, LittleEndian::read_f32, Value::Float),
        PhysicalType::Int64 => match ty {
            LogicalType::Decimal { width, scale } => {
                decode_fixed!(8, LittleEndian::read_i64, |v: i64| Value::Decimal {
                    value: v,
                    width: *width,
                    scale: *scale,
                })
            }
            LogicalType::Timestamp(unit) => {
                decode_fixed!(8, LittleEndian::read_i64, |v: i64| Value::Timestamp {
                    value: v,
                    unit: *unit,
                })
            }
            _ => decode_fixed!(8, LittleEndian::read_i64, Value::Int64),
        },
        PhysicalType::UInt64 => decode_fixed!(8, LittleEndian::read_u64, Value::UInt64),
        PhysicalType::Float64 => decode_fixed!(8, LittleEndian::read_f64, Value::Double),
        PhysicalType::Int128 => decode_fixed!(16, LittleEndian::read_i128, Value::Int128),
        PhysicalType::UInt128 => decode_fixed!(16, LittleEndian::read_u128, Value::UInt128),
        PhysicalType::Bytes => {
            for i in 0..count {
                let valid = validity[i / 8] & (1 << (i % 8)) != 0;
                let len = LittleEndian::read_u32(&bytes[cursor..cursor + 4]) as usize;
                cursor += 4;
                let s = String::from_utf8_lossy(&bytes[cursor..cursor + len]).into_owned();
                cursor += len;
                if valid {
                    out.push_value(&Value::String(s))?;
                } else {
                    out.push_value(&Value::Null)?;
                }
            }
        }
        PhysicalType::Nested => {
            return Err(StoreError::UnsupportedColumnType(format!("{ty}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::InMemoryBlockManager;
    use std::sync::Arc;

    fn int_column(values: &[Option<i64>]) -> ColumnData {
        let mut column = ColumnData::new(LogicalType::Int64);
        let mut vec = Vector::with_len(LogicalType::Int64, values.len());
        for (row, v) in values.iter().enumerate() {
            match v {
                Some(v) => vec.set_value(row, &Value::Int64(*v)).unwrap(),
                None => vec.set_value(row, &Value::Null).unwrap(),
            }
        }
        column.append(&vec, 0, values.len()).unwrap();
        column
    }

    #[test]
    fn append_updates_statistics() {
        let column = int_column(&[Some(5), None, Some(-2)]);
        assert_eq!(column.row_count(), 3);
        assert_eq!(column.stats().min(), &Value::Int64(-2));
        assert_eq!(column.stats().max(), &Value::Int64(5));
        assert_eq!(column.stats().null_count(), 1);
    }

    #[test]
    fn checkpoint_and_reload_round_trip() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut partial = PartialBlockManager::new(Arc::clone(&bm));
        let pool = BufferPool::new(1 << 20, bm.block_alloc_size());

        let mut column = int_column(&[Some(1), Some(2), None, Some(4)]);
        let pointers = column.checkpoint(&mut partial, 0).unwrap();
        partial.flush().unwrap();
        assert_eq!(pointers.len(), 1);
        assert_eq!(pointers[0].tuple_count, 4);

        let mut loaded = ColumnData::from_pointers(LogicalType::Int64, pointers);
        loaded.ensure_loaded(bm.as_ref(), &pool).unwrap();
        assert_eq!(loaded.row_count(), 4);
        assert_eq!(loaded.fetch_value(0), Value::Int64(1));
        assert_eq!(loaded.fetch_value(2), Value::Null);
        assert_eq!(loaded.fetch_value(3), Value::Int64(4));
    }

    #[test]
    fn string_segments_round_trip() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut partial = PartialBlockManager::new(Arc::clone(&bm));
        let pool = BufferPool::new(1 << 20, bm.block_alloc_size());

        let mut column = ColumnData::new(LogicalType::String);
        let mut vec = Vector::with_len(LogicalType::String, 3);
        vec.set_value(0, &Value::String("alpha".into())).unwrap();
        vec.set_value(1, &Value::Null).unwrap();
        vec.set_value(2, &Value::String("omega".into())).unwrap();
        column.append(&vec, 0, 3).unwrap();

        let pointers = column.checkpoint(&mut partial, 100).unwrap();
        partial.flush().unwrap();
        assert_eq!(pointers[0].row_start, 100);

        let mut loaded = ColumnData::from_pointers(LogicalType::String, pointers);
        loaded.ensure_loaded(bm.as_ref(), &pool).unwrap();
        assert_eq!(loaded.fetch_value(0), Value::String("alpha".into()));
        assert_eq!(loaded.fetch_value(1), Value::Null);
        assert_eq!(loaded.fetch_value(2), Value::String("omega".into()));
    }
}
